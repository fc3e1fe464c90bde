//! Topic and protocol naming for the libp2p backend.

use libp2p::gossipsub::{IdentTopic, TopicHash};
use libp2p::PeerId;

use meshrelay_shared::constants::PROTOCOL_VERSION;
use meshrelay_shared::types::NetworkId;

/// Inbox topic a peer subscribes to on a given network. Frames for that
/// peer are published here.
pub fn inbox_topic(network: &NetworkId, peer: &PeerId) -> IdentTopic {
    IdentTopic::new(format!("{}/inbox/{}", network.as_str(), peer))
}

pub fn inbox_hash(network: &NetworkId, peer: &PeerId) -> TopicHash {
    inbox_topic(network, peer).hash()
}

/// Identify protocol version advertised by swarms of `network`.
pub fn network_protocol(network: &NetworkId) -> String {
    format!("{PROTOCOL_VERSION}/{}", network.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_topics_are_per_network() {
        let peer = PeerId::random();
        let bt = inbox_hash(&NetworkId::new("meshrelay-bt"), &peer);
        let wifi = inbox_hash(&NetworkId::new("meshrelay-wifi"), &peer);
        assert_ne!(bt, wifi);
        assert_eq!(bt, inbox_hash(&NetworkId::new("meshrelay-bt"), &peer));
    }

    #[test]
    fn test_network_protocol() {
        assert_eq!(
            network_protocol(&NetworkId::new("meshrelay-wifi")),
            "/meshrelay/1.0.0/meshrelay-wifi"
        );
    }
}
