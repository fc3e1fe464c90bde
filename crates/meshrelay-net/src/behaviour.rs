//! Composed libp2p `NetworkBehaviour` for one mesh network.
//!
//! Combines GossipSub (per-peer inbox topics carry the frames), Identify
//! (the protocol version names the network, so foreign swarms are told
//! apart) and mDNS (local-link discovery, the radio analogue).

use libp2p::{gossipsub, identify, mdns, swarm::NetworkBehaviour};

/// Composed network behaviour for a meshrelay network session.
///
/// Construction is handled by [`super::transport::build_swarm`] via
/// `SwarmBuilder`.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeshEvent")]
pub struct MeshBehaviour {
    /// Inbox topics, one per peer
    pub gossipsub: gossipsub::Behaviour,
    /// Network membership check
    pub identify: identify::Behaviour,
    /// Local discovery
    pub mdns: mdns::tokio::Behaviour,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum MeshEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Mdns(mdns::Event),
}

impl From<gossipsub::Event> for MeshEvent {
    fn from(event: gossipsub::Event) -> Self {
        MeshEvent::Gossipsub(event)
    }
}

impl From<identify::Event> for MeshEvent {
    fn from(event: identify::Event) -> Self {
        MeshEvent::Identify(event)
    }
}

impl From<mdns::Event> for MeshEvent {
    fn from(event: mdns::Event) -> Self {
        MeshEvent::Mdns(event)
    }
}
