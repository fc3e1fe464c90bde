//! Transport contracts between the mesh layer and a radio/network backend.
//!
//! A backend delivers [`MeshNotification`]s on an mpsc channel and accepts
//! sends through [`MeshTransport`]. Discovery toggling and invitations go
//! through [`DiscoveryBackend`]. The libp2p backend in [`crate::swarm`] is one
//! implementation; tests plug in-memory doubles into the same seams.

use std::time::Duration;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use tracing::info;

use meshrelay_shared::error::TransportError;
use meshrelay_shared::types::{ConnectionState, NetworkId, PeerHandle};

use crate::behaviour::MeshBehaviour;
use crate::messages::network_protocol;

/// Events flowing *from* a backend to the mesh layer.
#[derive(Debug, Clone)]
pub enum MeshNotification {
    /// A browsing session saw a peer advertising.
    PeerDiscovered { handle: PeerHandle },
    /// A previously discovered peer stopped advertising.
    PeerLost { handle: PeerHandle },
    /// A remote peer asked to join one of our sessions.
    InvitationReceived { handle: PeerHandle },
    /// Link state changed (`connecting` / `connected` / `disconnected`).
    PeerStateChanged {
        handle: PeerHandle,
        state: ConnectionState,
    },
    /// A frame arrived on a link.
    FrameReceived { from: PeerHandle, data: Vec<u8> },
}

/// Best-effort, at-most-once send primitive.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Send `data` to each handle. Succeeds if at least one peer accepted it.
    async fn send(&self, data: Vec<u8>, to: &[PeerHandle]) -> Result<(), TransportError>;
}

/// Platform discovery sessions, one advertise/browse pair per network.
pub trait DiscoveryBackend: Send + Sync {
    fn start_network(&self, network: &NetworkId) -> Result<(), TransportError>;

    fn stop_network(&self, network: &NetworkId);

    /// Invite `peer` into its network's session; the backend gives up after `timeout`.
    fn invite(&self, peer: &PeerHandle, timeout: Duration);

    fn answer_invitation(&self, peer: &PeerHandle, accept: bool);
}

/// Build the libp2p swarm backing one mesh network.
pub fn build_swarm(
    keypair: Keypair,
    network: &NetworkId,
) -> anyhow::Result<libp2p::Swarm<MeshBehaviour>> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
    use libp2p::{identify, mdns, SwarmBuilder};

    use meshrelay_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE};

    let protocol = network_protocol(network);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<MeshBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            // The same frame may legitimately be published twice (mesh retry),
            // so the sequence number is part of the id.
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.topic.hash(&mut hasher);
                message.data.hash(&mut hasher);
                if let Some(ref source) = message.source {
                    source.hash(&mut hasher);
                }
                message.sequence_number.hash(&mut hasher);
                MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    format!("GossipSub config: {e}").into()
                })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                format!("GossipSub init: {e}").into()
            })?;

            let identify_config = identify::Config::new(protocol, key.public())
                .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

            Ok(MeshBehaviour {
                gossipsub,
                identify,
                mdns,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        network = %network,
        "Built mesh swarm with QUIC + mDNS"
    );

    Ok(swarm)
}
