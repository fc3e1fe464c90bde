// Mesh transport layer: discovery policy, peer registry, routing, and a
// libp2p backend with QUIC transport.

pub mod behaviour;
pub mod discovery;
pub mod messages;
pub mod peers;
pub mod router;
pub mod swarm;
pub mod transport;

pub use behaviour::{MeshBehaviour, MeshEvent};
pub use discovery::{DiscoveryController, DiscoveryTimings, LinkEvent};
pub use peers::{ConnectionInfo, PeerRegistry};
pub use router::{lock_registry, MeshRouter, Route, SharedRegistry};
pub use swarm::{spawn_mesh, spawn_network, Libp2pMesh, SwarmCommand};
pub use transport::{build_swarm, DiscoveryBackend, MeshNotification, MeshTransport};
