//! Types, wire frames, errors and crypto contracts shared by every meshrelay crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod ratchet;
pub mod session;
pub mod types;

pub use error::{CloudError, CryptoError, MeshRelayError, RelayDrop, TransportError};
pub use identity::Identity;
pub use protocol::{
    BlobUploaded, ChatMessage, Hello, PendingHandles, RelayEnvelope, RendezvousNotify, WireMessage,
};
pub use types::{
    ConnectionState, DeliveryMethod, DeliveryStatus, MessageId, NetworkId, PeerHandle, PeerKey,
};
