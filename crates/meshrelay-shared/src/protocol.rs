use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_HOPS;
use crate::types::{MessageId, NetworkId, PeerKey};

/// All frames exchanged between mesh peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Identity announcement sent once a link is usable
    Hello(Hello),

    /// A chat message travelling through the mesh
    Relay(RelayEnvelope),
}

/// Binds the sender's public key to the link it arrived on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub peer_key: PeerKey,
    pub network: NetworkId,
}

/// An end-to-end encrypted chat message. Transport agnostic: the same bytes
/// go over the mesh and to the cloud relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Globally unique, used for dedup at every hop and at the store
    pub id: MessageId,
    pub sender: PeerKey,
    pub recipient: PeerKey,
    pub timestamp: DateTime<Utc>,
    /// Ratchet ciphertext produced by the sender's session
    pub ciphertext: Vec<u8>,
    /// Optional reference to out-of-band media
    pub media_ref: Option<String>,
}

impl ChatMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Flood relay wrapper around a [`ChatMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub message: ChatMessage,
    pub hop_count: u32,
    pub max_hops: u32,
    /// Relayers in forwarding order
    pub seen_by: Vec<PeerKey>,
}

impl RelayEnvelope {
    /// Wrap a message as it first enters the mesh.
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            hop_count: 0,
            max_hops: MAX_HOPS,
            seen_by: Vec::new(),
        }
    }

    /// Hop ceiling in effect. A frame can lower it but never raise it
    /// above `MAX_HOPS`.
    pub fn hop_limit(&self) -> u32 {
        self.max_hops.min(MAX_HOPS)
    }

    pub fn is_exhausted(&self) -> bool {
        self.hop_count >= self.hop_limit()
    }

    pub fn was_relayed_by(&self, peer: &PeerKey) -> bool {
        self.seen_by.contains(peer)
    }

    /// The envelope as forwarded by `relayer`: one more hop, relayer appended.
    pub fn forwarded_by(&self, relayer: PeerKey) -> Self {
        let mut next = self.clone();
        next.hop_count = self.hop_count.saturating_add(1);
        next.max_hops = self.hop_limit();
        if !next.seen_by.contains(&relayer) {
            next.seen_by.push(relayer);
        }
        next
    }
}

impl WireMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// ---------------------------------------------------------------------------
// Cloud relay HTTP bodies
// ---------------------------------------------------------------------------

/// Response to a blob upload: the content address of the stored bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobUploaded {
    pub handle: String,
}

/// Leave a content handle in a peer's rendezvous mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RendezvousNotify {
    pub handle: String,
}

/// Handles drained from a rendezvous mailbox, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingHandles {
    pub handles: Vec<String>,
}
