//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so snapshots can be
//! handed directly to a UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meshrelay_shared::protocol::ChatMessage;
use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId, PeerAddress, PeerKey};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message in the local ledger, outgoing or incoming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: PeerKey,
    pub recipient: PeerKey,
    /// When the message was created (as reported by the sender).
    pub timestamp: DateTime<Utc>,
    /// Ratchet ciphertext exactly as it travels.
    pub ciphertext: Vec<u8>,
    /// Cached plaintext. Set by the sender before encryption and by the
    /// receiver after a successful decrypt.
    pub plaintext: Option<String>,
    pub status: DeliveryStatus,
    pub method: DeliveryMethod,
    pub media_ref: Option<String>,
    pub is_read: bool,
    /// Moved out of the active set.
    pub archived: bool,
}

impl StoredMessage {
    /// Ledger row for a wire message.
    pub fn from_chat(
        message: &ChatMessage,
        plaintext: Option<String>,
        status: DeliveryStatus,
        method: DeliveryMethod,
    ) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            recipient: message.recipient,
            timestamp: message.timestamp,
            ciphertext: message.ciphertext.clone(),
            plaintext,
            status,
            method,
            media_ref: message.media_ref.clone(),
            is_read: false,
            archived: false,
        }
    }

    /// The wire form of this message.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            sender: self.sender,
            recipient: self.recipient,
            timestamp: self.timestamp,
            ciphertext: self.ciphertext.clone(),
            media_ref: self.media_ref.clone(),
        }
    }

    /// The other party of the conversation, seen from `local`.
    pub fn peer(&self, local: &PeerKey) -> PeerKey {
        if &self.sender == local {
            self.recipient
        } else {
            self.sender
        }
    }

    pub fn is_outgoing(&self, local: &PeerKey) -> bool {
        &self.sender == local
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// A message delivered through the cloud that should still go over the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryEntry {
    pub message: ChatMessage,
    pub recipient_address: PeerAddress,
    pub enqueued_at: DateTime<Utc>,
}

/// An incoming message whose ratchet decrypt has not succeeded yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingDecryption {
    pub message: ChatMessage,
    /// Transport it arrived by, recorded once it decrypts.
    pub method: DeliveryMethod,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingDecryption {
    pub fn sender(&self) -> PeerKey {
        self.message.sender
    }
}
