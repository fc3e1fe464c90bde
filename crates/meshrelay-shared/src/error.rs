use thiserror::Error;

use crate::types::{DeliveryStatus, MessageId};

#[derive(Error, Debug)]
pub enum MeshRelayError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Cloud relay error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Mesh transport failures. Always transient: they drive failover, never abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No mesh peers connected")]
    NoPeers,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Mesh send timed out after {0} ms")]
    Timeout(u64),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Transport task stopped")]
    ChannelClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Ratchet message arrived ahead of the receive chain")]
    OutOfOrder,

    #[error("Ratchet message failed authentication")]
    AuthenticationFailed,
}

impl CryptoError {
    /// Whether a later attempt may succeed once the chain has advanced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CryptoError::OutOfOrder | CryptoError::DecryptionFailed)
    }
}

/// Upload/notify/poll failures against the store-and-forward relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Rendezvous notify failed: {0}")]
    Notify(String),

    #[error("Rendezvous poll failed: {0}")]
    Poll(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Cloud relay not configured")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Stored public key does not match the secret key")]
    KeyMismatch,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Invalid delivery status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

/// Why the relay engine discarded an envelope. Logged, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDrop {
    /// Message id already in the seen cache.
    Duplicate,
    /// Envelope reached its hop ceiling.
    HopLimit,
    /// Local identity is already on the relay path.
    Loop,
}

impl std::fmt::Display for RelayDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RelayDrop::Duplicate => "duplicate",
            RelayDrop::HopLimit => "hop-limit",
            RelayDrop::Loop => "loop",
        };
        f.write_str(reason)
    }
}
