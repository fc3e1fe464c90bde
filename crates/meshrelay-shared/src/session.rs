//! Call contracts of the cryptographic collaborators.
//!
//! The delivery engine never looks inside a ciphertext. It only needs a
//! long-term identity that can agree on a secret with a peer, and a ratchet
//! provider that turns that secret into a per-peer session.

use std::sync::{Arc, Mutex};

use crate::error::CryptoError;
use crate::types::PeerKey;

/// Output of the identity-level key agreement with one peer.
pub type SharedSecret = [u8; 32];

/// Long-term identity keys of the local node.
pub trait IdentityCrypto: Send + Sync {
    /// Public key peers address us by.
    fn local_key(&self) -> PeerKey;

    /// Static key agreement with `peer`. Fails with `InvalidKey`.
    fn compute_shared_secret(&self, peer: &PeerKey) -> Result<SharedSecret, CryptoError>;

    /// Seal `plaintext` to `peer` without any session state.
    fn encrypt(&self, plaintext: &[u8], peer: &PeerKey) -> Result<Vec<u8>, CryptoError>;

    /// Open an envelope sealed to us. Fails with `DecryptionFailed`.
    fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Stateful per-peer ratchet.
pub trait RatchetSession: Send {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Fails with `OutOfOrder` (retryable) or `AuthenticationFailed` (terminal).
    fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub type SessionHandle = Arc<Mutex<dyn RatchetSession>>;

pub trait RatchetSessionProvider: Send + Sync {
    fn get_or_create_session(
        &self,
        peer: &PeerKey,
        secret: &SharedSecret,
        is_initiator: bool,
    ) -> Result<SessionHandle, CryptoError>;
}

/// Both sides must agree on roles without a round trip: the lower key initiates.
pub fn is_initiator(local: &PeerKey, peer: &PeerKey) -> bool {
    local < peer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_complementary() {
        let a = PeerKey([1u8; 32]);
        let b = PeerKey([2u8; 32]);
        assert!(is_initiator(&a, &b));
        assert!(!is_initiator(&b, &a));
    }
}
