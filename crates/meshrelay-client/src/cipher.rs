//! Binds the identity provider and the ratchet provider into the two calls
//! the delivery engine needs: encrypt for a peer, decrypt from a peer.

use std::sync::Arc;

use meshrelay_shared::error::CryptoError;
use meshrelay_shared::session::{
    is_initiator, IdentityCrypto, RatchetSessionProvider, SessionHandle,
};
use meshrelay_shared::types::PeerKey;

pub struct SessionCipher {
    identity: Arc<dyn IdentityCrypto>,
    ratchets: Arc<dyn RatchetSessionProvider>,
}

impl SessionCipher {
    pub fn new(
        identity: Arc<dyn IdentityCrypto>,
        ratchets: Arc<dyn RatchetSessionProvider>,
    ) -> Self {
        Self { identity, ratchets }
    }

    pub fn local_key(&self) -> PeerKey {
        self.identity.local_key()
    }

    fn session(&self, peer: &PeerKey) -> Result<SessionHandle, CryptoError> {
        let local = self.identity.local_key();
        let secret = self.identity.compute_shared_secret(peer)?;
        self.ratchets
            .get_or_create_session(peer, &secret, is_initiator(&local, peer))
    }

    pub fn encrypt(&self, peer: &PeerKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let session = self.session(peer)?;
        let mut guard = session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.encrypt(plaintext)
    }

    pub fn decrypt(&self, sender: &PeerKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let session = self.session(sender)?;
        let mut guard = session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.decrypt(ciphertext)
    }
}
