use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::KDF_CONTEXT_SHARED_SECRET;
use crate::crypto;
use crate::error::{CryptoError, IdentityError};
use crate::session::{IdentityCrypto, SharedSecret};
use crate::types::{PeerAddress, PeerKey};

/// A node's cryptographic identity based on X25519.
/// The public key serves as the peer key. No email, no phone number.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(*secret),
        }
    }

    /// Restore identity from a serialized export, checking the stored public key
    pub fn from_export(export: &IdentityExport) -> Result<Self, IdentityError> {
        let identity = Self::from_secret_bytes(&export.secret_key);
        if identity.peer_key().0 != export.public_key {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(identity)
    }

    /// Get the peer key (public key)
    pub fn peer_key(&self) -> PeerKey {
        PeerKey(PublicKey::from(&self.secret).to_bytes())
    }

    /// Short address derived from the peer key
    pub fn address(&self) -> PeerAddress {
        self.peer_key().address()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: self.secret.to_bytes(),
            public_key: self.peer_key().0,
        }
    }

    /// Load the identity key file, creating it on first run
    pub fn load_or_create(path: &std::path::Path) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let export: IdentityExport = serde_json::from_slice(&bytes)
                    .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                Self::from_export(&export)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                let json = serde_json::to_vec(&identity.to_export())
                    .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                }
                std::fs::write(path, json).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                Ok(identity)
            }
            Err(e) => Err(IdentityError::KeyFile(e.to_string())),
        }
    }
}

impl IdentityCrypto for Identity {
    fn local_key(&self) -> PeerKey {
        self.peer_key()
    }

    fn compute_shared_secret(&self, peer: &PeerKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey);
        }
        Ok(blake3::derive_key(KDF_CONTEXT_SHARED_SECRET, shared.as_bytes()))
    }

    fn encrypt(&self, plaintext: &[u8], peer: &PeerKey) -> Result<Vec<u8>, CryptoError> {
        crypto::seal(&peer.0, plaintext)
    }

    fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(&self.secret, envelope)
    }
}
