use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_SEALED_BOX, NONCE_SIZE, PUBKEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// XChaCha20-Poly1305 with a random nonce. Output is `nonce || ciphertext`;
/// `aad` is authenticated but not included.
pub fn aead_seal(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = XChaCha20Poly1305::new(key.into())
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok([nonce.as_slice(), sealed.as_slice()].concat())
}

pub fn aead_open(key: &SymmetricKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, sealed) = data.split_at(NONCE_SIZE);

    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Anonymous sealed box: ephemeral X25519 public key || nonce || ciphertext.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let key = sealed_box_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient);
    let body = aead_seal(&key, plaintext, ephemeral_public.as_bytes())?;
    Ok([ephemeral_public.as_bytes().as_slice(), body.as_slice()].concat())
}

pub fn open(recipient_secret: &StaticSecret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < PUBKEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, body) = data.split_at(PUBKEY_SIZE);
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(ephemeral_bytes);

    let shared = recipient_secret.diffie_hellman(&PublicKey::from(ephemeral));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let recipient_public = PublicKey::from(recipient_secret);
    let key = sealed_box_key(shared.as_bytes(), &ephemeral, recipient_public.as_bytes());
    aead_open(&key, body, &ephemeral)
}

// BLAKE3 KDF binding both public keys to the DH output
fn sealed_box_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEALED_BOX);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    *hasher.finalize().as_bytes()
}
