//! Strict-order symmetric hash-chain ratchet.
//!
//! Each direction of a peer pair has its own BLAKE3 chain seeded from the
//! shared secret. A message carries its chain counter in clear; the receiver
//! only accepts the counter it expects next. Anything ahead of the chain is
//! `OutOfOrder` (the sender's earlier messages are still travelling through
//! the mesh), anything behind it or failing the AEAD tag is
//! `AuthenticationFailed`. No skipped keys are kept, so buffering and
//! retrying is left to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::constants::{KDF_CONTEXT_CHAIN_ROOT, KDF_CONTEXT_CHAIN_STEP, KDF_CONTEXT_MESSAGE_KEY};
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;
use crate::session::{RatchetSession, RatchetSessionProvider, SessionHandle, SharedSecret};
use crate::types::PeerKey;

const COUNTER_SIZE: usize = 8;

struct Chain {
    key: SymmetricKey,
    counter: u64,
}

impl Chain {
    fn new(root: &SymmetricKey, label: &[u8]) -> Self {
        Self {
            key: *blake3::keyed_hash(root, label).as_bytes(),
            counter: 0,
        }
    }

    fn message_key(&self) -> SymmetricKey {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
        hasher.update(&self.key);
        hasher.update(&self.counter.to_be_bytes());
        *hasher.finalize().as_bytes()
    }

    fn advance(&mut self) {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHAIN_STEP);
        hasher.update(&self.key);
        self.key = *hasher.finalize().as_bytes();
        self.counter += 1;
    }
}

pub struct ChainSession {
    send: Chain,
    recv: Chain,
}

impl ChainSession {
    pub fn new(secret: &SharedSecret, is_initiator: bool) -> Self {
        let root = blake3::derive_key(KDF_CONTEXT_CHAIN_ROOT, secret);
        let initiator_chain = Chain::new(&root, b"initiator");
        let responder_chain = Chain::new(&root, b"responder");
        if is_initiator {
            Self {
                send: initiator_chain,
                recv: responder_chain,
            }
        } else {
            Self {
                send: responder_chain,
                recv: initiator_chain,
            }
        }
    }

    /// Counter of the next message this session expects to receive.
    pub fn receive_counter(&self) -> u64 {
        self.recv.counter
    }
}

impl RatchetSession for ChainSession {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let header = self.send.counter.to_be_bytes();
        let body = crypto::aead_seal(&self.send.message_key(), plaintext, &header)?;
        self.send.advance();
        Ok([header.as_slice(), body.as_slice()].concat())
    }

    fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() < COUNTER_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        let (counter_bytes, body) = message.split_at(COUNTER_SIZE);
        let mut raw = [0u8; COUNTER_SIZE];
        raw.copy_from_slice(counter_bytes);
        let counter = u64::from_be_bytes(raw);

        if counter > self.recv.counter {
            return Err(CryptoError::OutOfOrder);
        }
        if counter < self.recv.counter {
            return Err(CryptoError::AuthenticationFailed);
        }

        let plaintext = crypto::aead_open(&self.recv.message_key(), body, counter_bytes)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        self.recv.advance();
        Ok(plaintext)
    }
}

/// In-memory session table keyed by peer.
#[derive(Default)]
pub struct ChainRatchetProvider {
    sessions: Mutex<HashMap<PeerKey, Arc<Mutex<ChainSession>>>>,
}

impl ChainRatchetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl RatchetSessionProvider for ChainRatchetProvider {
    fn get_or_create_session(
        &self,
        peer: &PeerKey,
        secret: &SharedSecret,
        is_initiator: bool,
    ) -> Result<SessionHandle, CryptoError> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let session = sessions
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(ChainSession::new(secret, is_initiator))))
            .clone();
        let handle: SessionHandle = session;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ChainSession, ChainSession) {
        let secret = [42u8; 32];
        (ChainSession::new(&secret, true), ChainSession::new(&secret, false))
    }

    #[test]
    fn test_in_order_roundtrip() {
        let (mut alice, mut bob) = pair();

        let m0 = alice.encrypt(b"first").unwrap();
        let m1 = alice.encrypt(b"second").unwrap();

        assert_eq!(bob.decrypt(&m0).unwrap(), b"first");
        assert_eq!(bob.decrypt(&m1).unwrap(), b"second");
        assert_eq!(bob.receive_counter(), 2);

        let reply = bob.encrypt(b"ack").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"ack");
    }

    #[test]
    fn test_ahead_of_chain_is_out_of_order() {
        let (mut alice, mut bob) = pair();

        let m0 = alice.encrypt(b"first").unwrap();
        let m1 = alice.encrypt(b"second").unwrap();

        assert_eq!(bob.decrypt(&m1), Err(CryptoError::OutOfOrder));
        // Failed attempt leaves the chain untouched
        assert_eq!(bob.decrypt(&m0).unwrap(), b"first");
        assert_eq!(bob.decrypt(&m1).unwrap(), b"second");
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut alice, mut bob) = pair();
        let m0 = alice.encrypt(b"once").unwrap();

        bob.decrypt(&m0).unwrap();
        assert_eq!(bob.decrypt(&m0), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_message_is_rejected() {
        let (mut alice, mut bob) = pair();
        let mut m0 = alice.encrypt(b"payload").unwrap();
        let last = m0.len() - 1;
        m0[last] ^= 0x01;

        assert_eq!(bob.decrypt(&m0), Err(CryptoError::AuthenticationFailed));
        assert_eq!(bob.receive_counter(), 0);
    }

    #[test]
    fn test_provider_reuses_sessions() {
        let provider = ChainRatchetProvider::new();
        let peer = PeerKey([5u8; 32]);
        let secret = [1u8; 32];

        let a = provider.get_or_create_session(&peer, &secret, true).unwrap();
        let b = provider.get_or_create_session(&peer, &secret, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.session_count(), 1);
    }
}
