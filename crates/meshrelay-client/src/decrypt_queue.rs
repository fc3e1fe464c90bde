//! Out-of-order decryption queue.
//!
//! Flooding gives no per-sender ordering, so a ratchet message can arrive
//! before the ones that advance the chain to it. Such messages are parked
//! per sender and retried on a timer, or right after another message from
//! the same sender decrypts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use meshrelay_shared::error::{CryptoError, MeshRelayError};
use meshrelay_shared::types::{MessageId, PeerKey};
use meshrelay_store::PendingDecryption;

use crate::cipher::SessionCipher;
use crate::guard::RunGuard;
use crate::message_store::{lock_db, storage_error, SharedDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    AlreadyQueued,
    /// Sender already has the maximum number of parked messages.
    Full,
}

/// What happened to a parked message on retry.
#[derive(Debug)]
pub enum Resolution {
    Decrypted {
        entry: PendingDecryption,
        plaintext: Vec<u8>,
    },
    /// Terminal failure. The entry is gone from the queue.
    Rejected {
        entry: PendingDecryption,
        error: CryptoError,
    },
}

pub struct DecryptQueue {
    queues: Mutex<HashMap<PeerKey, VecDeque<PendingDecryption>>>,
    db: SharedDatabase,
    per_sender_cap: usize,
    sweeping: AtomicBool,
}

impl DecryptQueue {
    pub fn load(db: SharedDatabase, per_sender_cap: usize) -> Result<Self, MeshRelayError> {
        let mut queues: HashMap<PeerKey, VecDeque<PendingDecryption>> = HashMap::new();
        for entry in lock_db(&db).pending_decrypts().map_err(storage_error)? {
            queues.entry(entry.sender()).or_default().push_back(entry);
        }
        Ok(Self {
            queues: Mutex::new(queues),
            db,
            per_sender_cap: per_sender_cap.max(1),
            sweeping: AtomicBool::new(false),
        })
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<PeerKey, VecDeque<PendingDecryption>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, entry: PendingDecryption) -> Result<Enqueued, MeshRelayError> {
        let sender = entry.sender();
        let mut queues = self.queues();
        let queue = queues.entry(sender).or_default();

        if queue.iter().any(|e| e.message.id == entry.message.id) {
            return Ok(Enqueued::AlreadyQueued);
        }
        if queue.len() >= self.per_sender_cap {
            warn!(
                sender = %sender.short(),
                msg_id = %entry.message.id,
                cap = self.per_sender_cap,
                "Pending decryption queue full, dropping message"
            );
            return Ok(Enqueued::Full);
        }

        lock_db(&self.db)
            .enqueue_pending_decrypt(&entry)
            .map_err(storage_error)?;
        debug!(
            sender = %sender.short(),
            msg_id = %entry.message.id,
            queued = queue.len() + 1,
            "Parked message for later decryption"
        );
        queue.push_back(entry);
        Ok(Enqueued::Queued)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.queues()
            .values()
            .any(|q| q.iter().any(|e| &e.message.id == id))
    }

    pub fn len(&self) -> usize {
        self.queues().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, sender: &PeerKey) -> usize {
        self.queues().get(sender).map_or(0, VecDeque::len)
    }

    /// Retry one sender's parked messages in arrival order, passing over
    /// the queue again as long as a pass made progress.
    pub fn retry_sender(&self, sender: &PeerKey, cipher: &SessionCipher) -> Vec<Resolution> {
        let mut queues = self.queues();
        let Some(queue) = queues.get_mut(sender) else {
            return Vec::new();
        };

        let mut resolved = Vec::new();
        loop {
            let mut progress = false;
            let mut kept = VecDeque::with_capacity(queue.len());

            while let Some(entry) = queue.pop_front() {
                match cipher.decrypt(sender, &entry.message.ciphertext) {
                    Ok(plaintext) => {
                        progress = true;
                        resolved.push(Resolution::Decrypted { entry, plaintext });
                    }
                    Err(error) if !error.is_retryable() => {
                        resolved.push(Resolution::Rejected { entry, error });
                    }
                    Err(_) => kept.push_back(entry),
                }
            }
            *queue = kept;

            if !progress || queue.is_empty() {
                break;
            }
        }

        if queue.is_empty() {
            queues.remove(sender);
        }
        drop(queues);

        if !resolved.is_empty() {
            let db = lock_db(&self.db);
            for resolution in &resolved {
                let id = match resolution {
                    Resolution::Decrypted { entry, .. } | Resolution::Rejected { entry, .. } => {
                        entry.message.id
                    }
                };
                if let Err(e) = db.remove_pending_decrypt(id) {
                    warn!(msg_id = %id, error = %e, "Failed to remove parked message");
                }
            }
        }
        resolved
    }

    /// Retry every sender. `None` if another sweep is still running.
    pub fn sweep(&self, cipher: &SessionCipher) -> Option<Vec<Resolution>> {
        let _guard = RunGuard::try_acquire(&self.sweeping)?;

        let senders: Vec<PeerKey> = self.queues().keys().copied().collect();
        let mut resolved = Vec::new();
        for sender in senders {
            resolved.extend(self.retry_sender(&sender, cipher));
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use meshrelay_shared::protocol::ChatMessage;
    use meshrelay_shared::ratchet::ChainRatchetProvider;
    use meshrelay_shared::types::DeliveryMethod;
    use meshrelay_shared::Identity;
    use meshrelay_store::Database;

    struct Pair {
        alice: SessionCipher,
        bob: SessionCipher,
        alice_key: PeerKey,
        bob_key: PeerKey,
    }

    fn pair() -> Pair {
        let a = Identity::generate();
        let b = Identity::generate();
        Pair {
            alice_key: a.peer_key(),
            bob_key: b.peer_key(),
            alice: SessionCipher::new(Arc::new(a), Arc::new(ChainRatchetProvider::new())),
            bob: SessionCipher::new(Arc::new(b), Arc::new(ChainRatchetProvider::new())),
        }
    }

    fn parked(p: &Pair, ciphertext: Vec<u8>) -> PendingDecryption {
        PendingDecryption {
            message: ChatMessage {
                id: MessageId::new(),
                sender: p.alice_key,
                recipient: p.bob_key,
                timestamp: Utc::now(),
                ciphertext,
                media_ref: None,
            },
            method: DeliveryMethod::Mesh,
            enqueued_at: Utc::now(),
        }
    }

    fn queue(cap: usize) -> (SharedDatabase, DecryptQueue) {
        let db: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let queue = DecryptQueue::load(db.clone(), cap).unwrap();
        (db, queue)
    }

    #[test]
    fn test_cap_drops_new_arrival() {
        let p = pair();
        let (_db, queue) = queue(50);
        for _ in 0..50 {
            assert_eq!(queue.enqueue(parked(&p, vec![0u8; 40])).unwrap(), Enqueued::Queued);
        }
        assert_eq!(queue.enqueue(parked(&p, vec![0u8; 40])).unwrap(), Enqueued::Full);
        assert_eq!(queue.len_for(&p.alice_key), 50);
    }

    #[test]
    fn test_resolves_chain_in_any_arrival_order() {
        let p = pair();
        let (db, queue) = queue(50);
        let cts: Vec<Vec<u8>> = (0..4)
            .map(|i| p.alice.encrypt(&p.bob_key, format!("m{i}").as_bytes()).unwrap())
            .collect();

        // Arrived 3, 2, 1 while 0 is still in flight
        for ct in cts[1..].iter().rev() {
            assert!(p.bob.decrypt(&p.alice_key, ct).unwrap_err().is_retryable());
            queue.enqueue(parked(&p, ct.clone())).unwrap();
        }
        assert!(queue.retry_sender(&p.alice_key, &p.bob).is_empty());

        p.bob.decrypt(&p.alice_key, &cts[0]).unwrap();
        let resolved = queue.retry_sender(&p.alice_key, &p.bob);

        let plaintexts: Vec<Vec<u8>> = resolved
            .into_iter()
            .map(|r| match r {
                Resolution::Decrypted { plaintext, .. } => plaintext,
                Resolution::Rejected { error, .. } => panic!("unexpected rejection: {error}"),
            })
            .collect();
        assert_eq!(plaintexts, vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
        assert!(queue.is_empty());
        assert!(lock_db(&db).pending_decrypts().unwrap().is_empty());
    }

    #[test]
    fn test_authentication_failure_is_rejected() {
        let p = pair();
        let (_db, queue) = queue(50);
        let ct = p.alice.encrypt(&p.bob_key, b"once").unwrap();
        p.bob.decrypt(&p.alice_key, &ct).unwrap();

        // Replay of an already consumed counter
        let replay = parked(&p, ct);
        let id = replay.message.id;
        queue.enqueue(replay).unwrap();

        let resolved = queue.sweep(&p.bob).unwrap();
        assert!(matches!(
            resolved.as_slice(),
            [Resolution::Rejected { entry, error: CryptoError::AuthenticationFailed }]
                if entry.message.id == id
        ));
        assert!(!queue.contains(&id));
    }

    #[test]
    fn test_reload_keeps_order() {
        let p = pair();
        let (db, queue) = queue(50);
        let first = parked(&p, vec![1u8; 40]);
        let second = parked(&p, vec![2u8; 40]);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();
        assert_eq!(queue.enqueue(first.clone()).unwrap(), Enqueued::AlreadyQueued);
        drop(queue);

        let reloaded = DecryptQueue::load(db, 50).unwrap();
        assert_eq!(reloaded.len_for(&p.alice_key), 2);
        assert!(reloaded.contains(&first.message.id));
        assert!(reloaded.contains(&second.message.id));
    }
}
