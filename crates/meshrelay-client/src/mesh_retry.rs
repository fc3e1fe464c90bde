//! Pending-mesh-retry queue.
//!
//! Messages that only made it out through the cloud relay are pushed over
//! the mesh again once a link exists. Delivery is at-least-once: the
//! recipient drops the second copy by message id.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use meshrelay_net::MeshRouter;
use meshrelay_shared::error::{MeshRelayError, TransportError};
use meshrelay_shared::protocol::{ChatMessage, RelayEnvelope, WireMessage};
use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId};
use meshrelay_store::RetryEntry;

use crate::guard::RunGuard;
use crate::message_store::{lock_db, storage_error, MessageStore, SharedDatabase};

/// Result of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub remaining: usize,
    /// Another flush was already running.
    pub skipped: bool,
}

pub struct MeshRetryQueue {
    entries: Mutex<VecDeque<RetryEntry>>,
    db: SharedDatabase,
    cap: usize,
    flushing: AtomicBool,
}

impl MeshRetryQueue {
    pub fn load(db: SharedDatabase, cap: usize) -> Result<Self, MeshRelayError> {
        let cap = cap.max(1);
        let entries = {
            let conn = lock_db(&db);
            let mut entries: VecDeque<RetryEntry> =
                conn.retry_entries().map_err(storage_error)?.into();
            while entries.len() > cap {
                if let Some(dropped) = entries.pop_front() {
                    conn.remove_retry(dropped.message.id).map_err(storage_error)?;
                }
            }
            entries
        };

        Ok(Self {
            entries: Mutex::new(entries),
            db,
            cap,
            flushing: AtomicBool::new(false),
        })
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<RetryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a cloud-delivered message. Returns `false` if it is already queued.
    pub fn enqueue(&self, message: &ChatMessage) -> Result<bool, MeshRelayError> {
        let mut entries = self.entries();
        if entries.iter().any(|e| e.message.id == message.id) {
            return Ok(false);
        }

        let entry = RetryEntry {
            message: message.clone(),
            recipient_address: message.recipient.address(),
            enqueued_at: Utc::now(),
        };
        let db = lock_db(&self.db);
        db.enqueue_retry(&entry).map_err(storage_error)?;
        entries.push_back(entry);

        while entries.len() > self.cap {
            if let Some(dropped) = entries.pop_front() {
                warn!(
                    msg_id = %dropped.message.id,
                    cap = self.cap,
                    "Mesh retry queue full, dropping oldest entry"
                );
                db.remove_retry(dropped.message.id).map_err(storage_error)?;
            }
        }
        Ok(true)
    }

    pub fn remove(&self, id: MessageId) -> Result<bool, MeshRelayError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| e.message.id != id);
        lock_db(&self.db).remove_retry(id).map_err(storage_error)?;
        Ok(entries.len() != before)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries().iter().any(|e| &e.message.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Try every queued entry over the mesh. Entries that go out are
    /// removed and their stored message switches to `method = Mesh`;
    /// failures stay queued for the next flush.
    pub async fn flush(
        &self,
        router: &MeshRouter,
        store: &MessageStore,
        timeout: Duration,
    ) -> FlushReport {
        let Some(_guard) = RunGuard::try_acquire(&self.flushing) else {
            debug!("Mesh retry flush already running, skipping");
            return FlushReport {
                skipped: true,
                remaining: self.len(),
                ..FlushReport::default()
            };
        };

        let snapshot: Vec<ChatMessage> = self.entries().iter().map(|e| e.message.clone()).collect();
        if snapshot.is_empty() || router.connected_count() == 0 {
            return FlushReport {
                remaining: snapshot.len(),
                ..FlushReport::default()
            };
        }

        let mut sent = 0;
        for message in snapshot {
            let frame = match WireMessage::Relay(RelayEnvelope::new(message.clone())).to_bytes() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(msg_id = %message.id, error = %e, "Failed to encode retry frame");
                    continue;
                }
            };

            let result = match tokio::time::timeout(timeout, router.send_to(&message.recipient, frame)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(route) => {
                    sent += 1;
                    if let Err(e) = self.remove(message.id) {
                        warn!(msg_id = %message.id, error = %e, "Failed to dequeue retried message");
                    }
                    match store.update_delivery(message.id, DeliveryStatus::Sent, DeliveryMethod::Mesh) {
                        Ok(_) | Err(MeshRelayError::MessageNotFound(_)) => {}
                        Err(e) => warn!(msg_id = %message.id, error = %e, "Failed to record mesh retry"),
                    }
                    info!(msg_id = %message.id, route = ?route, "Cloud-sent message pushed over mesh");
                }
                Err(TransportError::NoPeers) => {
                    debug!("Mesh peers gone, stopping retry flush");
                    break;
                }
                Err(e) => {
                    debug!(msg_id = %message.id, error = %e, "Mesh retry failed, keeping entry");
                }
            }
        }

        FlushReport {
            sent,
            remaining: self.len(),
            skipped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use meshrelay_shared::types::PeerKey;
    use meshrelay_store::{Database, StoredMessage};

    use crate::events::event_channel;

    const LOCAL: PeerKey = PeerKey([1u8; 32]);
    const PEER: PeerKey = PeerKey([2u8; 32]);

    fn chat() -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            sender: LOCAL,
            recipient: PEER,
            timestamp: Utc::now(),
            ciphertext: vec![1, 2, 3],
            media_ref: None,
        }
    }

    fn setup(cap: usize) -> (SharedDatabase, MessageStore, MeshRetryQueue) {
        let db: SharedDatabase = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = MessageStore::load(LOCAL, db.clone(), 30, event_channel()).unwrap();
        let queue = MeshRetryQueue::load(db.clone(), cap).unwrap();
        (db, store, queue)
    }

    fn stored(store: &MessageStore) -> ChatMessage {
        let msg = chat();
        store
            .append(StoredMessage::from_chat(
                &msg,
                None,
                DeliveryStatus::Sent,
                DeliveryMethod::Cloud,
            ))
            .unwrap();
        msg
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let (_db, store, queue) = setup(10);
        let msg = stored(&store);
        assert!(queue.enqueue(&msg).unwrap());
        assert!(!queue.enqueue(&msg).unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let (db, store, queue) = setup(2);
        let first = stored(&store);
        queue.enqueue(&first).unwrap();
        queue.enqueue(&stored(&store)).unwrap();
        queue.enqueue(&stored(&store)).unwrap();

        assert_eq!(queue.len(), 2);
        assert!(!queue.contains(&first.id));
        assert_eq!(lock_db(&db).retry_count().unwrap(), 2);
    }

    #[test]
    fn test_reload_from_database() {
        let (db, store, queue) = setup(10);
        let msg = stored(&store);
        queue.enqueue(&msg).unwrap();
        drop(queue);

        let reloaded = MeshRetryQueue::load(db, 10).unwrap();
        assert!(reloaded.contains(&msg.id));
        assert!(reloaded.remove(msg.id).unwrap());
        assert!(reloaded.is_empty());
    }
}
