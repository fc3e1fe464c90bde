//! Message & conversation store.
//!
//! An idempotent ledger over the SQLite database. The newest `active_limit`
//! messages live in memory as the active set; everything older is moved to
//! the archive as soon as an append pushes the set past its bound.
//! Conversations are recomputed from the active set on every mutation and
//! published together with the message snapshot over `watch` channels.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use meshrelay_shared::error::MeshRelayError;
use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId, PeerKey};
use meshrelay_store::{Database, StoreError, StoredMessage};

use crate::events::{emit_event, EventSender, NodeEvent};

pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn lock_db(db: &SharedDatabase) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|poisoned| {
        warn!("Database lock poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn storage_error(e: StoreError) -> MeshRelayError {
    MeshRelayError::Storage(e.to_string())
}

/// Derived per-peer aggregate of the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub peer: PeerKey,
    pub last_message: StoredMessage,
    pub unread_count: usize,
}

struct StoreState {
    /// Oldest first.
    active: Vec<StoredMessage>,
    /// Every id in the ledger, active or archived.
    known: HashSet<MessageId>,
}

pub struct MessageStore {
    local: PeerKey,
    db: SharedDatabase,
    state: Mutex<StoreState>,
    active_limit: usize,
    messages_tx: watch::Sender<Vec<StoredMessage>>,
    conversations_tx: watch::Sender<Vec<Conversation>>,
    events: EventSender,
}

impl MessageStore {
    /// Reload the active set and the known-id index from the database.
    pub fn load(
        local: PeerKey,
        db: SharedDatabase,
        active_limit: usize,
        events: EventSender,
    ) -> Result<Self, MeshRelayError> {
        let active_limit = active_limit.max(1);
        let (active, known) = {
            let mut conn = lock_db(&db);
            let mut active = conn.active_messages().map_err(storage_error)?;
            if active.len() > active_limit {
                let overflow: Vec<StoredMessage> =
                    active.drain(..active.len() - active_limit).collect();
                let ids: Vec<MessageId> = overflow.iter().map(|m| m.id).collect();
                conn.archive_messages(&ids).map_err(storage_error)?;
            }
            let known: HashSet<MessageId> =
                conn.message_ids().map_err(storage_error)?.into_iter().collect();
            (active, known)
        };

        info!(
            active = active.len(),
            total = known.len(),
            "Message store loaded"
        );

        let conversations = aggregate(&local, &active);
        let (messages_tx, _) = watch::channel(active.clone());
        let (conversations_tx, _) = watch::channel(conversations);

        Ok(Self {
            local,
            db,
            state: Mutex::new(StoreState { active, known }),
            active_limit,
            messages_tx,
            conversations_tx,
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_key(&self) -> PeerKey {
        self.local
    }

    /// Persist `message`. Returns `false` if its id is already in the ledger.
    pub fn append(&self, message: StoredMessage) -> Result<bool, MeshRelayError> {
        let mut state = self.state();
        if state.known.contains(&message.id) {
            debug!(msg_id = %message.id, "Message already stored");
            return Ok(false);
        }

        let mut db = lock_db(&self.db);
        if !db.insert_message(&message).map_err(storage_error)? {
            state.known.insert(message.id);
            return Ok(false);
        }
        state.known.insert(message.id);

        let pos = state
            .active
            .partition_point(|m| m.timestamp <= message.timestamp);
        state.active.insert(pos, message);

        if state.active.len() > self.active_limit {
            let overflow = state.active.len() - self.active_limit;
            let ids: Vec<MessageId> = state.active.drain(..overflow).map(|m| m.id).collect();
            db.archive_messages(&ids).map_err(storage_error)?;
            debug!(archived = ids.len(), "Archived messages beyond the active limit");
        }
        drop(db);

        self.publish(&state);
        Ok(true)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.state().known.contains(id)
    }

    pub fn get(&self, id: MessageId) -> Result<StoredMessage, MeshRelayError> {
        if let Some(message) = self.state().active.iter().find(|m| m.id == id) {
            return Ok(message.clone());
        }
        match lock_db(&self.db).get_message(id) {
            Ok(message) => Ok(message),
            Err(StoreError::NotFound) => Err(MeshRelayError::MessageNotFound(id)),
            Err(e) => Err(storage_error(e)),
        }
    }

    /// Record the outcome of a delivery attempt.
    ///
    /// A status change must be a valid transition. Keeping the status and
    /// only changing the method is allowed (a cloud-sent message later
    /// pushed over the mesh).
    pub fn update_delivery(
        &self,
        id: MessageId,
        status: DeliveryStatus,
        method: DeliveryMethod,
    ) -> Result<StoredMessage, MeshRelayError> {
        let current = self.get(id)?;
        if current.status != status {
            current.status.transition(status)?;
        } else if current.method == method {
            return Ok(current);
        }

        let mut state = self.state();
        match lock_db(&self.db).update_delivery(id, status, method) {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Err(MeshRelayError::MessageNotFound(id)),
            Err(e) => return Err(storage_error(e)),
        }

        let mut updated = current;
        updated.status = status;
        updated.method = method;
        if let Some(slot) = state.active.iter_mut().find(|m| m.id == id) {
            *slot = updated.clone();
        }
        self.publish(&state);
        drop(state);

        emit_event(
            &self.events,
            NodeEvent::StatusChanged {
                id,
                status,
                method,
            },
        );
        Ok(updated)
    }

    pub fn mark_read(&self, id: MessageId) -> Result<bool, MeshRelayError> {
        let mut state = self.state();
        let changed = lock_db(&self.db).mark_read(id).map_err(storage_error)?;
        if !changed {
            if !state.known.contains(&id) {
                return Err(MeshRelayError::MessageNotFound(id));
            }
            return Ok(false);
        }
        if let Some(slot) = state.active.iter_mut().find(|m| m.id == id) {
            slot.is_read = true;
        }
        self.publish(&state);
        Ok(true)
    }

    /// Remove a message from the ledger. Its id is forgotten, so the same
    /// message arriving again is stored again.
    pub fn delete(&self, id: MessageId) -> Result<bool, MeshRelayError> {
        let mut state = self.state();
        let removed = lock_db(&self.db).delete_message(id).map_err(storage_error)?;
        state.known.remove(&id);
        let before = state.active.len();
        state.active.retain(|m| m.id != id);
        if removed || before != state.active.len() {
            self.publish(&state);
        }
        Ok(removed)
    }

    /// Active set, oldest first.
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state().active.clone()
    }

    /// Conversations, most recent first.
    pub fn conversations(&self) -> Vec<Conversation> {
        aggregate(&self.local, &self.state().active)
    }

    pub fn archived(&self, limit: u32, offset: u32) -> Result<Vec<StoredMessage>, MeshRelayError> {
        lock_db(&self.db)
            .archived_messages(limit, offset)
            .map_err(storage_error)
    }

    /// Full history with `peer`, active and archived.
    pub fn history_with(&self, peer: &PeerKey) -> Result<Vec<StoredMessage>, MeshRelayError> {
        lock_db(&self.db)
            .messages_with_peer(peer)
            .map_err(storage_error)
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<StoredMessage>> {
        self.messages_tx.subscribe()
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations_tx.subscribe()
    }

    fn publish(&self, state: &StoreState) {
        self.messages_tx.send_replace(state.active.clone());
        self.conversations_tx
            .send_replace(aggregate(&self.local, &state.active));
    }
}

fn aggregate(local: &PeerKey, active: &[StoredMessage]) -> Vec<Conversation> {
    let mut by_peer: HashMap<PeerKey, Conversation> = HashMap::new();

    for message in active {
        let peer = message.peer(local);
        let unread = !message.is_outgoing(local) && !message.is_read;
        by_peer
            .entry(peer)
            .and_modify(|conv| {
                if message.timestamp >= conv.last_message.timestamp {
                    conv.last_message = message.clone();
                }
                if unread {
                    conv.unread_count += 1;
                }
            })
            .or_insert_with(|| Conversation {
                peer,
                last_message: message.clone(),
                unread_count: usize::from(unread),
            });
    }

    let mut conversations: Vec<Conversation> = by_peer.into_values().collect();
    conversations.sort_by(|a, b| {
        b.last_message
            .timestamp
            .cmp(&a.last_message.timestamp)
            .then_with(|| a.peer.cmp(&b.peer))
    });
    conversations
}
