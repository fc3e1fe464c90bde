//! Relay protocol engine.
//!
//! Decides the fate of every inbound envelope: delivered to this node,
//! forwarded with one more hop, or dropped. The decision is pure; sending
//! the forwarded frame is the caller's job.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use meshrelay_shared::error::RelayDrop;
use meshrelay_shared::protocol::{ChatMessage, RelayEnvelope};
use meshrelay_shared::types::{MessageId, PeerKey};

use crate::seen_cache::SeenMessageCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Addressed to this node. Terminal, never re-flooded.
    Delivered(ChatMessage),
    /// Envelope as it must leave this node.
    Forward(RelayEnvelope),
    Dropped(RelayDrop),
}

pub struct RelayEngine {
    local: PeerKey,
    seen: Mutex<SeenMessageCache>,
}

impl RelayEngine {
    pub fn new(local: PeerKey, cache_capacity: usize) -> Self {
        Self {
            local,
            seen: Mutex::new(SeenMessageCache::new(cache_capacity)),
        }
    }

    fn seen(&self) -> MutexGuard<'_, SeenMessageCache> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember an id without relaying it (own outgoing messages, cloud
    /// arrivals), so mesh echoes of it are dropped.
    pub fn mark_seen(&self, id: MessageId) -> bool {
        self.seen().insert(id)
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen().contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen().len()
    }

    pub fn process(&self, envelope: RelayEnvelope) -> RelayOutcome {
        let id = envelope.message.id;

        // Check and insert under one lock so concurrent arrivals of the
        // same id cannot both pass.
        if !self.seen().insert(id) {
            debug!(msg_id = %id, reason = %RelayDrop::Duplicate, "Relay drop");
            return RelayOutcome::Dropped(RelayDrop::Duplicate);
        }

        if envelope.message.recipient == self.local {
            return RelayOutcome::Delivered(envelope.message);
        }

        if envelope.is_exhausted() {
            debug!(
                msg_id = %id,
                hops = envelope.hop_count,
                reason = %RelayDrop::HopLimit,
                "Relay drop"
            );
            return RelayOutcome::Dropped(RelayDrop::HopLimit);
        }

        if envelope.was_relayed_by(&self.local) {
            debug!(msg_id = %id, reason = %RelayDrop::Loop, "Relay drop");
            return RelayOutcome::Dropped(RelayDrop::Loop);
        }

        let next = envelope.forwarded_by(self.local);
        debug!(
            msg_id = %id,
            hops = next.hop_count,
            max_hops = next.max_hops,
            "Forwarding envelope"
        );
        RelayOutcome::Forward(next)
    }
}
