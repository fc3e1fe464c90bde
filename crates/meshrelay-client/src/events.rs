use serde::Serialize;
use tokio::sync::broadcast;

use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId, PeerHandle, PeerKey};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by a running node for UI binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    StatusChanged {
        id: MessageId,
        status: DeliveryStatus,
        method: DeliveryMethod,
    },
    MessageReceived {
        id: MessageId,
        sender: PeerKey,
        method: DeliveryMethod,
    },
    /// A message was discarded because it can never be decrypted.
    DecryptionRejected {
        id: MessageId,
        sender: PeerKey,
        reason: String,
    },
    PeerConnected { peer: PeerHandle },
    PeerDisconnected { peer: PeerHandle },
}

pub type EventSender = broadcast::Sender<NodeEvent>;

pub fn event_channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Publish without caring whether anyone listens.
pub fn emit_event(events: &EventSender, event: NodeEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
