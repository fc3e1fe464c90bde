//! Inbound pipeline: wire frame -> relay decision -> decryption -> store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use meshrelay_net::{lock_registry, MeshRouter};
use meshrelay_shared::error::{CloudError, CryptoError, MeshRelayError, RelayDrop};
use meshrelay_shared::protocol::{ChatMessage, WireMessage};
use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, PeerHandle, PeerKey};
use meshrelay_store::{PendingDecryption, StoredMessage};

use crate::cipher::SessionCipher;
use crate::cloud::CloudRelay;
use crate::decrypt_queue::{DecryptQueue, Enqueued, Resolution};
use crate::events::{emit_event, EventSender, NodeEvent};
use crate::message_store::MessageStore;
use crate::relay::{RelayEngine, RelayOutcome};

/// Fate of a message addressed to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Delivered,
    /// Parked until the sender's chain catches up.
    Queued,
    /// Already stored or already parked.
    Duplicate,
    /// Sender's parking queue is full.
    Dropped,
    Rejected(CryptoError),
    /// Addressed to someone else (only reachable from the cloud path).
    NotForUs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Hello { bound: bool },
    Forwarded(usize),
    Dropped(RelayDrop),
    Accepted(Acceptance),
}

pub struct InboundPipeline {
    local: PeerKey,
    relay: Arc<RelayEngine>,
    router: MeshRouter,
    cipher: Arc<SessionCipher>,
    store: Arc<MessageStore>,
    decrypt: Arc<DecryptQueue>,
    events: EventSender,
}

impl InboundPipeline {
    pub fn new(
        relay: Arc<RelayEngine>,
        router: MeshRouter,
        cipher: Arc<SessionCipher>,
        store: Arc<MessageStore>,
        decrypt: Arc<DecryptQueue>,
        events: EventSender,
    ) -> Self {
        Self {
            local: cipher.local_key(),
            relay,
            router,
            cipher,
            store,
            decrypt,
            events,
        }
    }

    /// Handle one frame received from a mesh link.
    pub async fn receive_envelope(
        &self,
        bytes: &[u8],
        from: &PeerHandle,
    ) -> Result<InboundOutcome, MeshRelayError> {
        match WireMessage::from_bytes(bytes)? {
            WireMessage::Hello(hello) => {
                if hello.network != from.network {
                    debug!(
                        peer = %from,
                        announced = %hello.network,
                        "Hello announced a different network"
                    );
                }
                let bound = lock_registry(self.router.registry()).bind_identity(from, hello.peer_key);
                Ok(InboundOutcome::Hello { bound })
            }
            WireMessage::Relay(envelope) => match self.relay.process(envelope) {
                RelayOutcome::Dropped(reason) => Ok(InboundOutcome::Dropped(reason)),
                RelayOutcome::Forward(next) => {
                    let id = next.message.id;
                    let frame = WireMessage::Relay(next).to_bytes()?;
                    match self.router.forward(frame, from).await {
                        Ok(count) => Ok(InboundOutcome::Forwarded(count)),
                        Err(e) => {
                            warn!(msg_id = %id, error = %e, "Failed to forward envelope");
                            Ok(InboundOutcome::Forwarded(0))
                        }
                    }
                }
                RelayOutcome::Delivered(message) => {
                    let acceptance = self.accept(message, DeliveryMethod::Mesh)?;
                    Ok(InboundOutcome::Accepted(acceptance))
                }
            },
        }
    }

    /// Handle a message fetched from the cloud relay.
    pub fn receive_cloud(&self, bytes: &[u8]) -> Result<Acceptance, MeshRelayError> {
        let message = ChatMessage::from_bytes(bytes)?;
        // A later mesh copy of the same message is a duplicate
        self.relay.mark_seen(message.id);
        self.accept(message, DeliveryMethod::Cloud)
    }

    /// Drain our rendezvous mailbox and feed every fetched message in.
    /// Returns how many were delivered.
    pub async fn pull_cloud(&self, cloud: &dyn CloudRelay) -> Result<usize, CloudError> {
        let handles = cloud.poll_pending(&self.local).await?;
        if handles.is_empty() {
            return Ok(0);
        }
        debug!(count = handles.len(), "Cloud mailbox has pending messages");

        let mut delivered = 0;
        for handle in handles {
            let bytes = match cloud.fetch(&handle).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Failed to fetch cloud message");
                    continue;
                }
            };
            match self.receive_cloud(&bytes) {
                Ok(Acceptance::Delivered) => delivered += 1,
                Ok(other) => debug!(handle = %handle, outcome = ?other, "Cloud message not delivered"),
                Err(e) => warn!(handle = %handle, error = %e, "Invalid cloud message"),
            }
        }
        Ok(delivered)
    }

    fn accept(&self, message: ChatMessage, method: DeliveryMethod) -> Result<Acceptance, MeshRelayError> {
        if message.recipient != self.local {
            return Ok(Acceptance::NotForUs);
        }
        if self.store.contains(&message.id) || self.decrypt.contains(&message.id) {
            debug!(msg_id = %message.id, "Message already received");
            return Ok(Acceptance::Duplicate);
        }

        let sender = message.sender;
        match self.cipher.decrypt(&sender, &message.ciphertext) {
            Ok(plaintext) => {
                self.deliver(&message, plaintext, method)?;
                // The chain just advanced; parked messages may now open
                let resolved = self.decrypt.retry_sender(&sender, &self.cipher);
                self.apply(resolved);
                Ok(Acceptance::Delivered)
            }
            Err(e) if e.is_retryable() => {
                let entry = PendingDecryption {
                    message,
                    method,
                    enqueued_at: Utc::now(),
                };
                Ok(match self.decrypt.enqueue(entry)? {
                    Enqueued::Queued => Acceptance::Queued,
                    Enqueued::AlreadyQueued => Acceptance::Duplicate,
                    Enqueued::Full => Acceptance::Dropped,
                })
            }
            Err(e) => {
                self.reject(&message, &e);
                Ok(Acceptance::Rejected(e))
            }
        }
    }

    fn deliver(
        &self,
        message: &ChatMessage,
        plaintext: Vec<u8>,
        method: DeliveryMethod,
    ) -> Result<bool, MeshRelayError> {
        let text = String::from_utf8_lossy(&plaintext).into_owned();
        let stored = StoredMessage::from_chat(message, Some(text), DeliveryStatus::Delivered, method);
        if !self.store.append(stored)? {
            return Ok(false);
        }

        info!(
            msg_id = %message.id,
            sender = %message.sender.short(),
            method = method.as_str(),
            "Message received"
        );
        emit_event(
            &self.events,
            NodeEvent::MessageReceived {
                id: message.id,
                sender: message.sender,
                method,
            },
        );
        Ok(true)
    }

    fn reject(&self, message: &ChatMessage, error: &CryptoError) {
        warn!(
            msg_id = %message.id,
            sender = %message.sender.short(),
            error = %error,
            "Discarding undecryptable message"
        );
        emit_event(
            &self.events,
            NodeEvent::DecryptionRejected {
                id: message.id,
                sender: message.sender,
                reason: error.to_string(),
            },
        );
    }

    /// Store decrypted parked messages and report rejected ones.
    fn apply(&self, resolved: Vec<Resolution>) -> usize {
        let mut delivered = 0;
        for resolution in resolved {
            match resolution {
                Resolution::Decrypted { entry, plaintext } => {
                    match self.deliver(&entry.message, plaintext, entry.method) {
                        Ok(true) => delivered += 1,
                        Ok(false) => {}
                        Err(e) => warn!(msg_id = %entry.message.id, error = %e, "Failed to store decrypted message"),
                    }
                }
                Resolution::Rejected { entry, error } => self.reject(&entry.message, &error),
            }
        }
        delivered
    }

    /// Retry every parked message. Returns how many were delivered, or
    /// `None` if a sweep was already running.
    pub fn sweep_decrypts(&self) -> Option<usize> {
        let resolved = self.decrypt.sweep(&self.cipher)?;
        Some(self.apply(resolved))
    }
}
