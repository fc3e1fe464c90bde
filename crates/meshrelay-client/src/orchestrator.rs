//! Delivery orchestrator: mesh first, cloud as fallback.
//!
//! ```text
//! Created -> TryingMesh -> MeshOK                -> Sent(mesh)
//!                       -> MeshError | Timeout   -> TryingCloud
//! TryingCloud           -> CloudOK               -> Sent(cloud) + mesh retry entry
//!                       -> CloudError            -> Failed
//! ```
//!
//! The message is encrypted once; the same ciphertext goes over either path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use meshrelay_net::{MeshRouter, Route};
use meshrelay_shared::error::{CloudError, MeshRelayError, StatusError, TransportError};
use meshrelay_shared::protocol::{ChatMessage, RelayEnvelope, WireMessage};
use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId, PeerKey};
use meshrelay_store::StoredMessage;

use crate::cipher::SessionCipher;
use crate::cloud::CloudRelay;
use crate::mesh_retry::MeshRetryQueue;
use crate::message_store::MessageStore;
use crate::relay::RelayEngine;

pub struct DeliveryOrchestrator {
    cipher: Arc<SessionCipher>,
    relay: Arc<RelayEngine>,
    router: MeshRouter,
    cloud: Option<Arc<dyn CloudRelay>>,
    store: Arc<MessageStore>,
    retry: Arc<MeshRetryQueue>,
    mesh_timeout: Duration,
}

impl DeliveryOrchestrator {
    pub fn new(
        cipher: Arc<SessionCipher>,
        relay: Arc<RelayEngine>,
        router: MeshRouter,
        cloud: Option<Arc<dyn CloudRelay>>,
        store: Arc<MessageStore>,
        retry: Arc<MeshRetryQueue>,
        mesh_timeout: Duration,
    ) -> Self {
        Self {
            cipher,
            relay,
            router,
            cloud,
            store,
            retry,
            mesh_timeout,
        }
    }

    pub fn mesh_timeout(&self) -> Duration {
        self.mesh_timeout
    }

    pub async fn send(&self, recipient: PeerKey, plaintext: &str) -> Result<StoredMessage, MeshRelayError> {
        self.send_with_media(recipient, plaintext, None).await
    }

    /// Encrypt, persist as `Pending`, then run the failover state machine.
    /// Returns the message in its final state. Transport failures never
    /// surface as `Err`; they end in `Failed`.
    pub async fn send_with_media(
        &self,
        recipient: PeerKey,
        plaintext: &str,
        media_ref: Option<String>,
    ) -> Result<StoredMessage, MeshRelayError> {
        let ciphertext = self.cipher.encrypt(&recipient, plaintext.as_bytes())?;
        let message = ChatMessage {
            id: MessageId::new(),
            sender: self.cipher.local_key(),
            recipient,
            timestamp: Utc::now(),
            ciphertext,
            media_ref,
        };
        self.dispatch(message, Some(plaintext.to_string())).await
    }

    /// Persist `message` as `Pending`, then run mesh-then-cloud on its
    /// existing ciphertext.
    async fn dispatch(
        &self,
        message: ChatMessage,
        plaintext: Option<String>,
    ) -> Result<StoredMessage, MeshRelayError> {
        let recipient = message.recipient;
        self.store.append(StoredMessage::from_chat(
            &message,
            plaintext,
            DeliveryStatus::Pending,
            DeliveryMethod::Pending,
        ))?;
        // Our own flood must not come back through us
        self.relay.mark_seen(message.id);

        let frame = WireMessage::Relay(RelayEnvelope::new(message.clone())).to_bytes()?;
        match self.try_mesh(&message.recipient, frame).await {
            Ok(route) => {
                info!(
                    msg_id = %message.id,
                    recipient = %recipient.short(),
                    route = ?route,
                    "Message sent via mesh"
                );
                self.store
                    .update_delivery(message.id, DeliveryStatus::Sent, DeliveryMethod::Mesh)
            }
            Err(e) => {
                info!(msg_id = %message.id, error = %e, "Mesh unavailable, falling back to cloud");
                self.fall_back_to_cloud(&message).await
            }
        }
    }

    /// Race the mesh send against the timeout. The send future is dropped
    /// when the timer wins.
    async fn try_mesh(&self, recipient: &PeerKey, frame: Vec<u8>) -> Result<Route, TransportError> {
        match tokio::time::timeout(self.mesh_timeout, self.router.send_to(recipient, frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.mesh_timeout.as_millis() as u64)),
        }
    }

    async fn fall_back_to_cloud(&self, message: &ChatMessage) -> Result<StoredMessage, MeshRelayError> {
        match self.deliver_via_cloud(message).await {
            Ok(handle) => {
                info!(msg_id = %message.id, handle = %handle, "Message sent via cloud");
                let stored = self.store.update_delivery(
                    message.id,
                    DeliveryStatus::Sent,
                    DeliveryMethod::Cloud,
                )?;
                if let Err(e) = self.retry.enqueue(message) {
                    warn!(msg_id = %message.id, error = %e, "Failed to queue mesh retry");
                }
                Ok(stored)
            }
            Err(e) => {
                error!(msg_id = %message.id, error = %e, "Cloud fallback failed, message not sent");
                self.store
                    .update_delivery(message.id, DeliveryStatus::Failed, DeliveryMethod::Pending)
            }
        }
    }

    async fn deliver_via_cloud(&self, message: &ChatMessage) -> Result<String, CloudError> {
        let cloud = self.cloud.as_ref().ok_or(CloudError::Unavailable)?;
        let bytes = message
            .to_bytes()
            .map_err(|e| CloudError::Upload(e.to_string()))?;
        let handle = cloud.upload(bytes).await?;
        cloud.notify(&message.recipient, &handle).await?;
        Ok(handle)
    }

    /// Send a `Failed` message again under a new id, then drop the failed
    /// one. The ciphertext is reused as is; it carries the chain counter
    /// the recipient still expects.
    pub async fn resend(&self, id: MessageId) -> Result<StoredMessage, MeshRelayError> {
        let failed = self.store.get(id)?;
        if failed.status != DeliveryStatus::Failed || !failed.is_outgoing(&self.cipher.local_key()) {
            return Err(StatusError::InvalidTransition {
                from: failed.status,
                to: DeliveryStatus::Pending,
            }
            .into());
        }

        let message = ChatMessage {
            id: MessageId::new(),
            timestamp: Utc::now(),
            ..failed.to_chat()
        };
        let sent = self.dispatch(message, failed.plaintext.clone()).await?;
        self.store.delete(id)?;
        info!(old_id = %id, new_id = %sent.id, status = ?sent.status, "Resent failed message");
        Ok(sent)
    }
}
