//! Composition root.
//!
//! [`MeshRelayNode`] wires the collaborators (identity, ratchet sessions,
//! mesh transport, discovery backend, cloud relay, database) into the
//! delivery engine and drives its background loops:
//!
//! - the mesh notification loop (discovery, link state, inbound frames)
//! - the mesh retry sweep
//! - the decryption retry sweep
//! - the cloud mailbox poll
//!
//! Each periodic loop skips a tick while the previous run is in flight.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use meshrelay_net::{
    lock_registry, ConnectionInfo, DiscoveryBackend, DiscoveryController, LinkEvent,
    MeshNotification, MeshRouter, MeshTransport, PeerRegistry, SharedRegistry,
};
use meshrelay_shared::error::MeshRelayError;
use meshrelay_shared::protocol::{Hello, WireMessage};
use meshrelay_shared::session::{IdentityCrypto, RatchetSessionProvider};
use meshrelay_shared::types::{DeliveryMethod, MessageId, PeerHandle, PeerKey};
use meshrelay_store::{Database, StoredMessage};

use crate::cipher::SessionCipher;
use crate::cloud::CloudRelay;
use crate::config::NodeConfig;
use crate::decrypt_queue::DecryptQueue;
use crate::events::{emit_event, event_channel, EventSender, NodeEvent};
use crate::guard::RunGuard;
use crate::inbound::{InboundOutcome, InboundPipeline};
use crate::mesh_retry::{FlushReport, MeshRetryQueue};
use crate::message_store::{Conversation, MessageStore, SharedDatabase};
use crate::orchestrator::DeliveryOrchestrator;
use crate::relay::RelayEngine;

/// External collaborators injected into a node.
pub struct Collaborators {
    pub identity: Arc<dyn IdentityCrypto>,
    pub ratchets: Arc<dyn RatchetSessionProvider>,
    pub transport: Arc<dyn MeshTransport>,
    pub discovery: Arc<dyn DiscoveryBackend>,
    pub cloud: Option<Arc<dyn CloudRelay>>,
}

/// Everything the background tasks share.
#[derive(Clone)]
struct Engine {
    config: Arc<NodeConfig>,
    router: MeshRouter,
    discovery: DiscoveryController,
    store: Arc<MessageStore>,
    retry: Arc<MeshRetryQueue>,
    orchestrator: Arc<DeliveryOrchestrator>,
    inbound: Arc<InboundPipeline>,
    cloud: Option<Arc<dyn CloudRelay>>,
    events: EventSender,
    polling: Arc<AtomicBool>,
}

pub struct MeshRelayNode {
    local: PeerKey,
    engine: Engine,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshRelayNode {
    pub fn new(
        config: NodeConfig,
        collaborators: Collaborators,
        database: Database,
    ) -> Result<Self, MeshRelayError> {
        let Collaborators {
            identity,
            ratchets,
            transport,
            discovery,
            cloud,
        } = collaborators;

        let local = identity.local_key();
        let events = event_channel();
        let db: SharedDatabase = Arc::new(Mutex::new(database));

        let store = Arc::new(MessageStore::load(
            local,
            db.clone(),
            config.active_limit,
            events.clone(),
        )?);
        let retry = Arc::new(MeshRetryQueue::load(db.clone(), config.retry_queue_cap)?);
        let decrypt = Arc::new(DecryptQueue::load(db, config.pending_decrypt_per_sender)?);

        let registry: SharedRegistry = Arc::new(Mutex::new(PeerRegistry::new()));
        let router = MeshRouter::new(transport, registry.clone());
        let discovery = DiscoveryController::new(
            discovery,
            registry,
            config.networks.clone(),
            config.auto_connect,
        );

        let cipher = Arc::new(SessionCipher::new(identity, ratchets));
        let relay = Arc::new(RelayEngine::new(local, config.seen_cache_capacity));
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            cipher.clone(),
            relay.clone(),
            router.clone(),
            cloud.clone(),
            store.clone(),
            retry.clone(),
            config.mesh_timeout,
        ));
        let inbound = Arc::new(InboundPipeline::new(
            relay,
            router.clone(),
            cipher,
            store.clone(),
            decrypt,
            events.clone(),
        ));

        info!(
            peer_key = %local,
            address = %local.address(),
            networks = config.networks.len(),
            cloud = cloud.is_some(),
            "Node initialized"
        );

        Ok(Self {
            local,
            engine: Engine {
                config: Arc::new(config),
                router,
                discovery,
                store,
                retry,
                orchestrator,
                inbound,
                cloud,
                events,
                polling: Arc::new(AtomicBool::new(false)),
            },
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start discovery and the background loops. `notifications` is the
    /// event stream of the mesh backend.
    pub fn start(&self, notifications: mpsc::Receiver<MeshNotification>) {
        let engine = &self.engine;
        engine.discovery.start_discovery();

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        tasks.push(tokio::spawn(engine.clone().notification_loop(notifications)));

        let mesh_engine = engine.clone();
        tasks.push(spawn_periodic(engine.config.mesh_retry_interval, move || {
            let engine = mesh_engine.clone();
            async move {
                engine.flush_mesh_retry().await;
            }
        }));

        let decrypt_engine = engine.clone();
        tasks.push(spawn_periodic(engine.config.decrypt_retry_interval, move || {
            let engine = decrypt_engine.clone();
            async move {
                engine.sweep_decrypts();
            }
        }));

        if engine.cloud.is_some() {
            let cloud_engine = engine.clone();
            tasks.push(spawn_periodic(engine.config.cloud_poll_interval, move || {
                let engine = cloud_engine.clone();
                async move {
                    engine.poll_cloud().await;
                }
            }));
        }

        info!(tasks = tasks.len(), "Node started");
    }

    /// Stop discovery and every background loop.
    pub fn shutdown(&self) {
        self.engine.discovery.stop_discovery();
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Node stopped");
    }

    pub fn local_key(&self) -> PeerKey {
        self.local
    }

    pub async fn send(&self, recipient: PeerKey, plaintext: &str) -> Result<StoredMessage, MeshRelayError> {
        self.engine.orchestrator.send(recipient, plaintext).await
    }

    pub async fn send_with_media(
        &self,
        recipient: PeerKey,
        plaintext: &str,
        media_ref: Option<String>,
    ) -> Result<StoredMessage, MeshRelayError> {
        self.engine
            .orchestrator
            .send_with_media(recipient, plaintext, media_ref)
            .await
    }

    pub async fn resend(&self, id: MessageId) -> Result<StoredMessage, MeshRelayError> {
        self.engine.orchestrator.resend(id).await
    }

    /// Feed a frame received on `from` into the engine.
    pub async fn receive_envelope(
        &self,
        bytes: &[u8],
        from: &PeerHandle,
    ) -> Result<InboundOutcome, MeshRelayError> {
        self.engine.inbound.receive_envelope(bytes, from).await
    }

    pub fn mark_read(&self, id: MessageId) -> Result<bool, MeshRelayError> {
        self.engine.store.mark_read(id)
    }

    pub fn delete_message(&self, id: MessageId) -> Result<bool, MeshRelayError> {
        self.engine.retry.remove(id)?;
        self.engine.store.delete(id)
    }

    pub fn message(&self, id: MessageId) -> Result<StoredMessage, MeshRelayError> {
        self.engine.store.get(id)
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.engine.store.messages()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.engine.store.conversations()
    }

    pub fn archived(&self, limit: u32, offset: u32) -> Result<Vec<StoredMessage>, MeshRelayError> {
        self.engine.store.archived(limit, offset)
    }

    /// Every message exchanged with `peer`, active and archived.
    pub fn history_with(&self, peer: &PeerKey) -> Result<Vec<StoredMessage>, MeshRelayError> {
        self.engine.store.history_with(peer)
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<StoredMessage>> {
        self.engine.store.subscribe_messages()
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.engine.store.subscribe_conversations()
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.engine.events.subscribe()
    }

    pub fn connected_peers(&self) -> usize {
        self.engine.router.connected_count()
    }

    /// Every tracked link with its state and announced key.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        lock_registry(self.engine.router.registry()).all_connections()
    }

    pub fn pending_mesh_retries(&self) -> usize {
        self.engine.retry.len()
    }

    pub fn discovery(&self) -> &DiscoveryController {
        &self.engine.discovery
    }

    pub async fn flush_mesh_retry(&self) -> FlushReport {
        self.engine.flush_mesh_retry().await
    }

    pub fn sweep_decrypts(&self) -> Option<usize> {
        self.engine.sweep_decrypts()
    }

    pub async fn poll_cloud(&self) -> Option<usize> {
        self.engine.poll_cloud().await
    }
}

impl Drop for MeshRelayNode {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Engine {
    async fn notification_loop(self, mut notifications: mpsc::Receiver<MeshNotification>) {
        while let Some(notification) = notifications.recv().await {
            if let MeshNotification::FrameReceived { from, data } = &notification {
                match self.inbound.receive_envelope(data, from).await {
                    Ok(outcome) => debug!(peer = %from, outcome = ?outcome, "Frame handled"),
                    Err(e) => warn!(peer = %from, error = %e, "Dropping malformed frame"),
                }
                continue;
            }

            match self.discovery.handle_notification(&notification) {
                Some(LinkEvent::Connected(handle)) => self.on_connected(handle),
                Some(LinkEvent::Disconnected(handle)) => {
                    info!(peer = %handle, "Peer disconnected");
                    emit_event(&self.events, NodeEvent::PeerDisconnected { peer: handle });
                }
                None => {}
            }
        }
        debug!("Mesh notification channel closed");
    }

    fn on_connected(&self, handle: PeerHandle) {
        info!(peer = %handle, "Peer connected");
        emit_event(
            &self.events,
            NodeEvent::PeerConnected {
                peer: handle.clone(),
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let hello = WireMessage::Hello(Hello {
                peer_key: engine.store.local_key(),
                network: handle.network.clone(),
            });
            match hello.to_bytes() {
                Ok(frame) => {
                    if let Err(e) = engine.router.send_direct(&handle, frame).await {
                        warn!(peer = %handle, error = %e, "Failed to send hello");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode hello"),
            }

            let report = engine.flush_mesh_retry().await;
            if report.sent > 0 {
                info!(sent = report.sent, remaining = report.remaining, "Mesh retry after reconnect");
            }
        });
    }

    async fn flush_mesh_retry(&self) -> FlushReport {
        self.retry
            .flush(&self.router, &self.store, self.config.mesh_timeout)
            .await
    }

    fn sweep_decrypts(&self) -> Option<usize> {
        let delivered = self.inbound.sweep_decrypts();
        match delivered {
            Some(n) if n > 0 => info!(delivered = n, "Decryption retry sweep"),
            Some(_) => {}
            None => debug!("Decryption sweep already running, skipping"),
        }
        delivered
    }

    /// `None` when there is no cloud relay or a poll is already running.
    async fn poll_cloud(&self) -> Option<usize> {
        let cloud = self.cloud.as_ref()?;
        let _guard = RunGuard::try_acquire(&self.polling)?;
        match self.inbound.pull_cloud(cloud.as_ref()).await {
            Ok(delivered) => {
                if delivered > 0 {
                    info!(delivered, method = DeliveryMethod::Cloud.as_str(), "Cloud poll");
                }
                Some(delivered)
            }
            Err(e) => {
                warn!(error = %e, "Cloud poll failed");
                Some(0)
            }
        }
    }
}

/// Run `tick` every `period`, skipping missed ticks. The first run happens
/// one period after start.
fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}
