//! In-memory doubles for the node's collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use meshrelay_client::cipher::SessionCipher;
use meshrelay_client::{CloudRelay, Collaborators, MeshRelayNode, NodeConfig};
use meshrelay_net::{DiscoveryBackend, MeshNotification, MeshTransport};
use meshrelay_shared::error::{CloudError, TransportError};
use meshrelay_shared::protocol::{ChatMessage, Hello, RelayEnvelope, WireMessage};
use meshrelay_shared::ratchet::ChainRatchetProvider;
use meshrelay_shared::types::{ConnectionState, MessageId, NetworkId, PeerHandle, PeerKey};
use meshrelay_shared::Identity;
use meshrelay_store::Database;

pub const NETWORK: &str = "test-net";

// ---------------------------------------------------------------------------
// Mesh transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Deliver,
    Fail,
    /// Never completes; the orchestrator's timer has to win.
    Hang,
}

pub struct RecordingTransport {
    mode: Mutex<LinkMode>,
    sent: Mutex<Vec<(Vec<u8>, Vec<PeerHandle>)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(LinkMode::Deliver),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: LinkMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Relay frames that went out, with their targets. Hellos are skipped.
    pub fn relayed(&self) -> Vec<(RelayEnvelope, Vec<PeerHandle>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(data, to)| match WireMessage::from_bytes(data).ok()? {
                WireMessage::Relay(env) => Some((env, to.clone())),
                WireMessage::Hello(_) => None,
            })
            .collect()
    }

    pub fn relayed_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(data, _)| matches!(WireMessage::from_bytes(data), Ok(WireMessage::Relay(_))))
            .map(|(data, _)| data.clone())
            .collect()
    }

    pub fn hellos(&self) -> Vec<(Hello, Vec<PeerHandle>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(data, to)| match WireMessage::from_bytes(data).ok()? {
                WireMessage::Hello(hello) => Some((hello, to.clone())),
                WireMessage::Relay(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl MeshTransport for RecordingTransport {
    async fn send(&self, data: Vec<u8>, to: &[PeerHandle]) -> Result<(), TransportError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            LinkMode::Deliver => {
                self.sent.lock().unwrap().push((data, to.to_vec()));
                Ok(())
            }
            LinkMode::Fail => Err(TransportError::SendFailed("link down".into())),
            LinkMode::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

pub struct NullDiscovery;

impl DiscoveryBackend for NullDiscovery {
    fn start_network(&self, _network: &NetworkId) -> Result<(), TransportError> {
        Ok(())
    }
    fn stop_network(&self, _network: &NetworkId) {}
    fn invite(&self, _peer: &PeerHandle, _timeout: Duration) {}
    fn answer_invitation(&self, _peer: &PeerHandle, _accept: bool) {}
}

// ---------------------------------------------------------------------------
// Cloud relay
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCloud {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    mailboxes: Mutex<HashMap<PeerKey, Vec<String>>>,
    pub uploads: AtomicUsize,
    failing: Mutex<bool>,
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn pending_for(&self, peer: &PeerKey) -> usize {
        self.mailboxes.lock().unwrap().get(peer).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CloudRelay for MockCloud {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, CloudError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(CloudError::Upload("relay unreachable".into()));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let handle = format!("blob-{}", blobs.len());
        blobs.insert(handle.clone(), bytes);
        Ok(handle)
    }

    async fn notify(&self, recipient: &PeerKey, handle: &str) -> Result<(), CloudError> {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(*recipient)
            .or_default()
            .push(handle.to_string());
        Ok(())
    }

    async fn poll_pending(&self, peer: &PeerKey) -> Result<Vec<String>, CloudError> {
        Ok(self
            .mailboxes
            .lock()
            .unwrap()
            .remove(peer)
            .unwrap_or_default())
    }

    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, CloudError> {
        self.blobs
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(handle.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

pub fn test_config() -> NodeConfig {
    NodeConfig {
        networks: vec![NetworkId::new(NETWORK)],
        // Keep the periodic loops out of the way; tests drive sweeps by hand
        mesh_retry_interval: Duration::from_secs(3600),
        decrypt_retry_interval: Duration::from_secs(3600),
        cloud_poll_interval: Duration::from_secs(3600),
        ..NodeConfig::default()
    }
}

pub fn handle(peer: &str) -> PeerHandle {
    PeerHandle::new(NetworkId::new(NETWORK), peer)
}

pub struct TestNode {
    pub node: Arc<MeshRelayNode>,
    pub identity: Identity,
    pub transport: Arc<RecordingTransport>,
    notifications: mpsc::Sender<MeshNotification>,
}

impl TestNode {
    pub fn spawn(cloud: Option<Arc<MockCloud>>) -> Self {
        Self::spawn_with(Identity::generate(), cloud)
    }

    pub fn spawn_with(identity: Identity, cloud: Option<Arc<MockCloud>>) -> Self {
        Self::spawn_on(identity, cloud, Database::open_in_memory().unwrap())
    }

    pub fn spawn_on(identity: Identity, cloud: Option<Arc<MockCloud>>, database: Database) -> Self {
        let transport = RecordingTransport::new();
        let cloud: Option<Arc<dyn CloudRelay>> = cloud.map(|c| c as Arc<dyn CloudRelay>);
        let node = MeshRelayNode::new(
            test_config(),
            Collaborators {
                identity: Arc::new(identity.clone()),
                ratchets: Arc::new(ChainRatchetProvider::new()),
                transport: transport.clone(),
                discovery: Arc::new(NullDiscovery),
                cloud,
            },
            database,
        )
        .unwrap();

        let (tx, rx) = mpsc::channel(64);
        node.start(rx);
        Self {
            node: Arc::new(node),
            identity,
            transport,
            notifications: tx,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.identity.peer_key()
    }

    /// Bring a link up and wait until the node sees it.
    pub async fn connect(&self, peer: &str) -> PeerHandle {
        let handle = handle(peer);
        let before = self.node.connected_peers();
        self.notifications
            .send(MeshNotification::PeerStateChanged {
                handle: handle.clone(),
                state: ConnectionState::Connected,
            })
            .await
            .unwrap();
        wait_until(|| self.node.connected_peers() > before).await;
        handle
    }

    /// Bring a link up and bind `key` to it as its hello would.
    pub async fn connect_as(&self, peer: &str, key: PeerKey) -> PeerHandle {
        let handle = self.connect(peer).await;
        let hello = WireMessage::Hello(Hello {
            peer_key: key,
            network: NetworkId::new(NETWORK),
        })
        .to_bytes()
        .unwrap();
        self.node.receive_envelope(&hello, &handle).await.unwrap();
        handle
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Encrypts like a remote sender would, outside any node.
pub struct RemoteSender {
    pub identity: Identity,
    cipher: SessionCipher,
}

impl RemoteSender {
    pub fn new() -> Self {
        let identity = Identity::generate();
        let cipher = SessionCipher::new(
            Arc::new(identity.clone()),
            Arc::new(ChainRatchetProvider::new()),
        );
        Self { identity, cipher }
    }

    pub fn key(&self) -> PeerKey {
        self.identity.peer_key()
    }

    pub fn message(&self, to: PeerKey, text: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            sender: self.key(),
            recipient: to,
            timestamp: Utc::now(),
            ciphertext: self.cipher.encrypt(&to, text.as_bytes()).unwrap(),
            media_ref: None,
        }
    }
}

pub fn relay_frame(envelope: RelayEnvelope) -> Vec<u8> {
    WireMessage::Relay(envelope).to_bytes().unwrap()
}
