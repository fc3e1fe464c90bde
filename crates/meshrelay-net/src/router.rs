//! Mesh routing on top of a [`MeshTransport`].
//!
//! Unicast when the registry knows which link carries the recipient,
//! broadcast to every connected link otherwise, and flood-forwarding for
//! relayed envelopes.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use meshrelay_shared::error::TransportError;
use meshrelay_shared::types::{PeerHandle, PeerKey};

use crate::peers::PeerRegistry;
use crate::transport::MeshTransport;

/// Shared, lock-protected registry. Never held across an `.await`.
pub type SharedRegistry = Arc<Mutex<PeerRegistry>>;

pub fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, PeerRegistry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a send left the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Unicast(PeerHandle),
    Broadcast(usize),
}

#[derive(Clone)]
pub struct MeshRouter {
    transport: Arc<dyn MeshTransport>,
    registry: SharedRegistry,
}

impl MeshRouter {
    pub fn new(transport: Arc<dyn MeshTransport>, registry: SharedRegistry) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn connected_count(&self) -> usize {
        lock_registry(&self.registry).connected_count()
    }

    /// Send a frame towards `recipient`.
    pub async fn send_to(&self, recipient: &PeerKey, data: Vec<u8>) -> Result<Route, TransportError> {
        let (direct, everyone) = {
            let registry = lock_registry(&self.registry);
            (registry.resolve(recipient), registry.connected_peers())
        };

        if let Some(handle) = direct {
            debug!(recipient = %recipient.short(), peer = %handle, "Unicast send");
            self.transport.send(data, std::slice::from_ref(&handle)).await?;
            return Ok(Route::Unicast(handle));
        }

        if everyone.is_empty() {
            return Err(TransportError::NoPeers);
        }
        debug!(
            recipient = %recipient.short(),
            peers = everyone.len(),
            "Recipient not directly connected, broadcasting for relay"
        );
        self.transport.send(data, &everyone).await?;
        Ok(Route::Broadcast(everyone.len()))
    }

    /// Send a frame to one specific link.
    pub async fn send_direct(&self, handle: &PeerHandle, data: Vec<u8>) -> Result<(), TransportError> {
        self.transport.send(data, std::slice::from_ref(handle)).await
    }

    /// Flood a relayed frame to every connected link except `except`.
    /// Returns how many links it went out on.
    pub async fn forward(&self, data: Vec<u8>, except: &PeerHandle) -> Result<usize, TransportError> {
        let targets: Vec<PeerHandle> = lock_registry(&self.registry)
            .connected_peers()
            .into_iter()
            .filter(|h| h != except)
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }
        self.transport.send(data, &targets).await?;
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use meshrelay_shared::types::{ConnectionState, NetworkId};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<PeerHandle>>>,
    }

    #[async_trait]
    impl MeshTransport for RecordingTransport {
        async fn send(&self, _data: Vec<u8>, to: &[PeerHandle]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(to.to_vec());
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingTransport>, MeshRouter) {
        let transport = Arc::new(RecordingTransport::default());
        let registry: SharedRegistry = Arc::new(Mutex::new(PeerRegistry::new()));
        let router = MeshRouter::new(transport.clone(), registry);
        (transport, router)
    }

    fn connect(router: &MeshRouter, network: &str, peer: &str) -> PeerHandle {
        let handle = PeerHandle::new(NetworkId::new(network), peer);
        lock_registry(router.registry()).on_state_changed(handle.clone(), ConnectionState::Connected);
        handle
    }

    #[tokio::test]
    async fn test_no_peers() {
        let (_, router) = setup();
        let result = router.send_to(&PeerKey([1u8; 32]), vec![1]).await;
        assert_eq!(result, Err(TransportError::NoPeers));
    }

    #[tokio::test]
    async fn test_unicast_after_handshake() {
        let (transport, router) = setup();
        let key = PeerKey([1u8; 32]);
        let bob = connect(&router, "bt", "bob");
        connect(&router, "wifi", "carol");
        lock_registry(router.registry()).bind_identity(&bob, key);

        let route = router.send_to(&key, vec![1]).await.unwrap();
        assert_eq!(route, Route::Unicast(bob.clone()));
        assert_eq!(transport.sent.lock().unwrap()[0], vec![bob]);
    }

    #[tokio::test]
    async fn test_broadcast_when_unresolved() {
        let (transport, router) = setup();
        connect(&router, "bt", "bob");
        connect(&router, "wifi", "carol");

        let route = router.send_to(&PeerKey([7u8; 32]), vec![1]).await.unwrap();
        assert_eq!(route, Route::Broadcast(2));
        assert_eq!(transport.sent.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_forward_skips_arrival_peer() {
        let (transport, router) = setup();
        let bob = connect(&router, "bt", "bob");
        let carol = connect(&router, "wifi", "carol");

        let count = router.forward(vec![1], &bob).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(transport.sent.lock().unwrap()[0], vec![carol.clone()]);

        // Only the arrival peer connected: nothing to forward to
        lock_registry(router.registry()).on_disconnected(&carol);
        assert_eq!(router.forward(vec![1], &bob).await.unwrap(), 0);
    }
}
