//! Peer connection registry.
//!
//! Tracks every link across all mesh networks, its connection state, and
//! which peer key sits behind it. The key binding is only ever populated
//! from a `Hello` handshake frame; unicast routing relies on it exclusively.
//!
//! `Hello` is not authenticated. Any link can claim any peer key, and a
//! claim from a second link is added next to the existing binding rather
//! than replacing it. `resolve` returns the earliest bound link that is still
//! connected, so an impostor that handshakes first receives unicast frames
//! for that key. It cannot read them (payloads are end-to-end encrypted),
//! but a successful send on its link counts as mesh delivery and the cloud
//! fallback is skipped. Treat the binding as a routing hint only.

use std::collections::HashMap;

use tracing::debug;

use meshrelay_shared::types::{ConnectionState, PeerHandle, PeerKey};

/// Information about a tracked link.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Network and transport-level peer id.
    pub handle: PeerHandle,
    /// Current link state.
    pub state: ConnectionState,
    /// Peer key announced by the remote side, once the handshake arrived.
    pub peer_key: Option<PeerKey>,
    /// Timestamp of the last state change (Unix epoch millis).
    pub changed_at: u64,
}

/// Tracks all links and the key-to-link binding.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    links: HashMap<PeerHandle, ConnectionInfo>,
    by_key: HashMap<PeerKey, Vec<PeerHandle>>,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl PeerRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a peer-state callback from the transport.
    pub fn on_state_changed(&mut self, handle: PeerHandle, state: ConnectionState) {
        match state {
            ConnectionState::Disconnected => self.on_disconnected(&handle),
            _ => {
                let now = now_millis();
                let entry = self
                    .links
                    .entry(handle.clone())
                    .or_insert_with(|| ConnectionInfo {
                        handle: handle.clone(),
                        state,
                        peer_key: None,
                        changed_at: now,
                    });
                entry.state = state;
                entry.changed_at = now;
                debug!(peer = %handle, state = ?state, "Tracking peer link");
            }
        }
    }

    /// Remove a link that has fully disconnected, along with its key binding.
    pub fn on_disconnected(&mut self, handle: &PeerHandle) {
        if let Some(info) = self.links.remove(handle) {
            if let Some(key) = info.peer_key {
                if let Some(handles) = self.by_key.get_mut(&key) {
                    handles.retain(|h| h != handle);
                    if handles.is_empty() {
                        self.by_key.remove(&key);
                    }
                }
            }
            debug!(peer = %handle, "Removed peer link from registry");
        }
    }

    /// Bind a peer key to a link after its handshake. Returns false if the
    /// link is unknown (the handshake raced a disconnect).
    ///
    /// The claimed key is taken on trust; see the module docs.
    pub fn bind_identity(&mut self, handle: &PeerHandle, key: PeerKey) -> bool {
        let Some(info) = self.links.get_mut(handle) else {
            return false;
        };

        if let Some(previous) = info.peer_key.replace(key) {
            if previous != key {
                if let Some(handles) = self.by_key.get_mut(&previous) {
                    handles.retain(|h| h != handle);
                    if handles.is_empty() {
                        self.by_key.remove(&previous);
                    }
                }
            }
        }

        let handles = self.by_key.entry(key).or_default();
        if !handles.contains(handle) {
            handles.push(handle.clone());
        }
        debug!(peer = %handle, key = %key.short(), "Bound peer key to link");
        true
    }

    /// Resolve a recipient to a connected link. Prefers the link bound first.
    pub fn resolve(&self, key: &PeerKey) -> Option<PeerHandle> {
        self.by_key.get(key).and_then(|handles| {
            handles
                .iter()
                .find(|h| self.state(h) == ConnectionState::Connected)
                .cloned()
        })
    }

    /// Peer key announced on a link, if any.
    pub fn identity_of(&self, handle: &PeerHandle) -> Option<PeerKey> {
        self.links.get(handle).and_then(|info| info.peer_key)
    }

    pub fn state(&self, handle: &PeerHandle) -> ConnectionState {
        self.links
            .get(handle)
            .map(|info| info.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, handle: &PeerHandle) -> bool {
        self.state(handle) == ConnectionState::Connected
    }

    /// All connected links on every network.
    pub fn connected_peers(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self
            .links
            .values()
            .filter(|info| info.state == ConnectionState::Connected)
            .map(|info| info.handle.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.links
            .values()
            .filter(|info| info.state == ConnectionState::Connected)
            .count()
    }

    /// Snapshot of every tracked link.
    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        self.links.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_shared::types::NetworkId;

    fn handle(network: &str, peer: &str) -> PeerHandle {
        PeerHandle::new(NetworkId::new(network), peer)
    }

    #[test]
    fn test_connect_disconnect() {
        let mut registry = PeerRegistry::new();
        let peer = handle("bt", "p1");

        assert!(!registry.is_connected(&peer));
        registry.on_state_changed(peer.clone(), ConnectionState::Connecting);
        assert_eq!(registry.connected_count(), 0);

        registry.on_state_changed(peer.clone(), ConnectionState::Connected);
        assert!(registry.is_connected(&peer));
        assert_eq!(registry.connected_count(), 1);

        registry.on_state_changed(peer.clone(), ConnectionState::Disconnected);
        assert!(!registry.is_connected(&peer));
        assert_eq!(registry.state(&peer), ConnectionState::Disconnected);
    }

    #[test]
    fn test_second_claim_on_key_keeps_first_binding() {
        let mut registry = PeerRegistry::new();
        let first = handle("wifi", "p1");
        let claimant = handle("bt", "p9");
        let key = PeerKey([7u8; 32]);

        registry.on_state_changed(first.clone(), ConnectionState::Connected);
        registry.on_state_changed(claimant.clone(), ConnectionState::Connected);
        assert!(registry.bind_identity(&first, key));
        assert!(registry.bind_identity(&claimant, key));

        // Both links carry the key; routing sticks with the earlier one.
        assert_eq!(registry.identity_of(&claimant), Some(key));
        assert_eq!(registry.resolve(&key), Some(first.clone()));

        registry.on_disconnected(&first);
        assert_eq!(registry.resolve(&key), Some(claimant));
    }

    #[test]
    fn test_resolve_requires_handshake() {
        let mut registry = PeerRegistry::new();
        let peer = handle("wifi", "p1");
        let key = PeerKey([1u8; 32]);

        registry.on_state_changed(peer.clone(), ConnectionState::Connected);
        assert_eq!(registry.resolve(&key), None);

        assert!(registry.bind_identity(&peer, key));
        assert_eq!(registry.resolve(&key), Some(peer.clone()));
        assert_eq!(registry.identity_of(&peer), Some(key));

        registry.on_disconnected(&peer);
        assert_eq!(registry.resolve(&key), None);
    }

    #[test]
    fn test_bind_unknown_link_is_rejected() {
        let mut registry = PeerRegistry::new();
        assert!(!registry.bind_identity(&handle("bt", "ghost"), PeerKey([2u8; 32])));
    }

    #[test]
    fn test_same_key_on_two_networks() {
        let mut registry = PeerRegistry::new();
        let key = PeerKey([3u8; 32]);
        let bt = handle("bt", "p1");
        let wifi = handle("wifi", "p1");

        registry.on_state_changed(bt.clone(), ConnectionState::Connected);
        registry.on_state_changed(wifi.clone(), ConnectionState::Connected);
        registry.bind_identity(&bt, key);
        registry.bind_identity(&wifi, key);

        registry.on_disconnected(&bt);
        assert_eq!(registry.resolve(&key), Some(wifi));
    }
}
