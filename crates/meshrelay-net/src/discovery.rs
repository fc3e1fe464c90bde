//! Multi-network discovery and session policy.
//!
//! Starts and stops the advertise/browse sessions of every configured
//! network, auto-invites discovered peers after a short grace delay,
//! auto-accepts inbound invitations on our own networks, and restarts a
//! stalled discovery loop once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use meshrelay_shared::constants::{DISCOVERY_STALL_SECS, INVITE_GRACE_MS, INVITE_TIMEOUT_SECS};
use meshrelay_shared::types::{ConnectionState, NetworkId, PeerHandle};

use crate::router::{lock_registry, SharedRegistry};
use crate::transport::{DiscoveryBackend, MeshNotification};

/// Link change the caller has to react to (handshake, retry flush).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(PeerHandle),
    Disconnected(PeerHandle),
}

#[derive(Debug, Clone)]
pub struct DiscoveryTimings {
    pub invite_grace: Duration,
    pub invite_timeout: Duration,
    pub stall_after: Duration,
}

impl Default for DiscoveryTimings {
    fn default() -> Self {
        Self {
            invite_grace: Duration::from_millis(INVITE_GRACE_MS),
            invite_timeout: Duration::from_secs(INVITE_TIMEOUT_SECS),
            stall_after: Duration::from_secs(DISCOVERY_STALL_SECS),
        }
    }
}

#[derive(Default)]
struct DiscoveryState {
    active: bool,
    generation: u64,
    discovered: usize,
    // Peer -> token of the invitation currently in flight
    in_flight: HashMap<PeerHandle, u64>,
    next_token: u64,
}

#[derive(Clone)]
pub struct DiscoveryController {
    backend: Arc<dyn DiscoveryBackend>,
    registry: SharedRegistry,
    networks: Arc<Vec<NetworkId>>,
    auto_connect: bool,
    timings: DiscoveryTimings,
    state: Arc<Mutex<DiscoveryState>>,
}

impl DiscoveryController {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        registry: SharedRegistry,
        networks: Vec<NetworkId>,
        auto_connect: bool,
    ) -> Self {
        Self::with_timings(backend, registry, networks, auto_connect, DiscoveryTimings::default())
    }

    pub fn with_timings(
        backend: Arc<dyn DiscoveryBackend>,
        registry: SharedRegistry,
        networks: Vec<NetworkId>,
        auto_connect: bool,
        timings: DiscoveryTimings,
    ) -> Self {
        Self {
            backend,
            registry,
            networks: Arc::new(networks),
            auto_connect,
            timings,
            state: Arc::new(Mutex::new(DiscoveryState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn networks(&self) -> &[NetworkId] {
        &self.networks
    }

    /// Start every network session. No-op when already running.
    pub fn start_discovery(&self) {
        if self.start_sessions() {
            self.arm_stall_watchdog();
        }
    }

    /// Stop every network session. No-op when already stopped.
    pub fn stop_discovery(&self) {
        {
            let mut state = self.state();
            if !state.active {
                return;
            }
            state.active = false;
            state.generation += 1;
            state.in_flight.clear();
        }
        for network in self.networks.iter() {
            self.backend.stop_network(network);
        }
        info!(networks = self.networks.len(), "Discovery stopped");
    }

    fn start_sessions(&self) -> bool {
        {
            let mut state = self.state();
            if state.active {
                return false;
            }
            state.active = true;
            state.generation += 1;
            state.discovered = 0;
        }
        for network in self.networks.iter() {
            if let Err(e) = self.backend.start_network(network) {
                warn!(network = %network, error = %e, "Failed to start network session");
            }
        }
        info!(networks = self.networks.len(), "Discovery started");
        true
    }

    /// Restart (stop + start) once if nothing shows up in time.
    fn arm_stall_watchdog(&self) {
        let controller = self.clone();
        let generation = self.state().generation;
        tokio::spawn(async move {
            tokio::time::sleep(controller.timings.stall_after).await;

            let stalled = {
                let state = controller.state();
                state.active && state.generation == generation && state.discovered == 0
            };
            if stalled && lock_registry(&controller.registry).connected_count() == 0 {
                warn!("No peers discovered, restarting discovery");
                controller.stop_discovery();
                controller.start_sessions();
            }
        });
    }

    /// Apply a backend notification. Returns the link change, if any.
    pub fn handle_notification(&self, notification: &MeshNotification) -> Option<LinkEvent> {
        match notification {
            MeshNotification::PeerDiscovered { handle } => {
                self.on_discovered(handle);
                None
            }
            MeshNotification::PeerLost { handle } => {
                debug!(peer = %handle, "Peer lost");
                None
            }
            MeshNotification::InvitationReceived { handle } => {
                let accept = self.auto_connect && self.networks.contains(&handle.network);
                debug!(peer = %handle, accept, "Answering invitation");
                self.backend.answer_invitation(handle, accept);
                None
            }
            MeshNotification::PeerStateChanged { handle, state } => {
                lock_registry(&self.registry).on_state_changed(handle.clone(), *state);
                match state {
                    ConnectionState::Connected => {
                        self.state().in_flight.remove(handle);
                        Some(LinkEvent::Connected(handle.clone()))
                    }
                    ConnectionState::Disconnected => Some(LinkEvent::Disconnected(handle.clone())),
                    ConnectionState::Connecting => None,
                }
            }
            MeshNotification::FrameReceived { .. } => None,
        }
    }

    fn on_discovered(&self, handle: &PeerHandle) {
        let token = {
            let mut state = self.state();
            state.discovered += 1;
            if !state.active || !self.auto_connect || state.in_flight.contains_key(handle) {
                return;
            }
            if lock_registry(&self.registry).state(handle) != ConnectionState::Disconnected {
                return;
            }
            state.next_token += 1;
            let token = state.next_token;
            state.in_flight.insert(handle.clone(), token);
            token
        };

        debug!(peer = %handle, "Peer discovered, inviting after grace delay");
        let controller = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(controller.timings.invite_grace).await;

            let still_wanted = controller.state().in_flight.get(&handle) == Some(&token)
                && !lock_registry(&controller.registry).is_connected(&handle);
            if still_wanted {
                controller
                    .backend
                    .invite(&handle, controller.timings.invite_timeout);
            }

            tokio::time::sleep(controller.timings.invite_timeout).await;
            let mut state = controller.state();
            if state.in_flight.get(&handle) == Some(&token) {
                state.in_flight.remove(&handle);
            }
        });
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }
}
