//! libp2p mesh backend with the tokio mpsc command/notification pattern.
//!
//! Every configured network gets its own swarm, running in a dedicated tokio
//! task. All swarms report into one [`MeshNotification`] channel, and
//! [`Libp2pMesh`] routes sends and discovery commands to the right task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, mdns,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use meshrelay_shared::error::TransportError;
use meshrelay_shared::types::{ConnectionState, NetworkId, PeerHandle};

use crate::behaviour::{MeshBehaviour, MeshEvent};
use crate::messages::{inbox_hash, inbox_topic, network_protocol};
use crate::transport::{build_swarm, DiscoveryBackend, MeshNotification, MeshTransport};

const KEYPAIR_CONTEXT: &str = "meshrelay 2024 libp2p network keypair v1";

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* a network's swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Start announcing discovered peers.
    StartDiscovery,
    /// Stop announcing discovered peers.
    StopDiscovery,
    /// Dial a discovered peer. Abandoned if not connected within `timeout`.
    Invite { peer: PeerId, timeout: Duration },
    /// Accept or refuse an inbound connection.
    AnswerInvitation { peer: PeerId, accept: bool },
    /// Publish a frame to each peer's inbox.
    Send {
        peers: Vec<PeerId>,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    /// Request a snapshot of fully connected peers.
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    /// Gracefully shut down the swarm.
    Shutdown,
}

/// Derive the libp2p keypair used on `network` from the node's secret.
///
/// Each network gets its own peer id so links on different networks are
/// distinct handles.
pub fn network_keypair(
    secret: &[u8; 32],
    network: &NetworkId,
) -> anyhow::Result<libp2p::identity::Keypair> {
    let mut material = Vec::with_capacity(32 + network.as_str().len());
    material.extend_from_slice(secret);
    material.extend_from_slice(network.as_str().as_bytes());
    let seed = blake3::derive_key(KEYPAIR_CONTEXT, &material);
    Ok(libp2p::identity::Keypair::ed25519_from_bytes(seed)?)
}

// ---------------------------------------------------------------------------
// Per-network event loop
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Link {
    accepted: bool,
    subscribed: bool,
    announced: bool,
}

struct NetworkLoop {
    network: NetworkId,
    local_peer_id: PeerId,
    protocol: String,
    discovering: bool,
    known: HashMap<PeerId, Vec<Multiaddr>>,
    foreign: HashSet<PeerId>,
    links: HashMap<PeerId, Link>,
    invites: HashMap<PeerId, Instant>,
    notif_tx: mpsc::Sender<MeshNotification>,
}

impl NetworkLoop {
    fn handle(&self, peer: &PeerId) -> PeerHandle {
        PeerHandle::new(self.network.clone(), peer.to_string())
    }

    async fn notify(&self, notification: MeshNotification) {
        if self.notif_tx.send(notification).await.is_err() {
            debug!(network = %self.network, "Notification receiver dropped");
        }
    }

    async fn set_state(&self, peer: &PeerId, state: ConnectionState) {
        self.notify(MeshNotification::PeerStateChanged {
            handle: self.handle(peer),
            state,
        })
        .await;
    }

    /// Announce a link once both sides agreed and the remote inbox is known.
    async fn maybe_announce(&mut self, peer: &PeerId) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        if link.accepted && link.subscribed && !link.announced {
            link.announced = true;
            self.invites.remove(peer);
            info!(network = %self.network, peer = %peer, "Peer connected");
            self.set_state(peer, ConnectionState::Connected).await;
        }
    }

    async fn drop_link(&mut self, swarm: &mut Swarm<MeshBehaviour>, peer: &PeerId) {
        self.invites.remove(peer);
        if self.links.remove(peer).is_some() {
            let _ = swarm.disconnect_peer_id(*peer);
            self.set_state(peer, ConnectionState::Disconnected).await;
        }
    }

    async fn on_command(&mut self, swarm: &mut Swarm<MeshBehaviour>, cmd: SwarmCommand) -> bool {
        match cmd {
            SwarmCommand::StartDiscovery => {
                if !self.discovering {
                    self.discovering = true;
                    info!(network = %self.network, "Discovery started");
                    let pending: Vec<PeerId> = self
                        .known
                        .keys()
                        .filter(|p| !self.foreign.contains(p) && !self.links.contains_key(p))
                        .copied()
                        .collect();
                    for peer in pending {
                        self.notify(MeshNotification::PeerDiscovered {
                            handle: self.handle(&peer),
                        })
                        .await;
                    }
                }
            }
            SwarmCommand::StopDiscovery => {
                if self.discovering {
                    self.discovering = false;
                    info!(network = %self.network, "Discovery stopped");
                }
            }
            SwarmCommand::Invite { peer, timeout } => {
                if self.links.contains_key(&peer) || self.foreign.contains(&peer) {
                    return true;
                }
                let addresses = self.known.get(&peer).cloned().unwrap_or_default();
                let opts = DialOpts::peer_id(peer).addresses(addresses).build();
                match swarm.dial(opts) {
                    Ok(()) => {
                        debug!(network = %self.network, peer = %peer, "Inviting peer");
                        self.invites.insert(peer, Instant::now() + timeout);
                    }
                    Err(e) => {
                        warn!(network = %self.network, peer = %peer, error = %e, "Dial failed");
                    }
                }
            }
            SwarmCommand::AnswerInvitation { peer, accept } => {
                if accept {
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.accepted = true;
                    }
                    self.set_state(&peer, ConnectionState::Connecting).await;
                    self.maybe_announce(&peer).await;
                } else {
                    debug!(network = %self.network, peer = %peer, "Refusing invitation");
                    self.invites.remove(&peer);
                    self.links.remove(&peer);
                    let _ = swarm.disconnect_peer_id(peer);
                }
            }
            SwarmCommand::Send { peers, data, reply } => {
                let _ = reply.send(self.publish(swarm, &peers, data));
            }
            SwarmCommand::GetPeers(reply) => {
                let peers = self
                    .links
                    .iter()
                    .filter(|(_, link)| link.announced)
                    .map(|(peer, _)| *peer)
                    .collect();
                let _ = reply.send(peers);
            }
            SwarmCommand::Shutdown => {
                info!(network = %self.network, "Swarm shutdown requested");
                return false;
            }
        }
        true
    }

    fn publish(
        &self,
        swarm: &mut Swarm<MeshBehaviour>,
        peers: &[PeerId],
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        if peers.is_empty() {
            return Err(TransportError::NoPeers);
        }

        let mut delivered = 0usize;
        let mut last_error = None;
        for peer in peers {
            let topic = inbox_topic(&self.network, peer);
            match swarm.behaviour_mut().gossipsub.publish(topic, data.clone()) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!(network = %self.network, peer = %peer, error = %e, "Publish failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        if delivered > 0 {
            Ok(())
        } else {
            Err(TransportError::SendFailed(
                last_error.unwrap_or_else(|| "no inbox accepted the frame".into()),
            ))
        }
    }

    async fn on_event(&mut self, swarm: &mut Swarm<MeshBehaviour>, event: SwarmEvent<MeshEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshEvent::Mdns(mdns::Event::Discovered(list))) => {
                let mut fresh = HashSet::new();
                for (peer, addr) in list {
                    let addrs = self.known.entry(peer).or_default();
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                    if !self.foreign.contains(&peer) && !self.links.contains_key(&peer) {
                        fresh.insert(peer);
                    }
                }
                if self.discovering {
                    for peer in fresh {
                        debug!(network = %self.network, peer = %peer, "Peer discovered");
                        self.notify(MeshNotification::PeerDiscovered {
                            handle: self.handle(&peer),
                        })
                        .await;
                    }
                }
            }

            SwarmEvent::Behaviour(MeshEvent::Mdns(mdns::Event::Expired(list))) => {
                let mut lost = HashSet::new();
                for (peer, addr) in list {
                    if let Some(addrs) = self.known.get_mut(&peer) {
                        addrs.retain(|a| a != &addr);
                        if addrs.is_empty() {
                            self.known.remove(&peer);
                            lost.insert(peer);
                        }
                    }
                }
                if self.discovering {
                    for peer in lost {
                        self.notify(MeshNotification::PeerLost {
                            handle: self.handle(&peer),
                        })
                        .await;
                    }
                }
            }

            SwarmEvent::Behaviour(MeshEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                if info.protocol_version != self.protocol {
                    debug!(
                        network = %self.network,
                        peer = %peer_id,
                        protocol = %info.protocol_version,
                        "Peer belongs to another network, disconnecting"
                    );
                    self.foreign.insert(peer_id);
                    self.drop_link(swarm, &peer_id).await;
                }
            }

            SwarmEvent::Behaviour(MeshEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                if topic == inbox_hash(&self.network, &peer_id) {
                    if let Some(link) = self.links.get_mut(&peer_id) {
                        link.subscribed = true;
                    }
                    self.maybe_announce(&peer_id).await;
                }
            }

            SwarmEvent::Behaviour(MeshEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            })) => {
                if message.topic != inbox_hash(&self.network, &self.local_peer_id) {
                    return;
                }
                let Some(source) = message.source else {
                    return;
                };
                let announced = self.links.get(&source).is_some_and(|l| l.announced);
                if !announced {
                    debug!(network = %self.network, peer = %source, "Frame from unannounced peer ignored");
                    return;
                }
                debug!(
                    network = %self.network,
                    peer = %source,
                    len = message.data.len(),
                    "Frame received"
                );
                self.notify(MeshNotification::FrameReceived {
                    from: self.handle(&source),
                    data: message.data,
                })
                .await;
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                if num_established.get() > 1 || self.foreign.contains(&peer_id) {
                    return;
                }
                if endpoint.is_dialer() {
                    self.links.insert(
                        peer_id,
                        Link {
                            accepted: true,
                            ..Link::default()
                        },
                    );
                    self.set_state(&peer_id, ConnectionState::Connecting).await;
                } else {
                    self.links.insert(peer_id, Link::default());
                    self.notify(MeshNotification::InvitationReceived {
                        handle: self.handle(&peer_id),
                    })
                    .await;
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.invites.remove(&peer_id);
                    if self.links.remove(&peer_id).is_some() {
                        info!(network = %self.network, peer = %peer_id, "Peer disconnected");
                        self.set_state(&peer_id, ConnectionState::Disconnected).await;
                    }
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(network = %self.network, addr = %address, "Listening on new address");
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    self.invites.remove(&peer);
                }
                warn!(
                    network = %self.network,
                    peer = ?peer_id,
                    error = %error,
                    "Outgoing connection error"
                );
            }

            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!(network = %self.network, error = %error, "Incoming connection error");
            }

            _ => {}
        }
    }

    /// Abandon invitations that did not become a full link in time.
    async fn expire_invites(&mut self, swarm: &mut Swarm<MeshBehaviour>) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .invites
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            debug!(network = %self.network, peer = %peer, "Invitation expired");
            self.drop_link(swarm, &peer).await;
        }
    }
}

/// Spawn the swarm for one network in a background tokio task.
///
/// Returns the command sender and the swarm's local `PeerId`.
pub fn spawn_network(
    network: NetworkId,
    keypair: libp2p::identity::Keypair,
    listen_port: u16,
    notif_tx: mpsc::Sender<MeshNotification>,
) -> anyhow::Result<(mpsc::Sender<SwarmCommand>, PeerId)> {
    let mut swarm = build_swarm(keypair, &network)?;
    let local_peer_id = *swarm.local_peer_id();

    let listen_addr_v4: Multiaddr = format!("/ip4/0.0.0.0/udp/{listen_port}/quic-v1").parse()?;
    swarm.listen_on(listen_addr_v4)?;
    let listen_addr_v6: Multiaddr = format!("/ip6/::/udp/{listen_port}/quic-v1").parse()?;
    if let Err(e) = swarm.listen_on(listen_addr_v6) {
        warn!(network = %network, error = %e, "IPv6 listen failed");
    }

    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&inbox_topic(&network, &local_peer_id))?;

    info!(network = %network, peer_id = %local_peer_id, port = listen_port, "Swarm listening");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);

    let mut state = NetworkLoop {
        protocol: network_protocol(&network),
        network,
        local_peer_id,
        discovering: false,
        known: HashMap::new(),
        foreign: HashSet::new(),
        links: HashMap::new(),
        invites: HashMap::new(),
        notif_tx,
    };

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !state.on_command(&mut swarm, cmd).await {
                                break;
                            }
                        }
                        None => {
                            info!(network = %state.network, "Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    state.on_event(&mut swarm, event).await;
                }

                _ = tick.tick() => {
                    state.expire_invites(&mut swarm).await;
                }
            }
        }

        info!(network = %state.network, "Swarm event loop terminated");
    });

    Ok((cmd_tx, local_peer_id))
}

// ---------------------------------------------------------------------------
// Multi-network facade
// ---------------------------------------------------------------------------

/// Handle to every running network swarm.
#[derive(Clone)]
pub struct Libp2pMesh {
    networks: HashMap<NetworkId, mpsc::Sender<SwarmCommand>>,
}

impl Libp2pMesh {
    pub fn networks(&self) -> Vec<NetworkId> {
        self.networks.keys().cloned().collect()
    }

    fn command(&self, network: &NetworkId, cmd: SwarmCommand) -> Result<(), TransportError> {
        let tx = self
            .networks
            .get(network)
            .ok_or_else(|| TransportError::UnknownNetwork(network.to_string()))?;
        tx.try_send(cmd).map_err(|e| {
            error!(network = %network, error = %e, "Swarm command dropped");
            TransportError::ChannelClosed
        })
    }

    /// Ask every swarm to stop.
    pub async fn shutdown(&self) {
        for tx in self.networks.values() {
            let _ = tx.send(SwarmCommand::Shutdown).await;
        }
    }
}

/// Spawn one swarm per network, all derived from the node secret.
pub fn spawn_mesh(
    secret: &[u8; 32],
    networks: &[NetworkId],
    listen_port: u16,
) -> anyhow::Result<(Libp2pMesh, mpsc::Receiver<MeshNotification>)> {
    let (notif_tx, notif_rx) = mpsc::channel::<MeshNotification>(1024);
    let mut handles = HashMap::new();

    for (index, network) in networks.iter().enumerate() {
        let port = if listen_port == 0 {
            0
        } else {
            listen_port.saturating_add(index as u16)
        };
        let keypair = network_keypair(secret, network)?;
        let (cmd_tx, _) = spawn_network(network.clone(), keypair, port, notif_tx.clone())?;
        handles.insert(network.clone(), cmd_tx);
    }

    Ok((Libp2pMesh { networks: handles }, notif_rx))
}

fn parse_peer(handle: &PeerHandle) -> Result<PeerId, TransportError> {
    handle
        .peer
        .parse::<PeerId>()
        .map_err(|e| TransportError::SendFailed(format!("bad peer id {}: {e}", handle.peer)))
}

#[async_trait]
impl MeshTransport for Libp2pMesh {
    async fn send(&self, data: Vec<u8>, to: &[PeerHandle]) -> Result<(), TransportError> {
        if to.is_empty() {
            return Err(TransportError::NoPeers);
        }

        let mut grouped: HashMap<&NetworkId, Vec<PeerId>> = HashMap::new();
        for handle in to {
            grouped
                .entry(&handle.network)
                .or_default()
                .push(parse_peer(handle)?);
        }

        let mut last_error = TransportError::NoPeers;
        let mut delivered = false;
        for (network, peers) in grouped {
            let tx = self
                .networks
                .get(network)
                .ok_or_else(|| TransportError::UnknownNetwork(network.to_string()))?;
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(SwarmCommand::Send {
                peers,
                data: data.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

            match reply_rx.await {
                Ok(Ok(())) => delivered = true,
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = TransportError::ChannelClosed,
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(last_error)
        }
    }
}

impl DiscoveryBackend for Libp2pMesh {
    fn start_network(&self, network: &NetworkId) -> Result<(), TransportError> {
        self.command(network, SwarmCommand::StartDiscovery)
    }

    fn stop_network(&self, network: &NetworkId) {
        let _ = self.command(network, SwarmCommand::StopDiscovery);
    }

    fn invite(&self, peer: &PeerHandle, timeout: Duration) {
        match parse_peer(peer) {
            Ok(id) => {
                let _ = self.command(&peer.network, SwarmCommand::Invite { peer: id, timeout });
            }
            Err(e) => warn!(peer = %peer, error = %e, "Cannot invite peer"),
        }
    }

    fn answer_invitation(&self, peer: &PeerHandle, accept: bool) {
        match parse_peer(peer) {
            Ok(id) => {
                let _ = self.command(
                    &peer.network,
                    SwarmCommand::AnswerInvitation { peer: id, accept },
                );
            }
            Err(e) => warn!(peer = %peer, error = %e, "Cannot answer invitation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_keypairs_differ_per_network() {
        let secret = [9u8; 32];
        let bt = network_keypair(&secret, &NetworkId::new("meshrelay-bt")).unwrap();
        let wifi = network_keypair(&secret, &NetworkId::new("meshrelay-wifi")).unwrap();
        let bt_again = network_keypair(&secret, &NetworkId::new("meshrelay-bt")).unwrap();

        assert_ne!(bt.public().to_peer_id(), wifi.public().to_peer_id());
        assert_eq!(bt.public().to_peer_id(), bt_again.public().to_peer_id());
    }

    #[test]
    fn test_parse_peer_rejects_garbage() {
        let handle = PeerHandle::new(NetworkId::new("bt"), "not-a-peer-id");
        assert!(parse_peer(&handle).is_err());
    }
}
