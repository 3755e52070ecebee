//! libp2p Network Behaviour
//!
//! Implements the P2P networking layer using libp2p with:
//! - mDNS for local network discovery
//! - TCP + QUIC transports for connectivity
//! - gossipsub for the session directory and per-session topics

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, mdns, noise, ping, swarm::behaviour::toggle::Toggle,
    swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::session_code::SessionCode;
use super::wire::{session_topic, DirectoryFrame, SessionFrame, DIRECTORY_TOPIC};
use crate::sync::{Envelope, RemoteSessionInfo};
use crate::transport::{DiscoveryEvent, InboundFrame, JoinRequest};

/// Listen on every interface, TCP and QUIC, with OS-assigned ports
const DEFAULT_LISTEN_ADDRS: &[&str] = &["/ip4/0.0.0.0/tcp/0", "/ip4/0.0.0.0/udp/0/quic-v1"];

const DEFAULT_DEVICE_NAME: &str = "Handoff Device";

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Name other devices see as the controller of our sessions
    pub device_name: String,
    /// Multiaddrs to listen on. If empty, uses DEFAULT_LISTEN_ADDRS
    pub listen_addrs: Vec<String>,
    /// Whether to enable mDNS for local network discovery
    pub enable_mdns: bool,
    /// How often hosted sessions are re-announced
    pub announce_interval: Duration,
    /// Remote sessions not re-announced within this window are dropped
    pub session_ttl: Duration,
    /// How long a join waits for the host to answer
    pub join_timeout: Duration,
    /// How often an unanswered join request is re-sent
    pub join_retry_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            listen_addrs: Vec::new(), // Use defaults
            enable_mdns: true,
            announce_interval: Duration::from_secs(2),
            session_ttl: Duration::from_secs(8),
            join_timeout: Duration::from_secs(10),
            join_retry_interval: Duration::from_millis(500),
        }
    }
}

impl NetworkConfig {
    /// Get the effective listen addresses (custom or defaults)
    pub fn get_listen_addrs(&self) -> Vec<&str> {
        if self.listen_addrs.is_empty() {
            DEFAULT_LISTEN_ADDRS.to_vec()
        } else {
            self.listen_addrs.iter().map(|s| s.as_str()).collect()
        }
    }

    /// Period of the housekeeping timer
    fn tick_interval(&self) -> Duration {
        self.join_retry_interval
            .min(self.announce_interval)
            .clamp(Duration::from_millis(50), Duration::from_secs(1))
    }
}

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to create transport: {0}")]
    Transport(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Not in session: {0}")]
    NotInSession(String),

    #[error("Join request declined")]
    JoinDeclined,

    #[error("Join timeout")]
    JoinTimeout,

    #[error("Failed to publish: {0}")]
    Publish(String),

    #[error("libp2p error: {0}")]
    Libp2p(String),

    #[error("Network task closed")]
    Closed,
}

/// Combined network behaviour for local handoff
#[derive(NetworkBehaviour)]
pub struct HandoffBehaviour {
    /// Ping for connection keep-alive
    ping: ping::Behaviour,
    /// mDNS for local network discovery, off when disabled in config
    mdns: Toggle<mdns::tokio::Behaviour>,
    /// Peer identification
    identify: identify::Behaviour,
    /// Pub/sub for the directory and session topics
    gossipsub: gossipsub::Behaviour,
}

/// Commands sent to the network manager
#[derive(Debug)]
pub(crate) enum NetworkCommand {
    /// Start hosting a session and announcing it
    Host {
        display_name: String,
        join_requests: mpsc::UnboundedSender<JoinRequest>,
        reply: oneshot::Sender<Result<RemoteSessionInfo, NetworkError>>,
    },
    /// Stop hosting a session
    Withdraw { session_id: String },
    /// Attach a discovery watcher
    Watch {
        id: u64,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    },
    Unwatch { id: u64 },
    /// Ask the host of a remote session to let us in
    Join {
        info: RemoteSessionInfo,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    /// Drop our membership of a joined session
    Leave { session_id: String },
    OpenChannel {
        id: u64,
        session_id: String,
        channel: String,
        frames: mpsc::UnboundedSender<InboundFrame>,
    },
    CloseChannel { id: u64 },
    /// Publish an envelope on a session channel
    Send {
        session_id: String,
        channel: String,
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    /// The local controller decided on a join request
    AnswerJoin {
        session_id: String,
        request_id: u64,
        participant: String,
        accepted: bool,
    },
    /// Dial a peer directly by multiaddr (for manual connection)
    DialPeer { multiaddr: String },
    /// Shutdown the network
    Shutdown,
}

/// Handle to communicate with the running network
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    next_id: Arc<AtomicU64>,
    pub local_peer_id: String,
    pub device_name: String,
}

impl NetworkHandle {
    fn send(&self, command: NetworkCommand) -> Result<(), NetworkError> {
        self.command_tx.send(command).map_err(|_| NetworkError::Closed)
    }

    /// Fresh id for a watcher or channel
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn host(
        &self,
        display_name: &str,
        join_requests: mpsc::UnboundedSender<JoinRequest>,
    ) -> Result<RemoteSessionInfo, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(NetworkCommand::Host {
            display_name: display_name.to_string(),
            join_requests,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Closed)?
    }

    pub(crate) fn withdraw(&self, session_id: &str) {
        let _ = self.send(NetworkCommand::Withdraw {
            session_id: session_id.to_string(),
        });
    }

    pub(crate) fn watch(&self, id: u64, events: mpsc::UnboundedSender<DiscoveryEvent>) -> Result<(), NetworkError> {
        self.send(NetworkCommand::Watch { id, events })
    }

    pub(crate) fn unwatch(&self, id: u64) {
        let _ = self.send(NetworkCommand::Unwatch { id });
    }

    pub(crate) async fn join(&self, info: &RemoteSessionInfo) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(NetworkCommand::Join {
            info: info.clone(),
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Closed)?
    }

    pub(crate) fn leave(&self, session_id: &str) {
        let _ = self.send(NetworkCommand::Leave {
            session_id: session_id.to_string(),
        });
    }

    pub(crate) fn open_channel(
        &self,
        id: u64,
        session_id: &str,
        channel: &str,
        frames: mpsc::UnboundedSender<InboundFrame>,
    ) -> Result<(), NetworkError> {
        self.send(NetworkCommand::OpenChannel {
            id,
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            frames,
        })
    }

    pub(crate) fn close_channel(&self, id: u64) {
        let _ = self.send(NetworkCommand::CloseChannel { id });
    }

    pub(crate) async fn send_frame(
        &self,
        session_id: &str,
        channel: &str,
        envelope: Envelope,
    ) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(NetworkCommand::Send {
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            envelope,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::Closed)?
    }

    pub fn dial_peer(&self, multiaddr: &str) -> Result<(), NetworkError> {
        self.send(NetworkCommand::DialPeer {
            multiaddr: multiaddr.to_string(),
        })
    }

    pub fn shutdown(&self) {
        let _ = self.send(NetworkCommand::Shutdown);
    }
}

struct HostedSession {
    info: RemoteSessionInfo,
    join_requests: mpsc::UnboundedSender<JoinRequest>,
    /// Requests handed to the controller and not answered yet
    asked: HashSet<u64>,
    /// Decisions already made, re-sent when a request is retried.
    /// Kept for one join timeout, after which the requester has given up.
    answered: HashMap<u64, (bool, Instant)>,
}

struct KnownSession {
    info: RemoteSessionInfo,
    last_seen: Instant,
}

struct PendingJoin {
    session_id: String,
    deadline: Instant,
    last_attempt: Option<Instant>,
    reply: oneshot::Sender<Result<(), NetworkError>>,
}

struct ChannelSubscriber {
    id: u64,
    session_id: String,
    channel: String,
    frames: mpsc::UnboundedSender<InboundFrame>,
}

/// Manages P2P networking - runs in a background task
pub struct NetworkManager {
    /// Our local peer ID
    local_peer_id: PeerId,
    /// Our keypair
    keypair: identity::Keypair,
    /// Network configuration
    config: NetworkConfig,
    directory_topic: gossipsub::IdentTopic,
    /// Discovered peers (via mDNS)
    discovered_peers: HashSet<PeerId>,
    /// Remote peers subscribed to each topic we care about
    topic_peers: HashMap<gossipsub::TopicHash, HashSet<PeerId>>,
    /// Session topics we are subscribed to, with their user count
    session_topics: HashMap<String, usize>,
    hosted: HashMap<String, HostedSession>,
    /// Remote sessions, one per controller peer
    known: HashMap<PeerId, KnownSession>,
    watchers: Vec<(u64, mpsc::UnboundedSender<DiscoveryEvent>)>,
    pending_joins: HashMap<u64, PendingJoin>,
    channels: Vec<ChannelSubscriber>,
    last_announce: Option<Instant>,
}

impl NetworkManager {
    /// Create a new network manager with default config
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    /// Create a new network manager with custom config
    pub fn with_config(config: NetworkConfig) -> Self {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());

        info!("Local peer ID: {} ({})", local_peer_id, config.device_name);

        Self {
            local_peer_id,
            keypair,
            config,
            directory_topic: gossipsub::IdentTopic::new(DIRECTORY_TOPIC),
            discovered_peers: HashSet::new(),
            topic_peers: HashMap::new(),
            session_topics: HashMap::new(),
            hosted: HashMap::new(),
            known: HashMap::new(),
            watchers: Vec::new(),
            pending_joins: HashMap::new(),
            channels: Vec::new(),
            last_announce: None,
        }
    }

    /// Get our local peer ID
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Start the network and return a handle for communication.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(self) -> Result<NetworkHandle, NetworkError> {
        let mut swarm = self.create_swarm()?;

        for addr in self.config.get_listen_addrs() {
            match addr.parse::<Multiaddr>() {
                Ok(addr) => match swarm.listen_on(addr.clone()) {
                    Ok(id) => info!("Listener {:?} started on {}", id, addr),
                    Err(e) => warn!("Failed to listen on {}: {:?}", addr, e),
                },
                Err(e) => warn!("Invalid listen address {}: {}", addr, e),
            }
        }

        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&self.directory_topic)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let answers = command_tx.downgrade();
        let handle = NetworkHandle {
            command_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            local_peer_id: self.local_peer_id.to_string(),
            device_name: self.config.device_name.clone(),
        };

        tokio::spawn(self.run(swarm, answers, command_rx));

        Ok(handle)
    }

    /// Create the libp2p swarm
    ///
    /// Transport chain: TCP (noise + yamux) -> QUIC
    fn create_swarm(&self) -> Result<Swarm<HandoffBehaviour>, NetworkError> {
        let enable_mdns = self.config.enable_mdns;

        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|keypair| {
                // Ping for keep-alive (every 15 seconds)
                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(20)),
                );

                let mdns = if enable_mdns {
                    Some(
                        mdns::tokio::Behaviour::new(
                            mdns::Config::default(),
                            keypair.public().to_peer_id(),
                        )
                        .map_err(|e| e.to_string())?,
                    )
                } else {
                    None
                };

                // Gossipsub config - tuned for small networks
                // Must satisfy: mesh_outbound_min <= mesh_n_low <= mesh_n <= mesh_n_high
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .mesh_outbound_min(0) // Allow functioning with no outbound peers
                    .mesh_n_low(1)
                    .mesh_n(3)
                    .mesh_n_high(6)
                    .gossip_lazy(3)
                    .build()
                    .map_err(|e| e.to_string())?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                    gossipsub_config,
                )
                .map_err(|e| e.to_string())?;

                let identify = identify::Behaviour::new(identify::Config::new(
                    "/handoff/1.0.0".into(),
                    keypair.public(),
                ));

                Ok(HandoffBehaviour {
                    ping,
                    mdns: Toggle::from(mdns),
                    identify,
                    gossipsub,
                })
            })
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(300)))
            .build();

        Ok(swarm)
    }

    /// Main event loop
    async fn run(
        mut self,
        mut swarm: Swarm<HandoffBehaviour>,
        answers: mpsc::WeakUnboundedSender<NetworkCommand>,
        mut command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event, &answers);
                }
                command = command_rx.recv() => {
                    match command {
                        Some(NetworkCommand::Shutdown) => {
                            info!("Network shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(&mut swarm, command),
                        None => {
                            info!("All network handles dropped, shutting down");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick(&mut swarm, Instant::now());
                }
            }
        }

        let hosted: Vec<String> = self.hosted.keys().cloned().collect();
        for session_id in hosted {
            self.withdraw(&mut swarm, &session_id);
        }
        for (_, pending) in self.pending_joins.drain() {
            let _ = pending.reply.send(Err(NetworkError::Closed));
        }
    }

    fn handle_command(&mut self, swarm: &mut Swarm<HandoffBehaviour>, command: NetworkCommand) {
        match command {
            NetworkCommand::Host {
                display_name,
                join_requests,
                reply,
            } => {
                let _ = reply.send(self.host(swarm, &display_name, join_requests));
            }
            NetworkCommand::Withdraw { session_id } => {
                self.withdraw(swarm, &session_id);
            }
            NetworkCommand::Watch { id, events } => {
                // Report what is already known, like a fresh scan would
                for known in self.known.values() {
                    let _ = events.send(DiscoveryEvent::Added(known.info.clone()));
                }
                self.watchers.push((id, events));
            }
            NetworkCommand::Unwatch { id } => {
                self.watchers.retain(|(watcher, _)| *watcher != id);
            }
            NetworkCommand::Join { info, reply } => {
                self.join(swarm, info, reply);
            }
            NetworkCommand::Leave { session_id } => {
                info!("Left session {}", session_id);
                self.release_topic(swarm, &session_id);
            }
            NetworkCommand::OpenChannel {
                id,
                session_id,
                channel,
                frames,
            } => {
                debug!("Channel {} opened on session {}", channel, session_id);
                self.channels.push(ChannelSubscriber {
                    id,
                    session_id,
                    channel,
                    frames,
                });
            }
            NetworkCommand::CloseChannel { id } => {
                self.channels.retain(|c| c.id != id);
            }
            NetworkCommand::Send {
                session_id,
                channel,
                envelope,
                reply,
            } => {
                let _ = reply.send(self.send_frame(swarm, session_id, channel, envelope));
            }
            NetworkCommand::AnswerJoin {
                session_id,
                request_id,
                participant,
                accepted,
            } => {
                if let Some(hosted) = self.hosted.get_mut(&session_id) {
                    hosted.asked.remove(&request_id);
                    hosted.answered.insert(request_id, (accepted, Instant::now()));
                    info!(
                        "Join request from {} {}",
                        participant,
                        if accepted { "accepted" } else { "declined" }
                    );
                    self.publish_join_response(swarm, &session_id, request_id, &participant, accepted);
                }
            }
            NetworkCommand::DialPeer { multiaddr } => match multiaddr.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Dialing peer at {}", addr);
                    if let Err(e) = swarm.dial(addr) {
                        warn!("Failed to dial peer: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Invalid multiaddr {}: {}", multiaddr, e);
                }
            },
            // Handled by the run loop
            NetworkCommand::Shutdown => {}
        }
    }

    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<HandoffBehaviour>,
        event: SwarmEvent<HandoffBehaviourEvent>,
        answers: &mpsc::WeakUnboundedSender<NetworkCommand>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}/p2p/{}", address, self.local_peer_id);
            }

            // mDNS discovered peers (local network)
            SwarmEvent::Behaviour(HandoffBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if peer_id != self.local_peer_id {
                        info!("mDNS discovered peer: {} at {}", peer_id, addr);
                        self.discovered_peers.insert(peer_id);

                        swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        if swarm.dial(addr.clone()).is_ok() {
                            debug!("Dialing discovered peer {}", peer_id);
                        }
                    }
                }
            }

            SwarmEvent::Behaviour(HandoffBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                    self.discovered_peers.remove(&peer_id);
                }
            }

            SwarmEvent::Behaviour(HandoffBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                // Signed messages always carry their author
                let source = message.source.unwrap_or(propagation_source);
                if message.topic == self.directory_topic.hash() {
                    self.on_directory_frame(source, &message.data);
                } else if let Some(session_id) = self.session_for_topic(&message.topic) {
                    self.on_session_frame(swarm, source, &session_id, &message.data, answers);
                }
            }

            SwarmEvent::Behaviour(HandoffBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                debug!("Peer {} subscribed to {}", peer_id, topic);
                let is_directory = topic == self.directory_topic.hash();
                self.topic_peers.entry(topic).or_default().insert(peer_id);
                // Let newcomers see our sessions without waiting a full interval
                if is_directory {
                    self.announce_all(swarm);
                }
            }

            SwarmEvent::Behaviour(HandoffBehaviourEvent::Gossipsub(gossipsub::Event::Unsubscribed {
                peer_id,
                topic,
            })) => {
                debug!("Peer {} unsubscribed from {}", peer_id, topic);
                if let Some(peers) = self.topic_peers.get_mut(&topic) {
                    peers.remove(&peer_id);
                }
            }

            SwarmEvent::Behaviour(HandoffBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(
                    "Identified peer {} running {} with {} protocols",
                    peer_id,
                    info.protocol_version,
                    info.protocols.len()
                );
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                info!("Connection established with {} via {:?}", peer_id, endpoint);
                // Add to gossipsub for mesh
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!("Connection closed with {}", peer_id);
                if num_established == 0 {
                    for peers in self.topic_peers.values_mut() {
                        peers.remove(&peer_id);
                    }
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    warn!("Failed to connect to {}: {}", peer, error);
                } else {
                    warn!("Outgoing connection error: {}", error);
                }
            }

            SwarmEvent::ListenerError { listener_id, error } => {
                warn!("Listener {} error: {}", listener_id, error);
            }

            _ => {}
        }
    }

    fn on_tick(&mut self, swarm: &mut Swarm<HandoffBehaviour>, now: Instant) {
        let announce_due = self
            .last_announce
            .map_or(true, |at| now.duration_since(at) >= self.config.announce_interval);
        if announce_due {
            self.announce_all(swarm);
            self.last_announce = Some(now);
        }

        self.expire_sessions(now);
        self.retry_joins(swarm, now);
        self.forget_answers(now);
    }

    // ========================================================================
    // Directory
    // ========================================================================

    fn notify(&mut self, event: DiscoveryEvent) {
        self.watchers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn on_directory_frame(&mut self, source: PeerId, data: &[u8]) {
        let frame = match DirectoryFrame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring directory frame from {}: {}", source, e);
                return;
            }
        };

        let now = Instant::now();
        match frame {
            DirectoryFrame::Announce {
                session_id,
                display_name,
                controller_display_name,
            } => {
                let info =
                    RemoteSessionInfo::new(session_id, source.to_string(), display_name, controller_display_name);
                let event = match self.known.get_mut(&source) {
                    Some(known) if same_advert(&known.info, &info) => {
                        known.last_seen = now;
                        None
                    }
                    Some(known) => {
                        known.info = info.clone();
                        known.last_seen = now;
                        Some(DiscoveryEvent::Updated(info))
                    }
                    None => {
                        self.known.insert(
                            source,
                            KnownSession {
                                info: info.clone(),
                                last_seen: now,
                            },
                        );
                        Some(DiscoveryEvent::Added(info))
                    }
                };
                if let Some(event) = event {
                    self.notify(event);
                }
            }
            DirectoryFrame::Withdraw { session_id } => {
                let matches = self
                    .known
                    .get(&source)
                    .is_some_and(|known| known.info.session_id == session_id);
                if matches {
                    if let Some(known) = self.known.remove(&source) {
                        info!("Session {} withdrawn by {}", session_id, source);
                        self.notify(DiscoveryEvent::Removed(known.info));
                    }
                }
            }
        }
    }

    fn expire_sessions(&mut self, now: Instant) {
        let ttl = self.config.session_ttl;
        let expired: Vec<PeerId> = self
            .known
            .iter()
            .filter(|(_, known)| now.duration_since(known.last_seen) > ttl)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in expired {
            if let Some(known) = self.known.remove(&peer) {
                info!("Session {} from {} expired", known.info.session_id, peer);
                self.notify(DiscoveryEvent::Removed(known.info));
            }
        }
    }

    fn announce_all(&self, swarm: &mut Swarm<HandoffBehaviour>) {
        for hosted in self.hosted.values() {
            self.announce(swarm, &hosted.info);
        }
    }

    fn announce(&self, swarm: &mut Swarm<HandoffBehaviour>, info: &RemoteSessionInfo) {
        let frame = DirectoryFrame::Announce {
            session_id: info.session_id.clone(),
            display_name: info.display_name.clone(),
            controller_display_name: info.controller_display_name.clone(),
        };
        match frame.to_bytes() {
            Ok(data) => {
                if let Err(e) = self.publish(swarm, &self.directory_topic, data) {
                    debug!("Announce of {} failed: {}", info.session_id, e);
                }
            }
            Err(e) => warn!("Failed to encode announce: {}", e),
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn host(
        &mut self,
        swarm: &mut Swarm<HandoffBehaviour>,
        display_name: &str,
        join_requests: mpsc::UnboundedSender<JoinRequest>,
    ) -> Result<RemoteSessionInfo, NetworkError> {
        let session_id = SessionCode::random().into_string();
        self.acquire_topic(swarm, &session_id)?;

        let info = RemoteSessionInfo::new(
            &session_id,
            self.local_peer_id.to_string(),
            display_name,
            &self.config.device_name,
        );
        self.hosted.insert(
            session_id.clone(),
            HostedSession {
                info: info.clone(),
                join_requests,
                asked: HashSet::new(),
                answered: HashMap::new(),
            },
        );
        self.announce(swarm, &info);

        info!("Hosting session {} ({})", session_id, display_name);
        Ok(info)
    }

    fn withdraw(&mut self, swarm: &mut Swarm<HandoffBehaviour>, session_id: &str) {
        if self.hosted.remove(session_id).is_none() {
            return;
        }

        let frame = DirectoryFrame::Withdraw {
            session_id: session_id.to_string(),
        };
        if let Ok(data) = frame.to_bytes() {
            if let Err(e) = self.publish(swarm, &self.directory_topic, data) {
                debug!("Withdraw of {} failed: {}", session_id, e);
            }
        }
        self.release_topic(swarm, session_id);
        info!("Stopped hosting session {}", session_id);
    }

    fn join(
        &mut self,
        swarm: &mut Swarm<HandoffBehaviour>,
        info: RemoteSessionInfo,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    ) {
        let is_known = self
            .known
            .values()
            .any(|known| known.info.session_id == info.session_id);
        if !is_known {
            let _ = reply.send(Err(NetworkError::SessionNotFound(info.session_id)));
            return;
        }
        if let Err(e) = self.acquire_topic(swarm, &info.session_id) {
            let _ = reply.send(Err(e));
            return;
        }

        let request_id = rand::random::<u64>();
        let now = Instant::now();
        info!("Joining session {} (request {})", info.session_id, request_id);
        self.pending_joins.insert(
            request_id,
            PendingJoin {
                session_id: info.session_id,
                deadline: now + self.config.join_timeout,
                last_attempt: None,
                reply,
            },
        );
        self.send_join_request(swarm, request_id, now);
    }

    fn send_join_request(&mut self, swarm: &mut Swarm<HandoffBehaviour>, request_id: u64, now: Instant) {
        let Some(pending) = self.pending_joins.get_mut(&request_id) else {
            return;
        };
        pending.last_attempt = Some(now);
        let topic = gossipsub::IdentTopic::new(session_topic(&pending.session_id));

        let frame = SessionFrame::JoinRequest {
            request_id,
            display_name: self.config.device_name.clone(),
        };
        match frame.to_bytes() {
            Ok(data) => {
                if let Err(e) = self.publish(swarm, &topic, data) {
                    debug!("Join request {} not sent yet: {}", request_id, e);
                }
            }
            Err(e) => warn!("Failed to encode join request: {}", e),
        }
    }

    fn retry_joins(&mut self, swarm: &mut Swarm<HandoffBehaviour>, now: Instant) {
        let timed_out: Vec<u64> = self
            .pending_joins
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(id, _)| *id)
            .collect();
        for request_id in timed_out {
            if let Some(pending) = self.pending_joins.remove(&request_id) {
                warn!("Join of {} timed out", pending.session_id);
                self.release_topic(swarm, &pending.session_id);
                let _ = pending.reply.send(Err(NetworkError::JoinTimeout));
            }
        }

        let retry = self.config.join_retry_interval;
        let due: Vec<u64> = self
            .pending_joins
            .iter()
            .filter(|(_, pending)| pending.last_attempt.map_or(true, |at| now.duration_since(at) >= retry))
            .map(|(id, _)| *id)
            .collect();
        for request_id in due {
            self.send_join_request(swarm, request_id, now);
        }
    }

    fn on_session_frame(
        &mut self,
        swarm: &mut Swarm<HandoffBehaviour>,
        source: PeerId,
        session_id: &str,
        data: &[u8],
        answers: &mpsc::WeakUnboundedSender<NetworkCommand>,
    ) {
        let frame = match SessionFrame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring session frame from {}: {}", source, e);
                return;
            }
        };

        match frame {
            SessionFrame::JoinRequest {
                request_id,
                display_name,
            } => {
                self.on_join_request(swarm, session_id, request_id, display_name, answers);
            }
            SessionFrame::JoinResponse {
                request_id,
                participant,
                accepted,
            } => {
                let Some(pending) = self.pending_joins.remove(&request_id) else {
                    return;
                };
                if accepted {
                    info!("Joined session {} as {}", pending.session_id, participant);
                    let _ = pending.reply.send(Ok(()));
                } else {
                    info!("Join of {} declined", pending.session_id);
                    self.release_topic(swarm, &pending.session_id);
                    let _ = pending.reply.send(Err(NetworkError::JoinDeclined));
                }
            }
            SessionFrame::Frame { channel, envelope } => {
                self.deliver(session_id, &channel, &source.to_string(), envelope);
            }
        }
    }

    fn forget_answers(&mut self, now: Instant) {
        let keep = self.config.join_timeout;
        for hosted in self.hosted.values_mut() {
            hosted
                .answered
                .retain(|_, (_, at)| now.saturating_duration_since(*at) <= keep);
        }
    }

    fn on_join_request(
        &mut self,
        swarm: &mut Swarm<HandoffBehaviour>,
        session_id: &str,
        request_id: u64,
        participant: String,
        answers: &mpsc::WeakUnboundedSender<NetworkCommand>,
    ) {
        let Some(hosted) = self.hosted.get_mut(session_id) else {
            return;
        };

        // A retry of a request we already answered
        if let Some((accepted, _)) = hosted.answered.get(&request_id).copied() {
            self.publish_join_response(swarm, session_id, request_id, &participant, accepted);
            return;
        }
        if !hosted.asked.insert(request_id) {
            return;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if hosted
            .join_requests
            .send(JoinRequest::new(participant.clone(), reply_tx))
            .is_err()
        {
            warn!("Nobody is taking join requests for {}", session_id);
            hosted.asked.remove(&request_id);
            hosted.answered.insert(request_id, (false, Instant::now()));
            self.publish_join_response(swarm, session_id, request_id, &participant, false);
            return;
        }

        let answers = answers.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let accepted = reply_rx.await.unwrap_or(false);
            if let Some(commands) = answers.upgrade() {
                let _ = commands.send(NetworkCommand::AnswerJoin {
                    session_id,
                    request_id,
                    participant,
                    accepted,
                });
            }
        });
    }

    fn publish_join_response(
        &self,
        swarm: &mut Swarm<HandoffBehaviour>,
        session_id: &str,
        request_id: u64,
        participant: &str,
        accepted: bool,
    ) {
        let frame = SessionFrame::JoinResponse {
            request_id,
            participant: participant.to_string(),
            accepted,
        };
        let topic = gossipsub::IdentTopic::new(session_topic(session_id));
        match frame.to_bytes() {
            Ok(data) => {
                if let Err(e) = self.publish(swarm, &topic, data) {
                    debug!("Join response {} not sent: {}", request_id, e);
                }
            }
            Err(e) => warn!("Failed to encode join response: {}", e),
        }
    }

    fn send_frame(
        &self,
        swarm: &mut Swarm<HandoffBehaviour>,
        session_id: String,
        channel: String,
        envelope: Envelope,
    ) -> Result<(), NetworkError> {
        if !self.session_topics.contains_key(&session_id) {
            return Err(NetworkError::NotInSession(session_id));
        }
        let topic = gossipsub::IdentTopic::new(session_topic(&session_id));
        let data = SessionFrame::Frame { channel, envelope }
            .to_bytes()
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;
        self.publish(swarm, &topic, data)?;
        Ok(())
    }

    fn deliver(&mut self, session_id: &str, channel: &str, sender: &str, envelope: Envelope) {
        self.channels.retain(|subscriber| {
            if subscriber.session_id != session_id || subscriber.channel != channel {
                return true;
            }
            let frame = InboundFrame {
                sender: sender.to_string(),
                envelope: envelope.clone(),
            };
            subscriber.frames.send(frame).is_ok()
        });
    }

    // ========================================================================
    // Topics
    // ========================================================================

    /// Publish to a topic. Returns Ok(false) when no remote peer listens.
    fn publish(
        &self,
        swarm: &mut Swarm<HandoffBehaviour>,
        topic: &gossipsub::IdentTopic,
        data: Vec<u8>,
    ) -> Result<bool, NetworkError> {
        let has_peers = self
            .topic_peers
            .get(&topic.hash())
            .is_some_and(|peers| !peers.is_empty());
        if !has_peers {
            debug!("No peers on {}, not publishing", topic);
            return Ok(false);
        }

        swarm
            .behaviour_mut()
            .gossipsub
            .publish(topic.clone(), data)
            .map_err(|e| NetworkError::Publish(e.to_string()))?;
        Ok(true)
    }

    fn acquire_topic(&mut self, swarm: &mut Swarm<HandoffBehaviour>, session_id: &str) -> Result<(), NetworkError> {
        if let Some(users) = self.session_topics.get_mut(session_id) {
            *users += 1;
            return Ok(());
        }

        let topic = gossipsub::IdentTopic::new(session_topic(session_id));
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;
        self.session_topics.insert(session_id.to_string(), 1);
        Ok(())
    }

    fn release_topic(&mut self, swarm: &mut Swarm<HandoffBehaviour>, session_id: &str) {
        let Some(users) = self.session_topics.get_mut(session_id) else {
            return;
        };
        *users = users.saturating_sub(1);
        if *users > 0 {
            return;
        }

        self.session_topics.remove(session_id);
        let topic = gossipsub::IdentTopic::new(session_topic(session_id));
        let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
        self.channels.retain(|c| c.session_id != session_id);
    }

    fn session_for_topic(&self, topic: &gossipsub::TopicHash) -> Option<String> {
        self.session_topics
            .keys()
            .find(|id| gossipsub::IdentTopic::new(session_topic(id)).hash() == *topic)
            .cloned()
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Same session, same names
fn same_advert(a: &RemoteSessionInfo, b: &RemoteSessionInfo) -> bool {
    a.session_id == b.session_id
        && a.display_name == b.display_name
        && a.controller_display_name == b.controller_display_name
}
