//! The libp2p host behind the gateway.
//!
//! A [`Node`] is a cheap handle. The swarm lives on its own task and is driven
//! through a command channel; connection and listen-address state is shared
//! with the handles so that snapshots never wait on the swarm.

mod connection_state;
mod probe;
mod translate;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, TransportError, identify,
    identity::Keypair,
    noise, relay,
    swarm::{
        ConnectionId, DialError, SwarmEvent,
        dial_opts::{DialOpts, PeerCondition},
    },
    yamux,
};
use libp2p_stream::{IncomingStreams, OpenStreamError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

pub use self::{connection_state::TrackedStream, probe::NodeProbeFactory};
use crate::{
    behaviour::{Behaviour, BehaviourEvent},
    host::{ConnectError, Dialer, Host, ProbeHost, StreamError},
    peerstore::Peerstore,
    protocol::{
        BASE_PROTOCOLS, DIAL_TIMEOUT, DIALED_ADDR_TTL, IDENTIFIED_ADDR_TTL,
        IDLE_CONNECTION_TIMEOUT,
    },
    stats::ConnectionRecord,
    types::{AddrInfo, AddrTtl, Connectedness, Direction},
};

const COMMAND_BUFFER: usize = 64;

pub type NodeStream = TrackedStream<Compat<libp2p::Stream>>;

// ─── Config ─────────────────────────────────────────────────────────────────

pub struct NodeConfig {
    pub keypair: Keypair,
    pub listen_addrs: Vec<Multiaddr>,
    pub idle_connection_timeout: Duration,
}

impl NodeConfig {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            listen_addrs: Vec::new(),
            idle_connection_timeout: IDLE_CONNECTION_TIMEOUT,
        }
    }

    /// A fresh identity that listens nowhere; suited to outbound-only use.
    pub fn ephemeral() -> Self {
        Self::new(Keypair::generate_ed25519())
    }

    pub fn with_listen_addrs(mut self, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        self.listen_addrs = addrs.into_iter().collect();
        self
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), TransportError<std::io::Error>>>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct Shared {
    connections: connection_state::ConnectionTable,
    served: RwLock<Vec<String>>,
}

#[derive(Clone)]
pub struct Node {
    peer_id: PeerId,
    peerstore: Peerstore,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    listen_addrs: watch::Receiver<Vec<Multiaddr>>,
    shared: Arc<Shared>,
}

impl Node {
    /// Build the swarm, start listening and spawn its event loop.
    pub async fn spawn(config: NodeConfig) -> Result<Self> {
        let peer_id = config.keypair.public().to_peer_id();
        let mut swarm = build_swarm(config.keypair, config.idle_connection_timeout).await?;
        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .with_context(|| format!("listening on {addr}"))?;
        }

        let control = swarm.behaviour().stream.new_control();
        let peerstore = Peerstore::new(peer_id);
        let shared = Arc::new(Shared::default());
        let (listen_tx, listen_addrs) = watch::channel(Vec::new());
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        let event_loop = EventLoop {
            swarm,
            commands: rx,
            peerstore: peerstore.clone(),
            shared: Arc::clone(&shared),
            listen_addrs: listen_tx,
            pending: HashMap::new(),
        };
        tokio::spawn(event_loop.run());
        tracing::debug!(peer = %peer_id, "node started");

        Ok(Self {
            peer_id,
            peerstore,
            commands,
            control,
            listen_addrs,
            shared,
        })
    }

    pub async fn listen(&self, addr: Multiaddr) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Listen {
                addr: addr.clone(),
                reply,
            })
            .await
            .map_err(|_| ConnectError::HostClosed)?;
        rx.await
            .map_err(|_| ConnectError::HostClosed)?
            .with_context(|| format!("listening on {addr}"))
    }

    /// Wait until the node listens on at least one address and return them.
    /// Returns empty if the node stopped first.
    pub async fn listening(&self) -> Vec<Multiaddr> {
        let mut rx = self.listen_addrs.clone();
        match rx.wait_for(|addrs| !addrs.is_empty()).await {
            Ok(addrs) => addrs.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Start serving `protocol`. Each inbound stream arrives with the
    /// remote peer's identity.
    pub fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| anyhow::anyhow!("{protocol} is already being served"))?;
        self.shared
            .served
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(protocol.to_string());
        Ok(incoming)
    }

    /// Register an inbound stream in the connection table.
    pub fn track_inbound(
        &self,
        peer: PeerId,
        protocol: &StreamProtocol,
        stream: libp2p::Stream,
    ) -> NodeStream {
        self.shared
            .connections
            .track(peer, protocol.as_ref(), Direction::Inbound, stream.compat())
    }

    pub async fn shutdown(&self) {
        // A closed channel means the loop is already gone.
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

impl Dialer for Node {
    async fn connect(&self, info: AddrInfo) -> Result<(), ConnectError> {
        if self.shared.connections.is_connected(&info.id) {
            return Ok(());
        }
        if info.addrs.is_empty() {
            return Err(ConnectError::NoAddresses(info.id));
        }
        self.peerstore.add_addrs(
            info.id,
            info.addrs.iter().cloned(),
            AddrTtl::Temporary(DIALED_ADDR_TTL),
        );

        let peer = info.id;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dial {
                peer,
                addrs: info.addrs,
                reply,
            })
            .await
            .map_err(|_| ConnectError::HostClosed)?;
        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::HostClosed),
            Err(_) => Err(ConnectError::Timeout {
                peer,
                after: DIAL_TIMEOUT,
            }),
        }
    }
}

impl Host for Node {
    type Stream = NodeStream;

    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.borrow().clone()
    }

    fn peerstore(&self) -> &Peerstore {
        &self.peerstore
    }

    fn connections(&self) -> Vec<ConnectionRecord> {
        self.shared.connections.snapshot()
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        self.shared.connections.connectedness(peer)
    }

    fn protocols(&self) -> Vec<String> {
        let served = self
            .shared
            .served
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        BASE_PROTOCOLS
            .iter()
            .map(|p| p.to_string())
            .chain(served)
            .collect()
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<NodeStream, StreamError> {
        if !self.shared.connections.is_connected(&peer) {
            let addrs = self.peerstore.addrs(&peer);
            self.connect(AddrInfo::new(peer, addrs)).await?;
        }
        let stream = self
            .control
            .clone()
            .open_stream(peer, protocol.clone())
            .await
            .map_err(|e| match e {
                OpenStreamError::UnsupportedProtocol(protocol) => {
                    StreamError::UnsupportedProtocol { peer, protocol }
                }
                OpenStreamError::Io(source) => StreamError::Io {
                    peer,
                    protocol: protocol.clone(),
                    source,
                },
                other => StreamError::Io {
                    peer,
                    protocol: protocol.clone(),
                    source: std::io::Error::other(other.to_string()),
                },
            })?;
        Ok(self.shared.connections.track(
            peer,
            protocol.as_ref(),
            Direction::Outbound,
            stream.compat(),
        ))
    }
}

impl ProbeHost for Node {
    async fn close(self) {
        self.shutdown().await;
    }
}

// ─── Swarm ──────────────────────────────────────────────────────────────────

async fn build_swarm(keypair: Keypair, idle_timeout: Duration) -> Result<Swarm<Behaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            Default::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_dns()?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| Behaviour::new(key, relay_client))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();
    Ok(swarm)
}

struct PendingDial {
    peer: PeerId,
    reply: oneshot::Sender<Result<(), ConnectError>>,
}

struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    peerstore: Peerstore,
    shared: Arc<Shared>,
    listen_addrs: watch::Sender<Vec<Multiaddr>>,
    pending: HashMap<ConnectionId, PendingDial>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        tracing::debug!(peer = %self.swarm.local_peer_id(), "node stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => {
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .condition(PeerCondition::Disconnected)
                    .build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        tracing::debug!(%peer, "dialing");
                        self.pending
                            .insert(connection_id, PendingDial { peer, reply });
                    }
                    Err(DialError::DialPeerConditionFalse(_)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(translate::connect_error(peer, &e)));
                    }
                }
            }
            Command::Listen { addr, reply } => {
                let _ = reply.send(self.swarm.listen_on(addr).map(|_| ()));
            }
            Command::Shutdown => {}
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
                self.listen_addrs.send_modify(|addrs| {
                    if !addrs.contains(&address) {
                        addrs.push(address);
                    }
                });
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                tracing::info!(%address, "listen address expired");
                self.listen_addrs
                    .send_modify(|addrs| addrs.retain(|a| *a != address));
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let label = self
                    .shared
                    .connections
                    .opened(connection_id, peer_id, &endpoint);
                tracing::info!(
                    peer = %peer_id,
                    conn = %label,
                    remote_addr = %endpoint.get_remote_address(),
                    outbound = endpoint.is_dialer(),
                    relayed = connection_state::is_relayed(&endpoint),
                    "connection opened"
                );
                if let Some(dial) = self.pending.remove(&connection_id) {
                    let _ = dial.reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                self.shared.connections.closed(&connection_id);
                match cause {
                    Some(e) => tracing::info!(peer = %peer_id, error = %e, "connection closed"),
                    None => tracing::info!(peer = %peer_id, "connection closed"),
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                tracing::debug!(peer = ?peer_id, error = %error, "outgoing connection failed");
                if let Some(dial) = self.pending.remove(&connection_id) {
                    let result = match self.swarm.is_connected(&dial.peer) {
                        true => Ok(()),
                        false => Err(translate::connect_error(dial.peer, &error)),
                    };
                    let _ = dial.reply.send(result);
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                tracing::debug!(remote_addr = %send_back_addr, error = %error, "incoming connection failed");
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                for address in &addresses {
                    self.listen_addrs
                        .send_modify(|addrs| addrs.retain(|a| a != address));
                }
                match reason {
                    Ok(()) => tracing::info!(?addresses, "listener closed"),
                    Err(e) => tracing::warn!(?addresses, error = %e, "listener closed"),
                }
            }
            SwarmEvent::ListenerError { error, .. } => {
                tracing::warn!(error = %error, "listener error");
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn on_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    protocols = info.protocols.len(),
                    "identified peer"
                );
                self.peerstore.set_protocols(
                    peer_id,
                    info.protocols.iter().map(ToString::to_string).collect(),
                );
                self.peerstore.add_addrs(
                    peer_id,
                    info.listen_addrs,
                    AddrTtl::Temporary(IDENTIFIED_ADDR_TTL),
                );
            }
            BehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                tracing::info!(relay = %relay_peer_id, renewal, "relay reservation accepted");
            }
            BehaviourEvent::RelayClient(relay::client::Event::InboundCircuitEstablished {
                src_peer_id,
                ..
            }) => {
                tracing::info!(peer = %src_peer_id, "inbound relayed circuit established");
            }
            _ => {}
        }
    }
}
