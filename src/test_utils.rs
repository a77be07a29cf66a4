use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use http::{
    Request, Response, StatusCode,
    header::{CONNECTION, UPGRADE},
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use proptest::prelude::*;
use tokio::io::DuplexStream;

use crate::{
    host::{ConnectError, DialFailure, Dialer, Host, ProbeHost, ProbeHostFactory, StreamError},
    peerstore::Peerstore,
    protocol::{BASE_PROTOCOLS, HTTP_PROTOCOL},
    stats::ConnectionRecord,
    types::{AddrInfo, AddrTtl, Connectedness},
};

// ─── Peer / address generators ──────────────────────────────────────────────

pub fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(|bytes| {
        // Infallible: any 32 bytes is a valid ed25519 seed
        let secret = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes)
            .expect("any 32 bytes is a valid ed25519 seed");
        let keypair = libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(secret));
        keypair.public().to_peer_id()
    })
}

/// Transport addresses without identity: TCP, QUIC or WebSocket over IPv4.
pub fn arb_multiaddr() -> impl Strategy<Value = Multiaddr> {
    let ip = (1u8..=254, any::<u8>(), any::<u8>(), 1u8..=254)
        .prop_map(|(a, b, c, d)| format!("/ip4/{a}.{b}.{c}.{d}"));
    let suffix = prop_oneof![
        (1024u16..u16::MAX).prop_map(|port| format!("/tcp/{port}")),
        (1024u16..u16::MAX).prop_map(|port| format!("/udp/{port}/quic-v1")),
        (1024u16..u16::MAX).prop_map(|port| format!("/tcp/{port}/ws")),
    ];
    (ip, suffix).prop_map(|(ip, suffix)| {
        format!("{ip}{suffix}")
            .parse()
            .expect("generated transport multiaddr is always valid")
    })
}

// ─── Probe hosts ────────────────────────────────────────────────────────────

/// Probes that always see the remote prove the given identity.
pub struct MismatchProbes(pub PeerId);

/// Probes whose every dial is refused.
pub struct UnreachableProbes;

pub struct ScriptedProbe {
    proven: Option<PeerId>,
}

impl Dialer for ScriptedProbe {
    async fn connect(&self, info: AddrInfo) -> Result<(), ConnectError> {
        let attempts = info
            .addrs
            .iter()
            .map(|address| match self.proven {
                Some(actual) => DialFailure::PeerIdMismatch {
                    address: address.clone(),
                    expected: info.id,
                    actual,
                },
                None => DialFailure::Transport {
                    address: address.clone(),
                    reason: "connection refused".to_string(),
                },
            })
            .collect();
        Err(ConnectError::Dial {
            peer: info.id,
            attempts,
        })
    }
}

impl ProbeHost for ScriptedProbe {
    async fn close(self) {}
}

impl ProbeHostFactory for MismatchProbes {
    type Probe = ScriptedProbe;

    async fn create(&self) -> anyhow::Result<ScriptedProbe> {
        Ok(ScriptedProbe {
            proven: Some(self.0),
        })
    }
}

impl ProbeHostFactory for UnreachableProbes {
    type Probe = ScriptedProbe;

    async fn create(&self) -> anyhow::Result<ScriptedProbe> {
        Ok(ScriptedProbe { proven: None })
    }
}

// ─── In-memory host ─────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync>;

#[derive(Clone)]
enum PeerService {
    Handler(Handler),
    /// Replies with the request line, the forwarded client and the full body.
    EchoBody,
    /// Accepts any upgrade and echoes the upgraded bytes back.
    EchoUpgrade,
}

impl PeerService {
    async fn respond(&self, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
        match self {
            PeerService::Handler(handler) => handler(&req),
            PeerService::EchoBody => {
                let head = format!(
                    "{} {} xff={}\n",
                    req.method(),
                    req.uri(),
                    req.headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-"),
                );
                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::from_static(b"<body error>"),
                };
                let mut echoed = head.into_bytes();
                echoed.extend_from_slice(&body);
                Response::new(Full::new(Bytes::from(echoed)))
            }
            PeerService::EchoUpgrade => {
                let upgrade = hyper::upgrade::on(&mut req);
                let protocol = req.headers().get(UPGRADE).cloned();
                tokio::spawn(async move {
                    if let Ok(upgraded) = upgrade.await {
                        let (mut rd, mut wr) = tokio::io::split(TokioIo::new(upgraded));
                        let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    }
                });
                let mut res = Response::new(Full::default());
                *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
                res.headers_mut().insert(CONNECTION, "upgrade".parse().expect("header value"));
                if let Some(protocol) = protocol {
                    res.headers_mut().insert(UPGRADE, protocol);
                }
                res
            }
        }
    }
}

#[derive(Default)]
struct FakeState {
    services: Mutex<HashMap<PeerId, PeerService>>,
    connections: Mutex<Vec<ConnectionRecord>>,
    streams_opened: AtomicUsize,
    next_port: AtomicU16,
}

/// A `Host` whose peers are HTTP handlers living in this process. Streams
/// are in-memory pipes with a hyper server on the far end.
#[derive(Clone)]
pub struct FakeHost {
    peer_id: PeerId,
    peerstore: Peerstore,
    state: Arc<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        let peer_id = PeerId::random();
        Self {
            peer_id,
            peerstore: Peerstore::new(peer_id),
            state: Arc::new(FakeState::default()),
        }
    }

    /// Register a peer serving `handler`, known to the peerstore under a
    /// loopback address.
    pub fn add_peer(
        &self,
        handler: impl Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    ) -> PeerId {
        self.insert_peer(PeerService::Handler(Arc::new(handler)))
    }

    /// Register a peer answering every request `200 OK` with `body(req)`.
    pub fn add_http_peer(
        &self,
        body: impl Fn(&Request<Incoming>) -> String + Send + Sync + 'static,
    ) -> PeerId {
        self.add_peer(move |req| Response::new(Full::new(Bytes::from(body(req)))))
    }

    pub fn add_echo_body_peer(&self) -> PeerId {
        self.insert_peer(PeerService::EchoBody)
    }

    pub fn add_echo_upgrade_peer(&self) -> PeerId {
        self.insert_peer(PeerService::EchoUpgrade)
    }

    fn insert_peer(&self, service: PeerService) -> PeerId {
        let peer = PeerId::random();
        let port = 10_000 + self.state.next_port.fetch_add(1, Ordering::SeqCst);
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}")
            .parse()
            .expect("loopback multiaddr");
        self.peerstore.add_addr(peer, addr, AddrTtl::Permanent);
        self.state
            .services
            .lock()
            .expect("lock services")
            .insert(peer, service);
        peer
    }

    pub fn push_connection(&self, record: ConnectionRecord) {
        self.state
            .connections
            .lock()
            .expect("lock connections")
            .push(record);
    }

    pub fn streams_opened(&self) -> &AtomicUsize {
        &self.state.streams_opened
    }

    fn service(&self, peer: &PeerId) -> Option<PeerService> {
        self.state
            .services
            .lock()
            .expect("lock services")
            .get(peer)
            .cloned()
    }
}

impl Dialer for FakeHost {
    async fn connect(&self, info: AddrInfo) -> Result<(), ConnectError> {
        if self.service(&info.id).is_some() {
            return Ok(());
        }
        if info.addrs.is_empty() {
            return Err(ConnectError::NoAddresses(info.id));
        }
        Err(ConnectError::Dial {
            peer: info.id,
            attempts: info
                .addrs
                .into_iter()
                .map(|address| DialFailure::Transport {
                    address,
                    reason: "connection refused".to_string(),
                })
                .collect(),
        })
    }
}

impl Host for FakeHost {
    type Stream = DuplexStream;

    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        vec!["/ip4/127.0.0.1/tcp/4001".parse().expect("loopback multiaddr")]
    }

    fn peerstore(&self) -> &Peerstore {
        &self.peerstore
    }

    fn connections(&self) -> Vec<ConnectionRecord> {
        self.state
            .connections
            .lock()
            .expect("lock connections")
            .clone()
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        let conns = self.connections();
        let to_peer: Vec<_> = conns.iter().filter(|c| c.remote_peer == *peer).collect();
        match (to_peer.is_empty(), to_peer.iter().all(|c| c.limited)) {
            (true, _) => Connectedness::NotConnected,
            (false, true) => Connectedness::Limited,
            (false, false) => Connectedness::Connected,
        }
    }

    fn protocols(&self) -> Vec<String> {
        BASE_PROTOCOLS
            .iter()
            .copied()
            .chain([HTTP_PROTOCOL])
            .map(str::to_string)
            .collect()
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        _protocol: StreamProtocol,
    ) -> Result<DuplexStream, StreamError> {
        let service = self
            .service(&peer)
            .ok_or(ConnectError::NoAddresses(peer))?;
        self.state.streams_opened.fetch_add(1, Ordering::SeqCst);

        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(service.respond(req).await) }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(remote), svc)
                .with_upgrades()
                .await;
        });
        Ok(local)
    }
}
