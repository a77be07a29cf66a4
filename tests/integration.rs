use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use constella::{
    expose::{self, LocalService},
    gateway::Gateway,
    host::Host,
    node::{Node, NodeConfig, NodeProbeFactory},
    protocol,
    resolve::{IdentityResolver, ResolveError},
};
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Empty, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use libp2p::{Multiaddr, multiaddr::Protocol};
use tokio::{net::TcpListener, time::timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

// ─── Helpers ────────────────────────────────────────────────────────────────

/// A node listening on loopback TCP, with the address it ended up on.
async fn listening_node() -> (Node, Multiaddr) {
    let listen: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().expect("parse listen multiaddr");
    let node = Node::spawn(NodeConfig::ephemeral().with_listen_addrs([listen]))
        .await
        .expect("spawn node");
    let addrs = timeout(TEST_TIMEOUT, node.listening())
        .await
        .expect("node starts listening in time");
    let addr = addrs.into_iter().next().expect("at least one listen address");
    (node, addr)
}

/// Plain HTTP server standing in for a service exposed by a peer.
async fn local_http_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local service");
    let addr = listener.local_addr().expect("local service addr");
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let svc = service_fn(|req: Request<Incoming>| async move {
                    let body = format!("served {} {}", req.method(), req.uri());
                    let mut res = Response::new(Full::new(Bytes::from(body)));
                    *res.status_mut() = StatusCode::CREATED;
                    res.headers_mut()
                        .insert("x-served-by", header::HeaderValue::from_static("peer-b"));
                    Ok::<_, Infallible>(res)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tcp), svc)
                    .await;
            });
        }
    });
    addr
}

fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::get(path)
        .header(header::HOST, "gateway.test")
        .body(Empty::new())
        .expect("build request")
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().expect("parse client addr")
}

// ─── Identity resolution ────────────────────────────────────────────────────

#[tokio::test]
async fn probe_learns_identity_behind_bare_address() {
    let (remote, addr) = listening_node().await;
    let resolver = IdentityResolver::new(NodeProbeFactory);

    let info = timeout(TEST_TIMEOUT, resolver.resolve(&addr))
        .await
        .expect("probe finishes in time")
        .expect("probe resolves identity");

    assert_eq!(info.id, remote.peer_id());
    assert_eq!(info.addrs, vec![addr]);
    remote.shutdown().await;
}

#[tokio::test]
async fn embedded_identity_needs_no_probe() {
    let (remote, addr) = listening_node().await;
    let full = addr.clone().with(Protocol::P2p(remote.peer_id()));

    let info = IdentityResolver::new(NodeProbeFactory)
        .resolve(&full)
        .await
        .expect("decode embedded identity");

    assert_eq!(info.id, remote.peer_id());
    assert_eq!(info.addrs, vec![addr]);
    remote.shutdown().await;
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}")
        .parse()
        .expect("parse multiaddr");

    let err = timeout(TEST_TIMEOUT, IdentityResolver::new(NodeProbeFactory).resolve(&addr))
        .await
        .expect("probe finishes in time")
        .expect_err("nobody listens there");

    assert!(matches!(err, ResolveError::Unreachable(_)), "unexpected error: {err}");
}

// ─── Gateway end to end ─────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_tunnels_http_to_registered_peer() {
    let service = local_http_service().await;
    let (remote, remote_addr) = listening_node().await;
    expose::spawn(
        &remote,
        protocol::http_protocol(),
        LocalService {
            host: service.ip().to_string(),
            port: service.port(),
        },
    )
    .expect("expose local service");

    let local = Node::spawn(NodeConfig::ephemeral()).await.expect("spawn gateway node");
    let gateway = Arc::new(Gateway::new(local.clone(), NodeProbeFactory));

    let res = timeout(
        TEST_TIMEOUT,
        gateway.handle(get(&format!("/add{remote_addr}")), client_addr()),
    )
    .await
    .expect("registration finishes in time");
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(local.peerstore().peers(), vec![remote.peer_id()]);

    let res = timeout(
        TEST_TIMEOUT,
        gateway.handle(
            get(&format!("/http/{}/status?verbose=1", remote.peer_id())),
            client_addr(),
        ),
    )
    .await
    .expect("tunnel request finishes in time");
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.headers()["x-served-by"], "peer-b");
    let body = res
        .into_body()
        .collect()
        .await
        .expect("read tunneled body")
        .to_bytes();
    assert_eq!(body, Bytes::from("served GET /status?verbose=1"));

    let info = local.connections();
    assert_eq!(info.len(), 1, "one connection to the remote peer");
    assert_eq!(info[0].remote_peer, remote.peer_id());

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn gateway_reports_unsupported_protocol_as_bad_gateway() {
    let (remote, remote_addr) = listening_node().await;
    let local = Node::spawn(NodeConfig::ephemeral()).await.expect("spawn gateway node");
    let gateway = Gateway::new(local.clone(), NodeProbeFactory);
    let full = remote_addr.with(Protocol::P2p(remote.peer_id()));

    let res = gateway.handle(get(&format!("/add{full}")), client_addr()).await;
    assert_eq!(res.status(), StatusCode::SEE_OTHER);

    let res = timeout(
        TEST_TIMEOUT,
        gateway.handle(get(&format!("/term/{}/", remote.peer_id())), client_addr()),
    )
    .await
    .expect("tunnel attempt finishes in time");
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    local.shutdown().await;
    remote.shutdown().await;
}
