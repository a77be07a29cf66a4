use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;

use crate::{
    host::Host,
    types::{AddrInfo, Direction},
};

// ─── Live records (produced by the host) ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: String,
    pub protocol: String,
    pub direction: Direction,
    pub opened: DateTime<Utc>,
    pub limited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub label: String,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    pub opened: DateTime<Utc>,
    pub limited: bool,
    pub streams: Vec<StreamRecord>,
}

impl ConnectionRecord {
    /// Name of the outermost transport protocol carrying this connection.
    pub fn transport(&self) -> String {
        use libp2p::multiaddr::Protocol;

        let mut transport = "unknown";
        for protocol in self.remote_addr.iter() {
            transport = match protocol {
                Protocol::P2pCircuit => "p2p-circuit",
                Protocol::Tcp(_) => "tcp",
                Protocol::QuicV1 => "quic-v1",
                Protocol::Ws(_) => "ws",
                Protocol::Wss(_) => "wss",
                Protocol::WebTransport => "webtransport",
                _ => continue,
            };
        }
        transport.to_string()
    }
}

// ─── Report ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub direction: Direction,
    pub opened: DateTime<Utc>,
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    #[serde(flatten)]
    pub stats: Stats,
    pub id: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnStats {
    #[serde(flatten)]
    pub stats: Stats,
    pub remote_peer: String,
    pub remote_addr: String,
    pub transport: String,
    pub num_streams: usize,
    pub streams: Vec<StreamStats>,
    pub protocols: Vec<String>,
}

/// Point-in-time view of the gateway host. Built per request, never cached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub id: String,
    pub addrs: Vec<String>,
    pub peers: Vec<String>,
    pub conns: BTreeMap<String, ConnStats>,
    pub connectedness: BTreeMap<String, String>,
    pub addr_infos: Vec<AddrInfo>,
    pub protocols: Vec<String>,
}

impl GatewayInfo {
    pub fn collect<H: Host>(host: &H) -> Self {
        let peerstore = host.peerstore();
        let peers = peerstore.peers();

        let conns = host
            .connections()
            .into_iter()
            .map(|conn| {
                let stats = conn_stats(&conn, peerstore.protocols(&conn.remote_peer));
                (conn.label, stats)
            })
            .collect();

        let connectedness = peers
            .iter()
            .map(|peer| (peer.to_string(), host.connectedness(peer).to_string()))
            .collect();

        Self {
            id: host.peer_id().to_string(),
            addrs: host.addrs().iter().map(ToString::to_string).collect(),
            peers: peers.iter().map(ToString::to_string).collect(),
            conns,
            connectedness,
            addr_infos: peerstore.addr_infos(),
            protocols: host.protocols(),
        }
    }
}

fn conn_stats(conn: &ConnectionRecord, protocols: Vec<String>) -> ConnStats {
    let streams: Vec<_> = conn
        .streams
        .iter()
        .map(|stream| StreamStats {
            stats: Stats {
                direction: stream.direction,
                opened: stream.opened,
                limited: stream.limited,
            },
            id: stream.id.clone(),
            protocol: stream.protocol.clone(),
        })
        .collect();
    ConnStats {
        stats: Stats {
            direction: conn.direction,
            opened: conn.opened,
            limited: conn.limited,
        },
        remote_peer: conn.remote_peer.to_string(),
        remote_addr: conn.remote_addr.to_string(),
        transport: conn.transport(),
        num_streams: streams.len(),
        streams,
        protocols,
    }
}
