use std::{
    collections::{BTreeMap, HashMap},
    io,
    pin::Pin,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId, core::ConnectedPoint, multiaddr::Protocol, swarm::ConnectionId};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    stats::{ConnectionRecord, StreamRecord},
    types::{Connectedness, Direction},
};

#[derive(Debug, Clone)]
struct StreamEntry {
    protocol: String,
    direction: Direction,
    opened: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ConnEntry {
    seq: u64,
    peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    opened: DateTime<Utc>,
    limited: bool,
    streams: BTreeMap<u64, StreamEntry>,
}

impl ConnEntry {
    fn record(&self) -> ConnectionRecord {
        ConnectionRecord {
            label: format!("conn-{}", self.seq),
            remote_peer: self.peer,
            remote_addr: self.remote_addr.clone(),
            direction: self.direction,
            opened: self.opened,
            limited: self.limited,
            streams: self
                .streams
                .iter()
                .map(|(id, stream)| StreamRecord {
                    id: format!("stream-{id}"),
                    protocol: stream.protocol.clone(),
                    direction: stream.direction,
                    opened: stream.opened,
                    limited: self.limited,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    conns: HashMap<ConnectionId, ConnEntry>,
    next_conn: u64,
    next_stream: u64,
}

/// Live connections of a node and the streams running over them. Written by
/// the swarm task and by stream guards, read for info snapshots.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<Table>>,
}

pub fn is_relayed(endpoint: &ConnectedPoint) -> bool {
    fn has_circuit(addr: &Multiaddr) -> bool {
        addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    match endpoint {
        ConnectedPoint::Dialer { address, .. } => has_circuit(address),
        ConnectedPoint::Listener {
            local_addr,
            send_back_addr,
        } => has_circuit(local_addr) || has_circuit(send_back_addr),
    }
}

impl ConnectionTable {
    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new connection and return its label.
    pub fn opened(&self, id: ConnectionId, peer: PeerId, endpoint: &ConnectedPoint) -> String {
        let mut table = self.write();
        table.next_conn += 1;
        let seq = table.next_conn;
        let direction = match endpoint.is_dialer() {
            true => Direction::Outbound,
            false => Direction::Inbound,
        };
        table.conns.insert(
            id,
            ConnEntry {
                seq,
                peer,
                remote_addr: endpoint.get_remote_address().clone(),
                direction,
                opened: Utc::now(),
                limited: is_relayed(endpoint),
                streams: BTreeMap::new(),
            },
        );
        format!("conn-{seq}")
    }

    pub fn closed(&self, id: &ConnectionId) {
        self.write().conns.remove(id);
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.read().conns.values().any(|c| c.peer == *peer)
    }

    pub fn connectedness(&self, peer: &PeerId) -> Connectedness {
        let table = self.read();
        let mut to_peer = table.conns.values().filter(|c| c.peer == *peer);
        match to_peer.next() {
            None => Connectedness::NotConnected,
            Some(first) => match first.limited && to_peer.all(|c| c.limited) {
                true => Connectedness::Limited,
                false => Connectedness::Connected,
            },
        }
    }

    /// Snapshot of every live connection, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let table = self.read();
        let mut entries: Vec<_> = table.conns.values().collect();
        entries.sort_by_key(|c| c.seq);
        entries.into_iter().map(ConnEntry::record).collect()
    }

    /// Attribute a stream to the oldest live connection to `peer`. The
    /// record goes away when the returned stream is dropped.
    pub fn track<S>(
        &self,
        peer: PeerId,
        protocol: &str,
        direction: Direction,
        stream: S,
    ) -> TrackedStream<S> {
        let mut table = self.write();
        table.next_stream += 1;
        let stream_id = table.next_stream;
        let oldest = table
            .conns
            .values_mut()
            .filter(|c| c.peer == peer)
            .min_by_key(|c| c.seq);
        let guard = match oldest {
            Some(conn) => {
                conn.streams.insert(
                    stream_id,
                    StreamEntry {
                        protocol: protocol.to_string(),
                        direction,
                        opened: Utc::now(),
                    },
                );
                Some(StreamGuard {
                    table: Arc::downgrade(&self.inner),
                    stream_id,
                })
            }
            None => {
                tracing::debug!(%peer, protocol, "stream without a live connection is not tracked");
                None
            }
        };
        TrackedStream {
            inner: stream,
            _guard: guard,
        }
    }
}

#[derive(Debug)]
struct StreamGuard {
    table: Weak<RwLock<Table>>,
    stream_id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.write().unwrap_or_else(|e| e.into_inner());
        for conn in table.conns.values_mut() {
            if conn.streams.remove(&self.stream_id).is_some() {
                break;
            }
        }
    }
}

/// A stream whose lifetime is reflected in the node's connection table.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    _guard: Option<StreamGuard>,
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
