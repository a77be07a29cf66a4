//! HTTP client plumbing that rides on libp2p streams.
//!
//! Every tunnel connection is one stream opened under the tunnel's protocol
//! and driven by an HTTP/1.1 client connection. Idle connections of a tunnel
//! kind share one pool across all destination peers: it never holds more than
//! [`MAX_IDLE_TUNNELS`] of them, evicting the least recently used, and drops
//! any that sat idle for longer than [`TUNNEL_IDLE_TIMEOUT`].

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, combinators::UnsyncBoxBody};
use hyper::{
    body::{Body, Frame, Incoming, SizeHint},
    client::conn::http1::{self, SendRequest},
};
use hyper_util::rt::TokioIo;
use libp2p::{PeerId, StreamProtocol};
use thiserror::Error;

use crate::{
    host::{Host, StreamError},
    protocol::{self, MAX_IDLE_TUNNELS, TUNNEL_IDLE_TIMEOUT},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

// ─── TunnelKind ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Term,
}

impl TunnelKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            TunnelKind::Http => "/http",
            TunnelKind::Term => "/term",
        }
    }

    pub fn protocol(&self) -> StreamProtocol {
        match self {
            TunnelKind::Http => protocol::http_protocol(),
            TunnelKind::Term => protocol::term_protocol(),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TunnelDialError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("http handshake over tunnel stream failed")]
    Handshake(#[source] hyper::Error),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Dial(#[from] TunnelDialError),
    #[error("upstream request failed")]
    Upstream(#[source] hyper::Error),
}

// ─── Idle pool ──────────────────────────────────────────────────────────────

struct IdleTunnel {
    peer: PeerId,
    sender: SendRequest<ProxyBody>,
    since: Instant,
}

struct IdlePool {
    // Least recently used at the front.
    entries: VecDeque<IdleTunnel>,
    max_idle: usize,
    timeout: Duration,
}

impl IdlePool {
    fn checkout(&mut self, peer: &PeerId, now: Instant) -> Option<SendRequest<ProxyBody>> {
        self.prune(now);
        let idx = self
            .entries
            .iter()
            .rposition(|idle| idle.peer == *peer && idle.sender.is_ready())?;
        self.entries.remove(idx).map(|idle| idle.sender)
    }

    fn checkin(&mut self, peer: PeerId, sender: SendRequest<ProxyBody>, now: Instant) {
        self.prune(now);
        self.entries.push_back(IdleTunnel {
            peer,
            sender,
            since: now,
        });
        while self.entries.len() > self.max_idle {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!(peer = %evicted.peer, "evicted idle tunnel");
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries.retain(|idle| {
            !idle.sender.is_closed() && now.saturating_duration_since(idle.since) < timeout
        });
    }
}

fn lock(pool: &Mutex<IdlePool>) -> std::sync::MutexGuard<'_, IdlePool> {
    pool.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// Issues HTTP requests to peers over pooled tunnel streams.
pub struct TunnelClient<H> {
    host: H,
    kind: TunnelKind,
    idle: Arc<Mutex<IdlePool>>,
}

impl<H: Clone> Clone for TunnelClient<H> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            kind: self.kind,
            idle: Arc::clone(&self.idle),
        }
    }
}

impl<H: Host> TunnelClient<H> {
    pub fn new(host: H, kind: TunnelKind) -> Self {
        Self::with_limits(host, kind, MAX_IDLE_TUNNELS, TUNNEL_IDLE_TIMEOUT)
    }

    pub fn with_limits(host: H, kind: TunnelKind, max_idle: usize, timeout: Duration) -> Self {
        let idle = Arc::new(Mutex::new(IdlePool {
            entries: VecDeque::new(),
            max_idle,
            timeout,
        }));
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(reap_idle(Arc::downgrade(&idle), timeout));
        }
        Self { host, kind, idle }
    }

    /// Number of connections currently parked in the idle pool.
    pub fn idle_count(&self) -> usize {
        let mut pool = lock(&self.idle);
        pool.prune(Instant::now());
        pool.entries.len()
    }

    /// Send `req` to `peer`. The request URI is forwarded as-is, so it
    /// should be in origin form (`/path?query`).
    ///
    /// A `101 Switching Protocols` response takes the connection out of the
    /// pool for good; `hyper::upgrade::on` on the response yields its I/O.
    pub async fn request(
        &self,
        peer: PeerId,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TunnelError> {
        let checked_out = lock(&self.idle).checkout(&peer, Instant::now());
        let mut sender = match checked_out {
            Some(sender) => {
                tracing::trace!(%peer, kind = %self.kind, "reusing idle tunnel");
                sender
            }
            None => self.open_tunnel(peer).await?,
        };

        let res = sender
            .send_request(req)
            .await
            .map_err(TunnelError::Upstream)?;

        match res.status() == StatusCode::SWITCHING_PROTOCOLS {
            true => Ok(res.map(|body| body.map_err(Into::into).boxed_unsync())),
            false => {
                let release = Release {
                    pool: Arc::downgrade(&self.idle),
                    peer,
                    sender,
                };
                Ok(res.map(|body| PooledBody::new(body, release).boxed_unsync()))
            }
        }
    }

    async fn open_tunnel(&self, peer: PeerId) -> Result<SendRequest<ProxyBody>, TunnelDialError> {
        let protocol = self.kind.protocol();
        let stream = self.host.new_stream(peer, protocol.clone()).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(TunnelDialError::Handshake)?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(%peer, error = %e, "tunnel connection closed with error");
            }
        });
        tracing::debug!(%peer, %protocol, "opened tunnel stream");
        Ok(sender)
    }
}

async fn reap_idle(pool: Weak<Mutex<IdlePool>>, timeout: Duration) {
    let mut interval = tokio::time::interval((timeout / 2).max(Duration::from_millis(10)));
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        lock(&pool).prune(Instant::now());
    }
}

// ─── Response body ──────────────────────────────────────────────────────────

struct Release {
    pool: Weak<Mutex<IdlePool>>,
    peer: PeerId,
    sender: SendRequest<ProxyBody>,
}

impl Release {
    /// Park the connection once it is ready for another request.
    fn release(self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let Release {
                pool,
                peer,
                mut sender,
            } = self;
            if sender.ready().await.is_err() {
                return;
            }
            if let Some(pool) = pool.upgrade() {
                lock(&pool).checkin(peer, sender, Instant::now());
            }
        });
    }
}

/// Upstream response body that hands its connection back to the pool when
/// fully read. A body dropped half-way takes the connection down with it.
struct PooledBody {
    inner: Incoming,
    release: Option<Release>,
}

impl PooledBody {
    fn new(inner: Incoming, release: Release) -> Self {
        Self {
            inner,
            release: Some(release),
        }
    }

    fn finish(&mut self) {
        if let Some(release) = self.release.take() {
            release.release();
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None)) {
            self.finish();
        }
        polled.map(|frame| frame.map(|f| f.map_err(Into::into)))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for PooledBody {
    fn drop(&mut self) {
        match self.inner.is_end_stream() {
            true => self.finish(),
            false => {
                self.release.take();
            }
        }
    }
}
