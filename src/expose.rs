//! Serving tunnel protocols to other peers: every inbound stream is bridged
//! byte-for-byte to a local TCP service.

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::IncomingStreams;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    net::TcpStream,
};

use crate::node::Node;

// ─── Local service address ──────────────────────────────────────────────────

/// `host:port` of a service reachable from this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalService {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocalServiceError {
    #[error("expected host:port, got {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
}

impl FromStr for LocalService {
    type Err = LocalServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LocalServiceError::MissingPort(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| LocalServiceError::InvalidPort(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(LocalServiceError::EmptyHost(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for LocalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.contains(':') {
            true => write!(f, "[{}]:{}", self.host, self.port),
            false => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

// ─── Accept loop ────────────────────────────────────────────────────────────

/// Serve `protocol` on `node`, bridging each inbound stream to `service`.
/// The loop runs until the node stops.
pub fn spawn(node: &Node, protocol: StreamProtocol, service: LocalService) -> Result<()> {
    let incoming = node.accept(protocol.clone())?;
    tracing::info!(%protocol, %service, "exposing local service");
    tokio::spawn(accept_loop(
        node.clone(),
        protocol,
        incoming,
        Arc::new(service),
    ));
    Ok(())
}

async fn accept_loop(
    node: Node,
    protocol: StreamProtocol,
    mut incoming: IncomingStreams,
    service: Arc<LocalService>,
) {
    while let Some((peer, stream)) = incoming.next().await {
        let stream = node.track_inbound(peer, &protocol, stream);
        let service = Arc::clone(&service);
        let protocol = protocol.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge(peer, stream, &service).await {
                tracing::warn!(%peer, %protocol, error = %e, "exposed stream failed");
            }
        });
    }
    tracing::debug!(%protocol, "accept loop ended");
}

async fn bridge<S>(peer: PeerId, mut stream: S, service: &LocalService) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tcp = TcpStream::connect((service.host.as_str(), service.port))
        .await
        .with_context(|| format!("connecting to local service at {service}"))?;
    tracing::debug!(%peer, %service, "bridging stream to local service");

    let (to_service, from_service) = copy_bidirectional(&mut stream, &mut tcp).await?;
    tracing::debug!(%peer, %service, to_service, from_service, "exposed stream closed");
    Ok(())
}
