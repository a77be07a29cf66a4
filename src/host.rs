use std::{fmt, future::Future, io, time::Duration};

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    peerstore::Peerstore,
    stats::ConnectionRecord,
    types::{AddrInfo, Connectedness},
};

// ─── Dial errors ────────────────────────────────────────────────────────────

/// Why a single dial attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialFailure {
    #[error("peer id mismatch on {address}: expected {expected}, remote proved {actual}")]
    PeerIdMismatch {
        address: Multiaddr,
        expected: PeerId,
        actual: PeerId,
    },
    #[error("failed to dial {address}: {reason}")]
    Transport { address: Multiaddr, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Failure of a connect call, with every per-address attempt that was made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("failed to dial {peer}: {}", AttemptList(.attempts))]
    Dial {
        peer: PeerId,
        attempts: Vec<DialFailure>,
    },
    #[error("no addresses known for {0}")]
    NoAddresses(PeerId),
    #[error("dialing {peer} timed out after {after:?}")]
    Timeout { peer: PeerId, after: Duration },
    #[error("host is shut down")]
    HostClosed,
}

struct AttemptList<'a>(&'a [DialFailure]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [] => f.write_str("no attempts"),
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "all {} attempts failed", many.len())?;
                for attempt in many {
                    write!(f, "\n  * {attempt}")?;
                }
                Ok(())
            }
        }
    }
}

impl ConnectError {
    /// The identity actually proven by the remote, taken from the first
    /// attempt that failed on an identity mismatch.
    pub fn peer_id_mismatch(&self) -> Option<PeerId> {
        match self {
            ConnectError::Dial { attempts, .. } => attempts.iter().find_map(|a| match a {
                DialFailure::PeerIdMismatch { actual, .. } => Some(*actual),
                _ => None,
            }),
            ConnectError::NoAddresses(_) | ConnectError::Timeout { .. } | ConnectError::HostClosed => {
                None
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("peer {peer} does not support {protocol}")]
    UnsupportedProtocol {
        peer: PeerId,
        protocol: StreamProtocol,
    },
    #[error("failed to open {protocol} stream to {peer}")]
    Io {
        peer: PeerId,
        protocol: StreamProtocol,
        #[source]
        source: io::Error,
    },
}

// ─── Capabilities ───────────────────────────────────────────────────────────

pub trait Dialer: Send + Sync {
    /// Ensure a connection to `info.id`, dialing `info.addrs` when not
    /// already connected.
    fn connect(&self, info: AddrInfo) -> impl Future<Output = Result<(), ConnectError>> + Send;
}

/// The long-lived peer-to-peer host the gateway is built on.
pub trait Host: Dialer + Clone + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn peer_id(&self) -> PeerId;

    fn addrs(&self) -> Vec<Multiaddr>;

    fn peerstore(&self) -> &Peerstore;

    /// Fresh snapshot of every live connection.
    fn connections(&self) -> Vec<ConnectionRecord>;

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Protocols this host serves.
    fn protocols(&self) -> Vec<String>;

    fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> impl Future<Output = Result<Self::Stream, StreamError>> + Send;
}

/// A short-lived host used only to probe an address for its identity.
pub trait ProbeHost: Dialer + Sized {
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub trait ProbeHostFactory: Send + Sync {
    type Probe: ProbeHost;

    fn create(&self) -> impl Future<Output = anyhow::Result<Self::Probe>> + Send;
}
