use std::{fmt, time::Duration};

use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use serde::{Serialize, Serializer, ser::SerializeStruct};
use thiserror::Error;

// ─── AddrInfo ───────────────────────────────────────────────────────────────

/// A peer identity together with the transport addresses it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrInfoError {
    #[error("empty multiaddr")]
    Empty,
    #[error("{0} does not end in a /p2p component")]
    MissingPeerId(Multiaddr),
}

impl AddrInfo {
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// Split `<transport>/p2p/<id>` into its identity and transport part.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, AddrInfoError> {
        if addr.is_empty() {
            return Err(AddrInfoError::Empty);
        }
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(id)) => {
                let addrs = match transport.is_empty() {
                    true => Vec::new(),
                    false => vec![transport],
                };
                Ok(Self { id, addrs })
            }
            _ => Err(AddrInfoError::MissingPeerId(addr.clone())),
        }
    }

    /// Every address with the identity appended, as used for dialing.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.id)))
            .collect()
    }
}

pub fn has_peer_id(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2p(_)))
}

impl Serialize for AddrInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let addrs: Vec<String> = self.addrs.iter().map(ToString::to_string).collect();
        let mut state = serializer.serialize_struct("AddrInfo", 2)?;
        state.serialize_field("ID", &self.id.to_string())?;
        state.serialize_field("Addrs", &addrs)?;
        state.end()
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("]}")
    }
}

// ─── AddrTtl ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrTtl {
    Permanent,
    Temporary(Duration),
}

// ─── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum Connectedness {
    NotConnected,
    Connected,
    Limited,
}
