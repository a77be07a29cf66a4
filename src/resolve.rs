//! Turning a multiaddr into the identity of the peer listening there.
//!
//! Addresses that end in `/p2p/<id>` are decoded directly. Bare transport
//! addresses have no identity to decode, so a throwaway host dials them with
//! a fabricated identity; the remote then proves its real identity during the
//! security handshake and the dial fails with a mismatch that carries it.

use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use thiserror::Error;

use crate::{
    host::{ConnectError, Dialer, ProbeHost, ProbeHostFactory},
    types::{AddrInfo, AddrInfoError, has_peer_id},
};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed address: {0}")]
    AddressMalformed(#[from] AddrInfoError),
    #[error("failed to construct probe host: {0:#}")]
    ProbeHostConstruction(anyhow::Error),
    #[error(transparent)]
    Unreachable(ConnectError),
    #[error("failed to resolve {addr}: {reason}")]
    Resolution { addr: Multiaddr, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    EmbeddedIdentity,
    Probe,
}

impl Strategy {
    pub fn for_addr(addr: &Multiaddr) -> Self {
        match has_peer_id(addr) {
            true => Strategy::EmbeddedIdentity,
            false => Strategy::Probe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver<F> {
    probes: F,
}

impl<F: ProbeHostFactory> IdentityResolver<F> {
    pub fn new(probes: F) -> Self {
        Self { probes }
    }

    pub async fn resolve(&self, addr: &Multiaddr) -> Result<AddrInfo, ResolveError> {
        match Strategy::for_addr(addr) {
            Strategy::EmbeddedIdentity => Ok(AddrInfo::from_p2p_addr(addr)?),
            Strategy::Probe => self.resolve_by_probe(addr).await,
        }
    }

    async fn resolve_by_probe(&self, addr: &Multiaddr) -> Result<AddrInfo, ResolveError> {
        let fabricated = PeerId::random();
        let target = AddrInfo::from_p2p_addr(&addr.clone().with(Protocol::P2p(fabricated)))?;

        let probe = self
            .probes
            .create()
            .await
            .map_err(ResolveError::ProbeHostConstruction)?;
        tracing::debug!(%addr, %fabricated, "probing address for peer identity");
        let outcome = probe.connect(target.clone()).await;
        probe.close().await;

        let actual = match outcome {
            Ok(()) => {
                return Err(ResolveError::Resolution {
                    addr: addr.clone(),
                    reason: format!("remote accepted fabricated identity {fabricated}"),
                });
            }
            Err(err) => match err.peer_id_mismatch() {
                Some(actual) => actual,
                None => {
                    tracing::debug!(%addr, error = %err, "probe failed without identity mismatch");
                    return Err(ResolveError::Unreachable(err));
                }
            },
        };

        if actual == fabricated {
            return Err(ResolveError::Resolution {
                addr: addr.clone(),
                reason: "mismatch reported the fabricated identity".to_string(),
            });
        }

        tracing::info!(%addr, peer = %actual, "resolved peer identity by probe");
        Ok(AddrInfo::new(actual, target.addrs))
    }
}
