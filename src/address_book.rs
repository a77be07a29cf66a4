use libp2p::{Multiaddr, PeerId};

use crate::{
    host::ProbeHostFactory,
    peerstore::Peerstore,
    resolve::{IdentityResolver, ResolveError},
    types::AddrTtl,
};

/// Resolve `addr` and remember every resulting address for good.
///
/// Nothing is written to the peerstore unless resolution succeeds.
pub async fn register<F: ProbeHostFactory>(
    peerstore: &Peerstore,
    resolver: &IdentityResolver<F>,
    addr: &Multiaddr,
) -> Result<PeerId, ResolveError> {
    let info = resolver.resolve(addr).await?;
    peerstore.add_addrs(info.id, info.addrs.iter().cloned(), AddrTtl::Permanent);
    tracing::info!(%addr, peer = %info.id, addrs = info.addrs.len(), "registered peer address");
    Ok(info.id)
}
