use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::Instant,
};

use libp2p::{Multiaddr, PeerId};

use crate::types::{AddrInfo, AddrTtl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Never,
    At(Instant),
}

impl Expiry {
    fn from_ttl(ttl: AddrTtl, now: Instant) -> Self {
        match ttl {
            AddrTtl::Permanent => Expiry::Never,
            AddrTtl::Temporary(d) => Expiry::At(now + d),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        match self {
            Expiry::Never => true,
            Expiry::At(at) => *at > now,
        }
    }

    fn longest(self, other: Self) -> Self {
        match (self, other) {
            (Expiry::Never, _) | (_, Expiry::Never) => Expiry::Never,
            (Expiry::At(a), Expiry::At(b)) => Expiry::At(a.max(b)),
        }
    }
}

#[derive(Debug, Default)]
struct PeerRecord {
    addrs: HashMap<Multiaddr, Expiry>,
    protocols: Vec<String>,
}

impl PeerRecord {
    fn live_addrs(&self, now: Instant) -> Vec<Multiaddr> {
        let mut addrs: Vec<_> = self
            .addrs
            .iter()
            .filter(|(_, expiry)| expiry.is_live(now))
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort_by(|a, b| a.to_vec().cmp(&b.to_vec()));
        addrs
    }

    /// Forget expired addresses; true if anything about the peer remains.
    fn retain_live(&mut self, now: Instant) -> bool {
        self.addrs.retain(|_, expiry| expiry.is_live(now));
        !self.addrs.is_empty() || !self.protocols.is_empty()
    }

    fn is_known(&self, now: Instant) -> bool {
        !self.protocols.is_empty() || self.addrs.values().any(|e| e.is_live(now))
    }
}

/// Process-wide directory of known peers, their addresses and protocols.
///
/// Cheap to clone; every clone shares the same table. Peers are iterated in
/// `PeerId` order so that lookups over the set are deterministic.
#[derive(Debug, Clone)]
pub struct Peerstore {
    local_peer_id: PeerId,
    peers: Arc<RwLock<BTreeMap<PeerId, PeerRecord>>>,
}

impl Peerstore {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            peers: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Record `addr` for `peer`. Re-adding an address keeps the longer retention.
    pub fn add_addr(&self, peer: PeerId, addr: Multiaddr, ttl: AddrTtl) {
        if peer == self.local_peer_id {
            return;
        }
        let now = Instant::now();
        let expiry = Expiry::from_ttl(ttl, now);
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        prune(&mut peers, now);
        let record = peers.entry(peer).or_default();
        record
            .addrs
            .entry(addr)
            .and_modify(|current| *current = current.longest(expiry))
            .or_insert(expiry);
    }

    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: AddrTtl) {
        for addr in addrs {
            self.add_addr(peer, addr, ttl);
        }
    }

    pub fn set_protocols(&self, peer: PeerId, protocols: Vec<String>) {
        if peer == self.local_peer_id {
            return;
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        prune(&mut peers, Instant::now());
        match protocols.is_empty() {
            true => {
                if let Some(record) = peers.get_mut(&peer) {
                    record.protocols.clear();
                }
            }
            false => peers.entry(peer).or_default().protocols = protocols,
        }
    }

    /// Known remote peers, never including the local identity.
    pub fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .iter()
            .filter(|(_, record)| record.is_known(now))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer)
            .map(|record| record.live_addrs(now))
            .unwrap_or_default()
    }

    pub fn protocols(&self, peer: &PeerId) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer)
            .map(|record| record.protocols.clone())
            .unwrap_or_default()
    }

    pub fn addr_info(&self, peer: &PeerId) -> AddrInfo {
        AddrInfo::new(*peer, self.addrs(peer))
    }

    pub fn addr_infos(&self) -> Vec<AddrInfo> {
        self.peers().iter().map(|peer| self.addr_info(peer)).collect()
    }
}

/// Drop every record with neither a live address nor known protocols.
fn prune(peers: &mut BTreeMap<PeerId, PeerRecord>, now: Instant) {
    peers.retain(|_, record| record.retain_live(now));
}
