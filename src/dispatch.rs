use libp2p::PeerId;

use crate::tunnel::TunnelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel(TunnelKind),
    Add,
    Info,
}

const ROUTES: &[(&str, Route)] = &[
    ("/http", Route::Tunnel(TunnelKind::Http)),
    ("/term", Route::Tunnel(TunnelKind::Term)),
    ("/add", Route::Add),
];

/// Pick the handler for a request path. Plain string-prefix match, checked
/// in table order; anything unmatched gets the info report.
pub fn dispatch(path: &str) -> Route {
    ROUTES
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map(|(_, route)| *route)
        .unwrap_or(Route::Info)
}

/// A tunnel target parsed out of `<prefix>/<peer>/<rest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub peer: PeerId,
    /// Request path to forward, always starting with `/`.
    pub rest: String,
}

/// Find which known peer a tunnel path addresses.
///
/// The peer must occupy a whole path segment: `/http/<id>` or
/// `/http/<id>/...`. Candidates are tried in the order given.
pub fn match_peer(
    path: &str,
    prefix: &str,
    peers: impl IntoIterator<Item = PeerId>,
) -> Option<TunnelTarget> {
    let after = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let (segment, rest) = match after.find('/') {
        Some(idx) => after.split_at(idx),
        None => (after, ""),
    };
    let peer = peers
        .into_iter()
        .find(|peer| peer.to_string() == segment)?;
    let rest = match rest.is_empty() {
        true => "/".to_string(),
        false => rest.to_string(),
    };
    Some(TunnelTarget { peer, rest })
}
