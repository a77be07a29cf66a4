use std::error::Error;

use libp2p::{PeerId, swarm::DialError};

use crate::host::{ConnectError, DialFailure};

/// Map a swarm dial failure onto the host-level error, keeping one entry per
/// attempted address. A handshake that proved another identity becomes a
/// `PeerIdMismatch` carrying that identity.
pub(super) fn connect_error(peer: PeerId, error: &DialError) -> ConnectError {
    let attempts = match error {
        DialError::WrongPeerId { obtained, address } => vec![DialFailure::PeerIdMismatch {
            address: address.clone(),
            expected: peer,
            actual: *obtained,
        }],
        DialError::Transport(errors) => errors
            .iter()
            .map(|(address, e)| DialFailure::Transport {
                address: address.clone(),
                reason: error_chain(e),
            })
            .collect(),
        DialError::NoAddresses => return ConnectError::NoAddresses(peer),
        other => vec![DialFailure::Other(error_chain(other))],
    };
    ConnectError::Dial { peer, attempts }
}

fn error_chain(error: &dyn Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        let msg = e.to_string();
        if !chain.contains(&msg) {
            chain.push_str(": ");
            chain.push_str(&msg);
        }
        source = e.source();
    }
    chain
}
