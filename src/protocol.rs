use std::time::Duration;

use libp2p::StreamProtocol;

pub const HTTP_PROTOCOL: &str = "/http/1.1";
pub const TERM_PROTOCOL: &str = "/term/1.0.0";
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/constella/1.0.0";

/// Protocols every node speaks regardless of what it exposes.
pub const BASE_PROTOCOLS: &[&str] = &["/ipfs/id/1.0.0", "/ipfs/id/push/1.0.0", "/ipfs/ping/1.0.0"];

pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Retention for addresses used to dial a peer directly.
pub const DIALED_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Upper bound on idle pooled tunnel connections of one tunnel kind, across
/// all destination peers.
pub const MAX_IDLE_TUNNELS: usize = 100;
pub const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Retention for addresses a peer advertised itself through identify.
pub const IDENTIFIED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

pub fn http_protocol() -> StreamProtocol {
    StreamProtocol::new(HTTP_PROTOCOL)
}

pub fn term_protocol() -> StreamProtocol {
    StreamProtocol::new(TERM_PROTOCOL)
}
