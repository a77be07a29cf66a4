use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use constella::{
    address_book, expose,
    expose::LocalService,
    gateway::{self, Gateway},
    host::Host,
    node::{Node, NodeConfig, NodeProbeFactory},
    protocol,
    shutdown::shutdown_signal,
};
use libp2p::{Multiaddr, multiaddr::Protocol};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// constella — HTTP gateway into a libp2p network.
///
/// Requests to `/http/<peer>/...` and `/term/<peer>/...` are tunneled over
/// libp2p streams to the named peer; `/add/<multiaddr>` teaches the gateway
/// where a peer lives.
#[derive(Parser, Debug)]
#[command(name = "constella", version, about)]
struct Cli {
    /// Port the HTTP gateway listens on.
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// IP address the HTTP gateway binds to.
    #[arg(long, default_value = "0.0.0.0", env = "CONSTELLA_BIND")]
    bind: IpAddr,

    /// Relay multiaddr to reserve a circuit address on.
    #[arg(long, env = "RELAY")]
    relay: Option<Multiaddr>,

    /// Multiaddr(s) the libp2p host listens on.
    #[arg(
        long,
        default_value = "/ip4/0.0.0.0/tcp/0,/ip4/0.0.0.0/udp/0/quic-v1",
        env = "CONSTELLA_LISTEN",
        value_delimiter = ','
    )]
    listen: Vec<Multiaddr>,

    /// Path to a persistent identity file (Ed25519 keypair). Ephemeral when unset.
    #[arg(long, env = "CONSTELLA_IDENTITY")]
    identity: Option<PathBuf>,

    /// Serve a local HTTP service (host:port) to peers over /http/1.1.
    #[arg(long, env = "CONSTELLA_EXPOSE_HTTP")]
    expose_http: Option<LocalService>,

    /// Serve a local terminal service (host:port) to peers over /term/1.0.0.
    #[arg(long, env = "CONSTELLA_EXPOSE_TERM")]
    expose_term: Option<LocalService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let keypair = constella::identity::load(cli.identity.as_deref())?;
    let node = Node::spawn(NodeConfig::new(keypair).with_listen_addrs(cli.listen.clone()))
        .await
        .context("starting libp2p host")?;
    tracing::info!(peer_id = %node.peer_id(), "libp2p host started");

    if let Some(service) = cli.expose_http.clone() {
        expose::spawn(&node, protocol::http_protocol(), service)?;
    }
    if let Some(service) = cli.expose_term.clone() {
        expose::spawn(&node, protocol::term_protocol(), service)?;
    }

    let gateway = Arc::new(Gateway::new(node.clone(), NodeProbeFactory));

    if let Some(relay) = &cli.relay
        && let Err(e) = reserve_relay(&gateway, relay).await
    {
        tracing::warn!(%relay, error = %format!("{e:#}"), "relay reservation failed");
    }

    let listener = TcpListener::bind((cli.bind, cli.port))
        .await
        .with_context(|| format!("binding HTTP gateway on {}:{}", cli.bind, cli.port))?;

    let shutdown = async {
        match shutdown_signal().await {
            Ok(signal) => tracing::info!(%signal, "shutting down"),
            Err(e) => tracing::error!(error = %e, "signal handler failed, shutting down"),
        }
    };
    gateway::serve(listener, Arc::clone(&gateway), shutdown).await?;

    node.shutdown().await;
    Ok(())
}

/// Resolve the relay, remember it, and listen on a circuit through it so that
/// peers behind NAT can still reach this gateway.
async fn reserve_relay(
    gateway: &Gateway<Node, NodeProbeFactory>,
    relay: &Multiaddr,
) -> Result<()> {
    let node = gateway.host();
    let relay_id = address_book::register(node.peerstore(), gateway.resolver(), relay)
        .await
        .context("resolving relay identity")?;

    let circuit = relay
        .iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect::<Multiaddr>()
        .with(Protocol::P2p(relay_id))
        .with(Protocol::P2pCircuit);
    node.listen(circuit.clone()).await?;
    tracing::info!(relay = %relay_id, %circuit, "listening through relay");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_configuration() {
        let cli = Cli::try_parse_from(["constella"]).expect("parse defaults");
        assert_eq!(cli.bind.to_string(), "0.0.0.0");
        assert_eq!(cli.listen.len(), 2);
        assert!(cli.identity.is_none());
    }

    #[test]
    fn listen_addresses_split_on_commas() {
        let cli = Cli::try_parse_from([
            "constella",
            "--listen",
            "/ip4/127.0.0.1/tcp/4001,/ip6/::1/tcp/4001",
            "--expose-http",
            "127.0.0.1:3000",
        ])
        .expect("parse flags");
        assert_eq!(cli.listen.len(), 2);
        assert_eq!(
            cli.expose_http,
            Some(LocalService { host: "127.0.0.1".into(), port: 3000 })
        );
    }

    #[test]
    fn malformed_relay_is_rejected() {
        assert!(Cli::try_parse_from(["constella", "--relay", "not-a-multiaddr"]).is_err());
    }
}
