use libp2p::{identify, identity::Keypair, ping, relay, swarm::NetworkBehaviour};

use crate::protocol;

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub relay_client: relay::client::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl Behaviour {
    pub fn new(keypair: &Keypair, relay_client: relay::client::Behaviour) -> Self {
        let identify = identify::Behaviour::new(
            identify::Config::new(
                protocol::IDENTIFY_PROTOCOL_VERSION.to_string(),
                keypair.public(),
            )
            .with_agent_version(format!("constella/{}", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            relay_client,
            identify,
            ping: ping::Behaviour::default(),
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}
