use crate::host::{Host, ProbeHostFactory};

use super::{Node, NodeConfig};

/// Spins up a throwaway node with a fresh identity for each probe. The node
/// never listens and is shut down when the probe closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeProbeFactory;

impl ProbeHostFactory for NodeProbeFactory {
    type Probe = Node;

    async fn create(&self) -> anyhow::Result<Node> {
        let node = Node::spawn(NodeConfig::ephemeral()).await?;
        tracing::debug!(probe = %node.peer_id(), "probe host created");
        Ok(node)
    }
}
