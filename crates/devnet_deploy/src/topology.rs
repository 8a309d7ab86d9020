use std::collections::{BTreeMap, BTreeSet};

use devnet_core::{DevnetError, NetworkConfig};
use devnet_runtime::PortMapping;
use tracing::warn;

/// Peer lists and published ports derived from the connection pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    peers: BTreeMap<String, Vec<String>>,
    ports: BTreeMap<String, PortMapping>,
}

impl Topology {
    /// Validate the connection pairs and compute symmetric peer lists.
    ///
    /// Self-loops and unknown node names are rejected; a pair repeated in
    /// either orientation is kept once.
    pub fn build(config: &NetworkConfig) -> Result<Self, DevnetError> {
        let mut peers: BTreeMap<String, Vec<String>> = config
            .nodes
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        let mut edges: BTreeSet<(&str, &str)> = BTreeSet::new();
        for (a, b) in &config.connections {
            let (Some(node_a), Some(node_b)) = (config.node(a), config.node(b)) else {
                let unknown = if config.node(a).is_none() { a } else { b };
                return Err(DevnetError::Topology(format!(
                    "connection {a} <-> {b} names unknown node {unknown}"
                )));
            };
            if a == b {
                return Err(DevnetError::Topology(format!("node {a} cannot connect to itself")));
            }
            let edge = if a < b { (a.as_str(), b.as_str()) } else { (b.as_str(), a.as_str()) };
            if !edges.insert(edge) {
                warn!(a = %a, b = %b, "duplicate connection ignored");
                continue;
            }
            if let Some(list) = peers.get_mut(a) {
                list.push(format!("{b}:{}", node_b.port));
            }
            if let Some(list) = peers.get_mut(b) {
                list.push(format!("{a}:{}", node_a.port));
            }
        }

        let ports = config
            .nodes
            .iter()
            .map(|(name, node)| (name.clone(), PortMapping::tcp(node.port, node.hostport)))
            .collect();

        Ok(Self { peers, ports })
    }

    /// Peer endpoints (`name:port`) of `node`; empty when it has none.
    pub fn peers(&self, node: &str) -> &[String] {
        self.peers.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn port_mapping(&self, node: &str) -> Option<&PortMapping> {
        self.ports.get(node)
    }
}
