use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::error::DevnetError;

/// Account every wallet starts with; it always receives an address.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Top-level key of the storage file that holds the network id.
pub const RESERVED_NETWORK_KEY: &str = "network";

const SIMNET_RPC_PORT: u16 = 18556;
const MAINNET_RPC_PORT: u16 = 8334;

/// `network` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSection {
    pub name: String,
}

/// One node of the test network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, copied from the key of the `nodes` map on load.
    #[serde(skip)]
    pub name: String,
    /// RPC user for the chain and wallet daemons.
    pub user: String,
    /// RPC password for the chain and wallet daemons.
    pub pass: String,
    /// Private passphrase of the wallet created by the wizard.
    pub walletpass: String,
    /// P2P port inside the container (also the peer port other nodes dial).
    #[serde(deserialize_with = "port_from_json")]
    pub port: u16,
    /// Host port the P2P port is published on.
    #[serde(deserialize_with = "port_from_json")]
    pub hostport: u16,
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Account whose first address receives block rewards.
    pub miningaccount: String,
    /// RPC port inside the container; network default when absent.
    #[serde(
        default,
        deserialize_with = "optional_port_from_json",
        skip_serializing_if = "Option::is_none"
    )]
    pub rpcport: Option<u16>,
}

impl NodeConfig {
    /// Configured accounts followed by the implicit `default` account, each once.
    pub fn accounts_with_default(&self) -> Vec<String> {
        let mut accounts: Vec<String> = Vec::with_capacity(self.accounts.len() + 1);
        for account in self.accounts.iter().map(String::as_str).chain([DEFAULT_ACCOUNT]) {
            if !accounts.iter().any(|a| a == account) {
                accounts.push(account.to_string());
            }
        }
        accounts
    }

    /// RPC port the chain daemon listens on.
    pub fn rpc_port(&self, simnet: bool) -> u16 {
        self.rpcport
            .unwrap_or(if simnet { SIMNET_RPC_PORT } else { MAINNET_RPC_PORT })
    }
}

/// The whole config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: NetworkSection,
    #[serde(default)]
    pub simnet: bool,
    /// Nodes in file order, which is also the bring-up order.
    pub nodes: IndexMap<String, NodeConfig>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
}

impl NetworkConfig {
    /// Load and validate a config file. A missing file is a config error.
    pub fn load_from_path(path: &Path) -> Result<Self, DevnetError> {
        if !path.exists() {
            return Err(DevnetError::Config(format!(
                "Configuration file {} does not exist",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            DevnetError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&content)?;
        info!(path = %path.display(), nodes = config.nodes.len(), "loaded network config");
        Ok(config)
    }

    /// Parse and validate config JSON.
    pub fn from_json_str(content: &str) -> Result<Self, DevnetError> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| DevnetError::Config(format!("Failed to parse config: {e}")))?;
        for (name, node) in config.nodes.iter_mut() {
            node.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DevnetError> {
        if self.network.name.trim().is_empty() {
            return Err(DevnetError::Config("network.name must not be empty".into()));
        }
        for (name, node) in &self.nodes {
            if name == RESERVED_NETWORK_KEY {
                return Err(DevnetError::Config(format!(
                    "node name `{RESERVED_NETWORK_KEY}` is reserved"
                )));
            }
            if node.miningaccount != DEFAULT_ACCOUNT
                && !node.accounts.contains(&node.miningaccount)
            {
                return Err(DevnetError::Config(format!(
                    "node {name}: mining account {} is not among its accounts",
                    node.miningaccount
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.get(name)
    }
}

// ---------------------------------------------------------------------------
// Port parsing: the config format historically carries ports as strings.
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn into_port<E: serde::de::Error>(self) -> Result<u16, E> {
        match self {
            PortValue::Number(n) => {
                u16::try_from(n).map_err(|_| E::custom(format!("port {n} out of range")))
            }
            PortValue::Text(s) => s
                .trim()
                .parse::<u16>()
                .map_err(|_| E::custom(format!("invalid port `{s}`"))),
        }
    }
}

fn port_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    PortValue::deserialize(deserializer)?.into_port()
}

fn optional_port_from_json<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u16>, D::Error> {
    Option::<PortValue>::deserialize(deserializer)?
        .map(PortValue::into_port::<D::Error>)
        .transpose()
}
