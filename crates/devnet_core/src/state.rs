use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DevnetError;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Addresses generated for one wallet account, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Wallet material captured during creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    /// Always empty: the wizard's seed display is never parsed.
    #[serde(default)]
    pub seed: String,
}

/// Everything remembered about one live node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNodeState {
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountState>,
    #[serde(default)]
    pub wallet: WalletState,
}

impl PersistedNodeState {
    fn for_container(container_id: String) -> Self {
        Self {
            container_id,
            ..Self::default()
        }
    }
}

/// The idempotency record: node name → node state, plus the network id.
///
/// Serialized flat, with the network id under the reserved `network` key
/// next to the node entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(flatten)]
    pub nodes: BTreeMap<String, PersistedNodeState>,
}

/// A single mutation of the record. Collaborators produce these; only the
/// owner of the [`PersistedState`] applies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDelta {
    NetworkCreated { id: String },
    NetworkRemoved,
    ContainerCreated { node: String, container_id: String },
    ContainerRemoved { node: String },
    AccountCreated { node: String, account: String },
    AddressGenerated { node: String, account: String, address: String },
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.network.is_none() && self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&PersistedNodeState> {
        self.nodes.get(name)
    }

    pub fn container_id(&self, node: &str) -> Option<&str> {
        self.nodes.get(node).map(|n| n.container_id.as_str())
    }

    /// Addresses recorded for `account` on `node`, oldest first.
    pub fn addresses(&self, node: &str, account: &str) -> &[String] {
        self.nodes
            .get(node)
            .and_then(|n| n.accounts.get(account))
            .map(|a| a.addresses.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_address(&self, node: &str, account: &str) -> Option<&str> {
        self.addresses(node, account).first().map(String::as_str)
    }

    /// Apply one delta. Account deltas for an untracked node are rejected.
    pub fn apply(&mut self, delta: StateDelta) -> Result<(), DevnetError> {
        debug!(?delta, "applying state delta");
        match delta {
            StateDelta::NetworkCreated { id } => {
                self.network = Some(id);
            }
            StateDelta::NetworkRemoved => {
                self.network = None;
            }
            StateDelta::ContainerCreated { node, container_id } => {
                self.nodes
                    .insert(node, PersistedNodeState::for_container(container_id));
            }
            StateDelta::ContainerRemoved { node } => {
                self.nodes.remove(&node);
            }
            StateDelta::AccountCreated { node, account } => {
                let entry = self
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| DevnetError::NotFound(node.clone()))?;
                entry.accounts.entry(account).or_default();
            }
            StateDelta::AddressGenerated { node, account, address } => {
                let entry = self
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| DevnetError::NotFound(node.clone()))?;
                entry.accounts.entry(account).or_default().addresses.push(address);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// JSON file backing a [`PersistedState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, or an empty one if the file does not exist yet.
    pub fn load(&self) -> Result<PersistedState, DevnetError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no storage file yet, starting empty");
            return Ok(PersistedState::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read storage: {}", self.path.display()))
            .map_err(storage_error)?;
        let state: PersistedState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse storage: {}", self.path.display()))
            .map_err(storage_error)?;
        info!(path = %self.path.display(), nodes = state.nodes.len(), "loaded storage");
        Ok(state)
    }

    /// Replace the file: write a temp file next to it, then rename over it.
    pub fn save(&self, state: &PersistedState) -> Result<(), DevnetError> {
        self.write_atomic(state).map_err(storage_error)?;
        debug!(path = %self.path.display(), nodes = state.nodes.len(), "storage flushed");
        Ok(())
    }

    fn write_atomic(&self, state: &PersistedState) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace storage: {}", self.path.display()))?;
        Ok(())
    }
}

fn storage_error(err: anyhow::Error) -> DevnetError {
    DevnetError::Storage(format!("{err:#}"))
}
