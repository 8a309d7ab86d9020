use devnet_core::{DevnetError, NetworkConfig, PersistedState, StateDelta, StateStore};
use devnet_runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, NetworkId};
use tracing::{error, info, warn};

use crate::node::NodeController;
use crate::options::{DeployOptions, Readiness};
use crate::readiness::wait_until_ready;
use crate::topology::Topology;

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// Owns the state record for one network and runs deploy, destroy and
/// stop-mining against a [`ContainerRuntime`].
///
/// The record is flushed to the store when each operation ends, whether it
/// succeeded or not.
pub struct Deployer<R: ContainerRuntime> {
    runtime: R,
    config: NetworkConfig,
    options: DeployOptions,
    store: StateStore,
    state: PersistedState,
}

/// What a destroy run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    pub removed: Vec<String>,
    /// Nodes that had no live container.
    pub not_running: Vec<String>,
    pub network_removed: bool,
}

impl<R: ContainerRuntime> Deployer<R> {
    /// Load the record behind `store` and prepare to act on it.
    pub fn new(
        runtime: R,
        config: NetworkConfig,
        options: DeployOptions,
        store: StateStore,
    ) -> Result<Self, DevnetError> {
        let state = store.load()?;
        Ok(Self {
            runtime,
            config,
            options,
            store,
            state,
        })
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Bring every configured node up, peer them and start mining.
    pub async fn deploy(&mut self) -> Result<(), DevnetError> {
        let result = self.run_deploy().await;
        self.flush_after("deploy", result)
    }

    /// Remove every tracked container, then the network.
    pub async fn destroy(&mut self) -> Result<DestroyReport, DevnetError> {
        let result = self.run_destroy().await;
        self.flush_after("destroy", result)
    }

    /// Turn mining off on every node with a live container.
    pub async fn stop_mining(&self) -> Result<(), DevnetError> {
        for (name, node) in &self.config.nodes {
            let Some(handle) = self.live_handle(name).await? else {
                warn!(node = %name, "not running, cannot stop mining");
                continue;
            };
            NodeController::new(&self.runtime, node, self.config.simnet, &self.options)
                .attached(handle)
                .stop_mining()
                .await?;
        }
        Ok(())
    }

    // -- Deploy --------------------------------------------------------------

    async fn run_deploy(&mut self) -> Result<(), DevnetError> {
        let topology = Topology::build(&self.config)?;
        self.ensure_network().await?;

        let Self {
            runtime,
            config,
            options,
            state,
            ..
        } = &mut *self;
        let (runtime, config, options) = (&*runtime, &*config, &*options);

        // First pass: bring each node up to AccountsReady, one at a time.
        let mut controllers = Vec::with_capacity(config.nodes.len());
        for (name, node) in &config.nodes {
            let ctl = NodeController::new(runtime, node, config.simnet, options);

            if let Some(id) = state.container_id(name) {
                let handle = ContainerHandle::new(id);
                if runtime.is_live(&handle).await? {
                    info!(node = %name, container = %handle, "already running, skipping bring-up");
                    controllers.push(ctl.attached(handle));
                    continue;
                }
                warn!(node = %name, container = %handle, "tracked container is gone, recreating");
                state.apply(StateDelta::ContainerRemoved { node: name.clone() })?;
            }

            if options.image.is_empty() {
                return Err(DevnetError::Config(
                    "an image is required to create node containers".into(),
                ));
            }
            let spec = ContainerSpec {
                image: options.image.clone(),
                name: name.clone(),
                network: config.network.name.clone(),
                ports: topology.port_mapping(name).cloned().into_iter().collect(),
                platform: options.platform.clone(),
            };

            let mut ctl = ctl;
            state.apply(ctl.create_container(&spec).await?)?;
            ctl.generate_wallet().await?;

            ctl.start_chain_daemon(None, &[]).await?;
            ctl.wait_for_chain(options.settle_interval).await?;
            ctl.start_wallet_daemon().await?;
            ctl.wait_for_wallet(options.settle_interval).await?;
            ctl.unlock_wallet().await?;

            for account in node.accounts_with_default() {
                state.apply(ctl.ensure_account(&account).await?)?;
                state.apply(ctl.generate_address(&account).await?)?;
            }
            ctl.accounts_ready();
            controllers.push(ctl);
        }

        // Second pass: restart chain daemons with mining address and peers.
        for ctl in &mut controllers {
            let account = ctl.config().miningaccount.clone();
            let mining_addr = match state.first_address(ctl.name(), &account) {
                Some(addr) => Some(addr.to_string()),
                None => ctl.addresses(&account).await?.into_iter().next(),
            };
            if mining_addr.is_none() {
                warn!(node = %ctl.name(), account = %account, "no mining address, starting without one");
            }
            let peers = topology.peers(ctl.name()).to_vec();
            ctl.restart_chain_daemon(mining_addr.as_deref(), &peers).await?;
        }

        let budget = options.restart_settle_interval;
        match options.readiness {
            Readiness::FixedSettle => {
                wait_until_ready("network", Readiness::FixedSettle, budget, || async {
                    Ok::<_, DevnetError>(true)
                })
                .await?;
            }
            Readiness::Probe { .. } => {
                for ctl in &controllers {
                    ctl.wait_for_chain(budget).await?;
                }
            }
        }

        // Final pass: mining.
        for ctl in &mut controllers {
            ctl.start_mining().await?;
        }
        info!(network = %config.network.name, nodes = controllers.len(), "deploy complete");
        Ok(())
    }

    async fn ensure_network(&mut self) -> Result<(), DevnetError> {
        if let Some(id) = self.state.network.clone() {
            if self.runtime.network_exists(&NetworkId::new(id.as_str())).await? {
                info!(network = %id, "network already recorded, not creating it");
                return Ok(());
            }
            warn!(network = %id, "recorded network is gone, recreating");
            self.state.apply(StateDelta::NetworkRemoved)?;
        }
        let id = self.runtime.create_network(&self.config.network.name).await?;
        info!(name = %self.config.network.name, network = %id, "network created");
        self.state.apply(StateDelta::NetworkCreated {
            id: id.id().to_string(),
        })
    }

    // -- Destroy -------------------------------------------------------------

    async fn run_destroy(&mut self) -> Result<DestroyReport, DevnetError> {
        let mut report = DestroyReport::default();

        let mut names: Vec<String> = self.state.nodes.keys().cloned().collect();
        for name in self.config.nodes.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        for name in names {
            let Some(id) = self.state.container_id(&name).map(str::to_string) else {
                info!(node = %name, "not running");
                report.not_running.push(name);
                continue;
            };
            let handle = ContainerHandle::new(id);
            match self.runtime.stop_and_remove(&handle).await {
                Ok(()) => {
                    info!(node = %name, container = %handle, "container removed");
                    report.removed.push(name.clone());
                }
                Err(DevnetError::NotFound(_)) => {
                    warn!(node = %name, container = %handle, "not running, dropping record");
                    report.not_running.push(name.clone());
                }
                Err(e) => return Err(e),
            }
            self.state.apply(StateDelta::ContainerRemoved { node: name })?;
        }

        let Some(id) = self.state.network.clone() else {
            info!("no network recorded");
            return Ok(report);
        };
        match self.runtime.remove_network(&NetworkId::new(id.as_str())).await {
            Ok(()) => {
                info!(network = %id, "network removed");
                report.network_removed = true;
            }
            Err(DevnetError::NetworkNotFound(_)) => {
                warn!(network = %id, "network already gone, dropping record");
            }
            Err(e) => {
                error!(network = %id, error = %e, "network removal failed, keeping record");
                return Err(DevnetError::PartialTeardown {
                    network: id,
                    source: Box::new(e),
                });
            }
        }
        self.state.apply(StateDelta::NetworkRemoved)?;
        Ok(report)
    }

    // -- Helpers -------------------------------------------------------------

    async fn live_handle(&self, node: &str) -> Result<Option<ContainerHandle>, DevnetError> {
        let Some(id) = self.state.container_id(node) else {
            return Ok(None);
        };
        let handle = ContainerHandle::new(id);
        Ok(self.runtime.is_live(&handle).await?.then_some(handle))
    }

    /// Save the record. An operation error outranks a save error.
    fn flush_after<T>(&self, op: &str, result: Result<T, DevnetError>) -> Result<T, DevnetError> {
        let flushed = self.store.save(&self.state);
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => {
                error!(op, error = %e, "failed, state saved");
                Err(e)
            }
            (Err(e), Err(flush)) => {
                error!(op, error = %e, flush_error = %flush, "failed, and state could not be saved");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devnet_runtime::MemoryRuntime;
    use std::time::Duration;

    const CONFIG: &str = r#"{
        "network": {"name": "bbl-net"},
        "simnet": true,
        "nodes": {
            "A": {"user": "u", "pass": "p", "walletpass": "wa", "port": 18555,
                  "hostport": 30001, "accounts": ["b"], "miningaccount": "b"}
        },
        "connections": []
    }"#;

    fn deployer(rt: MemoryRuntime, dir: &tempfile::TempDir) -> Deployer<MemoryRuntime> {
        let options = DeployOptions {
            image: "bbld:test".into(),
            settle_interval: Duration::ZERO,
            restart_settle_interval: Duration::ZERO,
            readiness: Readiness::FixedSettle,
            ..DeployOptions::default()
        };
        Deployer::new(
            rt,
            NetworkConfig::from_json_str(CONFIG).unwrap(),
            options,
            StateStore::new(dir.path().join("storage.json")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn network_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let rt = MemoryRuntime::new();
        let mut d = deployer(rt.clone(), &dir);
        d.deploy().await.unwrap();
        d.deploy().await.unwrap();
        assert_eq!(rt.network_count(), 1);
    }

    #[tokio::test]
    async fn missing_image_is_config_error_when_creating() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployer(MemoryRuntime::new(), &dir);
        d.options.image.clear();
        let err = d.deploy().await.unwrap_err();
        assert!(matches!(err, DevnetError::Config(_)));
        // The network was still created and recorded.
        assert!(d.state().network.is_some());
    }

    #[tokio::test]
    async fn topology_error_precedes_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let rt = MemoryRuntime::new();
        let mut d = deployer(rt.clone(), &dir);
        d.config.connections.push(("A".into(), "A".into()));
        assert!(matches!(d.deploy().await, Err(DevnetError::Topology(_))));
        assert_eq!(rt.network_count(), 0);
        assert_eq!(rt.container_count(), 0);
    }

    #[tokio::test]
    async fn stop_mining_skips_untracked_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployer(MemoryRuntime::new(), &dir);
        d.stop_mining().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_on_empty_record_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployer(MemoryRuntime::new(), &dir);
        let report = d.destroy().await.unwrap();
        assert_eq!(report.not_running, ["A"]);
        assert!(!report.network_removed);
        assert!(dir.path().join("storage.json").exists());
    }
}
