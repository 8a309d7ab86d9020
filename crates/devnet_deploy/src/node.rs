use std::collections::BTreeMap;
use std::time::Duration;

use devnet_core::{DevnetError, NodeConfig, StateDelta};
use devnet_runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecResult};
use tracing::{debug, info, warn};

use crate::commands::{self, NodeCommands};
use crate::options::{DeployOptions, Readiness};
use crate::readiness::wait_until_ready;
use crate::wizard::{WizardDriver, WizardOutcome};

/// Poll interval for the daemon-exit wait when no probe interval is configured.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle position of one node. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodePhase {
    Absent,
    Created,
    DaemonRunning,
    WalletRunning,
    WalletUnlocked,
    AccountsReady,
    Connected,
    Mining,
}

/// Drives one node's container through its lifecycle.
///
/// Holds no reference to the state record; every mutation it causes is
/// handed back as a [`StateDelta`] for the caller to apply.
pub struct NodeController<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    node: &'a NodeConfig,
    simnet: bool,
    options: &'a DeployOptions,
    handle: Option<ContainerHandle>,
    phase: NodePhase,
}

impl<'a, R: ContainerRuntime + ?Sized> NodeController<'a, R> {
    pub fn new(runtime: &'a R, node: &'a NodeConfig, simnet: bool, options: &'a DeployOptions) -> Self {
        Self {
            runtime,
            node,
            simnet,
            options,
            handle: None,
            phase: NodePhase::Absent,
        }
    }

    /// Controller for a container that already went through bring-up.
    pub fn attached(mut self, handle: ContainerHandle) -> Self {
        self.handle = Some(handle);
        self.phase = NodePhase::AccountsReady;
        self
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn config(&self) -> &NodeConfig {
        self.node
    }

    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    pub fn handle(&self) -> Result<&ContainerHandle, DevnetError> {
        self.handle
            .as_ref()
            .ok_or_else(|| DevnetError::NotFound(self.node.name.clone()))
    }

    fn commands(&self) -> NodeCommands<'_> {
        NodeCommands::new(self.node, self.simnet, &self.options.binaries)
    }

    fn advance(&mut self, next: NodePhase) {
        if next < self.phase {
            warn!(node = %self.node.name, from = ?self.phase, to = ?next, "refusing to move node phase backwards");
            return;
        }
        debug!(node = %self.node.name, from = ?self.phase, to = ?next, "node phase");
        self.phase = next;
    }

    // -- Bring-up ------------------------------------------------------------

    pub async fn create_container(&mut self, spec: &ContainerSpec) -> Result<StateDelta, DevnetError> {
        info!(node = %self.node.name, image = %spec.image, "creating container");
        let handle = self.runtime.create_container(spec).await?;
        info!(node = %self.node.name, container = %handle, "container created");
        let delta = StateDelta::ContainerCreated {
            node: self.node.name.clone(),
            container_id: handle.id().to_string(),
        };
        self.handle = Some(handle);
        self.advance(NodePhase::Created);
        Ok(delta)
    }

    /// Create the wallet file by answering the creation wizard.
    pub async fn generate_wallet(&self) -> Result<WizardOutcome, DevnetError> {
        let handle = self.handle()?;
        info!(node = %self.node.name, "creating wallet");
        let mut stream = self
            .runtime
            .exec_interactive(handle, &self.commands().create_wallet())
            .await?;
        let outcome = WizardDriver::new(self.node.walletpass.clone(), self.options.wizard_step_timeout)
            .with_drain_timeout(self.options.wizard_drain_timeout)
            .with_prompt_check(self.options.prompt_check)
            .run(&mut stream)
            .await?;
        debug!(
            node = %self.node.name,
            answers = outcome.answers_sent,
            trailing_bytes = outcome.trailing.len(),
            "wallet wizard finished"
        );
        Ok(outcome)
    }

    pub async fn start_chain_daemon(
        &mut self,
        mining_addr: Option<&str>,
        peers: &[String],
    ) -> Result<(), DevnetError> {
        let argv = self.commands().chain_daemon(mining_addr, peers);
        info!(node = %self.node.name, peers = peers.len(), mining = mining_addr.is_some(), "starting chain daemon");
        self.runtime.exec_detached(self.handle()?, &argv).await?;
        self.advance(NodePhase::DaemonRunning);
        Ok(())
    }

    pub async fn start_wallet_daemon(&mut self) -> Result<(), DevnetError> {
        let argv = self.commands().wallet_daemon();
        info!(node = %self.node.name, "starting wallet daemon");
        self.runtime.exec_detached(self.handle()?, &argv).await?;
        self.advance(NodePhase::WalletRunning);
        Ok(())
    }

    pub async fn wait_for_chain(&self, budget: Duration) -> Result<(), DevnetError> {
        let argv = self.commands().chain_ctl(&["getinfo"]);
        let target = format!("{}/{}", self.node.name, self.options.binaries.chain);
        let argv = &argv;
        wait_until_ready(&target, self.options.readiness, budget, move || self.probe(argv)).await
    }

    pub async fn wait_for_wallet(&self, budget: Duration) -> Result<(), DevnetError> {
        let argv = self.commands().wallet_ctl(&["getbalance"]);
        let target = format!("{}/{}", self.node.name, self.options.binaries.wallet);
        let argv = &argv;
        wait_until_ready(&target, self.options.readiness, budget, move || self.probe(argv)).await
    }

    async fn probe(&self, argv: &[String]) -> Result<bool, DevnetError> {
        Ok(self.runtime.exec(self.handle()?, argv).await?.success())
    }

    /// Single unlock attempt; a rejected passphrase fails the node.
    pub async fn unlock_wallet(&mut self) -> Result<(), DevnetError> {
        let secs = self.options.unlock_duration_secs.to_string();
        let argv = self
            .commands()
            .wallet_ctl(&["walletpassphrase", self.node.walletpass.as_str(), secs.as_str()]);
        info!(node = %self.node.name, secs = self.options.unlock_duration_secs, "unlocking wallet");
        self.run_checked(&argv).await?;
        self.advance(NodePhase::WalletUnlocked);
        Ok(())
    }

    // -- Accounts ------------------------------------------------------------

    /// Account names the wallet currently knows.
    pub async fn list_accounts(&self) -> Result<Vec<String>, DevnetError> {
        let argv = self.commands().wallet_ctl(&["listaccounts"]);
        let out = self.run_checked(&argv).await?;
        let accounts: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&out.stdout)
            .map_err(|e| DevnetError::command(command_label(&argv), e))?;
        Ok(accounts.into_keys().collect())
    }

    pub async fn account_exists(&self, account: &str) -> Result<bool, DevnetError> {
        Ok(self.list_accounts().await?.iter().any(|a| a == account))
    }

    /// Create `account` unless the wallet already has it.
    pub async fn ensure_account(&mut self, account: &str) -> Result<StateDelta, DevnetError> {
        if self.account_exists(account).await? {
            debug!(node = %self.node.name, account = %account, "account already exists");
        } else {
            info!(node = %self.node.name, account = %account, "creating account");
            let argv = self.commands().wallet_ctl(&["createnewaccount", account]);
            self.run_checked(&argv).await?;
        }
        Ok(StateDelta::AccountCreated {
            node: self.node.name.clone(),
            account: account.to_string(),
        })
    }

    /// Request one new address for an existing account.
    pub async fn generate_address(&self, account: &str) -> Result<StateDelta, DevnetError> {
        self.require_account(account).await?;
        let argv = self.commands().wallet_ctl(&["getnewaddress", account]);
        let address = self.run_checked(&argv).await?.stdout_text();
        if address.is_empty() {
            return Err(DevnetError::command(
                command_label(&argv),
                anyhow::anyhow!("no address returned"),
            ));
        }
        info!(node = %self.node.name, account = %account, address = %address, "generated address");
        Ok(StateDelta::AddressGenerated {
            node: self.node.name.clone(),
            account: account.to_string(),
            address,
        })
    }

    /// Every address the wallet holds for `account`, oldest first.
    pub async fn addresses(&self, account: &str) -> Result<Vec<String>, DevnetError> {
        self.require_account(account).await?;
        let argv = self.commands().wallet_ctl(&["getaddressesbyaccount", account]);
        let out = self.run_checked(&argv).await?;
        serde_json::from_slice(&out.stdout).map_err(|e| DevnetError::command(command_label(&argv), e))
    }

    async fn require_account(&self, account: &str) -> Result<(), DevnetError> {
        if self.account_exists(account).await? {
            Ok(())
        } else {
            Err(DevnetError::AccountNotFound {
                node: self.node.name.clone(),
                account: account.to_string(),
            })
        }
    }

    /// Record that every account exists and holds an address.
    pub fn accounts_ready(&mut self) {
        self.advance(NodePhase::AccountsReady);
    }

    // -- Restart and mining --------------------------------------------------

    /// Stop the chain daemon and bring it back with a mining address and peers.
    pub async fn restart_chain_daemon(
        &mut self,
        mining_addr: Option<&str>,
        peers: &[String],
    ) -> Result<(), DevnetError> {
        let pidof = self.commands().pidof_chain();
        let found = self.runtime.exec(self.handle()?, &pidof).await?;
        let pids = found.stdout_text();
        if found.success() && !pids.is_empty() {
            info!(node = %self.node.name, pids = %pids, "stopping chain daemon");
            self.run_checked(&commands::kill(&pids)).await?;

            let interval = match self.options.readiness {
                Readiness::Probe { interval } => interval,
                Readiness::FixedSettle => EXIT_POLL_INTERVAL,
            };
            let target = format!("{}/{} exit", self.node.name, self.options.binaries.chain);
            let (this, pidof) = (&*self, &pidof);
            wait_until_ready(
                &target,
                Readiness::Probe { interval },
                self.options.settle_interval,
                move || async move { this.probe(pidof).await.map(|running| !running) },
            )
            .await?;
        } else {
            warn!(node = %self.node.name, "chain daemon not running, starting it fresh");
        }

        let argv = self.commands().chain_daemon(mining_addr, peers);
        info!(node = %self.node.name, peers = peers.len(), mining = mining_addr.is_some(), "restarting chain daemon");
        self.runtime.exec_detached(self.handle()?, &argv).await?;
        self.advance(NodePhase::Connected);
        Ok(())
    }

    pub async fn start_mining(&mut self) -> Result<(), DevnetError> {
        info!(node = %self.node.name, "starting mining");
        let argv = self.commands().wallet_ctl(&["setgenerate", "1"]);
        self.run_checked(&argv).await?;
        self.advance(NodePhase::Mining);
        Ok(())
    }

    pub async fn stop_mining(&self) -> Result<(), DevnetError> {
        info!(node = %self.node.name, "stopping mining");
        let argv = self.commands().wallet_ctl(&["setgenerate", "0"]);
        self.run_checked(&argv).await.map(drop)
    }

    /// Exec and treat a non-zero exit as a command failure.
    async fn run_checked(&self, argv: &[String]) -> Result<ExecResult, DevnetError> {
        let out = self.runtime.exec(self.handle()?, argv).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(DevnetError::command(
                command_label(argv),
                anyhow::anyhow!("exit code {}: {}", out.exit_code, out.stderr_text()),
            ))
        }
    }
}

/// Program and subcommand only, so credentials stay out of errors and logs.
fn command_label(argv: &[String]) -> String {
    let program = argv.first().map(String::as_str).unwrap_or("");
    match argv.iter().skip(1).find(|a| !a.starts_with('-')) {
        Some(sub) => format!("{program} {sub}"),
        None => program.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devnet_runtime::{ContainerRuntime, MemoryRuntime, PortMapping};

    fn node() -> NodeConfig {
        NodeConfig {
            name: "A".into(),
            user: "u".into(),
            pass: "p".into(),
            walletpass: "walletpass".into(),
            port: 18555,
            hostport: 30001,
            accounts: vec!["b".into()],
            miningaccount: "b".into(),
            rpcport: None,
        }
    }

    fn options() -> DeployOptions {
        DeployOptions {
            image: "bbld:test".into(),
            settle_interval: Duration::ZERO,
            restart_settle_interval: Duration::ZERO,
            readiness: Readiness::FixedSettle,
            wizard_step_timeout: Duration::from_secs(5),
            wizard_drain_timeout: Duration::from_secs(1),
            ..DeployOptions::default()
        }
    }

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "bbld:test".into(),
            name: "A".into(),
            network: "net".into(),
            ports: vec![PortMapping::tcp(18555, 30001)],
            platform: None,
        }
    }

    async fn runtime() -> MemoryRuntime {
        let rt = MemoryRuntime::new();
        rt.create_network("net").await.unwrap();
        rt
    }

    /// Controller brought up to WalletUnlocked.
    async fn unlocked<'a>(
        rt: &'a MemoryRuntime,
        node: &'a NodeConfig,
        opts: &'a DeployOptions,
    ) -> NodeController<'a, MemoryRuntime> {
        let mut ctl = NodeController::new(rt, node, true, opts);
        ctl.create_container(&spec()).await.unwrap();
        ctl.generate_wallet().await.unwrap();
        ctl.start_chain_daemon(None, &[]).await.unwrap();
        ctl.wait_for_chain(Duration::ZERO).await.unwrap();
        ctl.start_wallet_daemon().await.unwrap();
        ctl.wait_for_wallet(Duration::ZERO).await.unwrap();
        ctl.unlock_wallet().await.unwrap();
        ctl
    }

    #[tokio::test]
    async fn bring_up_walks_phases_in_order() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let ctl = unlocked(&rt, &node, &opts).await;
        assert_eq!(ctl.phase(), NodePhase::WalletUnlocked);

        let handle = ctl.handle().unwrap().clone();
        assert!(rt.is_unlocked(&handle));
        assert_eq!(
            rt.wizard_answers(&handle),
            ["walletpass", "walletpass", "no", "no", "OK"]
        );
    }

    #[tokio::test]
    async fn create_container_returns_delta() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = NodeController::new(&rt, &node, true, &opts);
        let delta = ctl.create_container(&spec()).await.unwrap();
        let StateDelta::ContainerCreated { node: name, container_id } = delta else {
            panic!("unexpected delta: {delta:?}");
        };
        assert_eq!(name, "A");
        assert!(rt.is_live(&ContainerHandle::new(container_id)).await.unwrap());
        assert_eq!(ctl.phase(), NodePhase::Created);
    }

    #[tokio::test]
    async fn operations_without_container_are_not_found() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = NodeController::new(&rt, &node, true, &opts);
        assert!(matches!(ctl.start_wallet_daemon().await, Err(DevnetError::NotFound(_))));
        assert!(matches!(ctl.generate_wallet().await, Err(DevnetError::NotFound(_))));
    }

    #[tokio::test]
    async fn ensure_account_is_idempotent() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = unlocked(&rt, &node, &opts).await;

        ctl.ensure_account("b").await.unwrap();
        ctl.ensure_account("b").await.unwrap();
        ctl.ensure_account("default").await.unwrap();

        let creates = rt
            .exec_log()
            .iter()
            .filter(|r| r.subcommand() == Some("createnewaccount"))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(ctl.list_accounts().await.unwrap(), ["b", "default"]);
    }

    #[tokio::test]
    async fn address_for_unknown_account_is_rejected() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let ctl = unlocked(&rt, &node, &opts).await;
        let err = ctl.generate_address("nope").await.unwrap_err();
        assert!(matches!(err, DevnetError::AccountNotFound { ref account, .. } if account == "nope"));
        assert!(matches!(ctl.addresses("nope").await, Err(DevnetError::AccountNotFound { .. })));
    }

    #[tokio::test]
    async fn each_generation_adds_one_address() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = unlocked(&rt, &node, &opts).await;
        ctl.ensure_account("b").await.unwrap();

        let mut generated = Vec::new();
        for _ in 0..3 {
            match ctl.generate_address("b").await.unwrap() {
                StateDelta::AddressGenerated { address, .. } => generated.push(address),
                other => panic!("unexpected delta: {other:?}"),
            }
        }
        assert_eq!(ctl.addresses("b").await.unwrap(), generated);
    }

    #[tokio::test]
    async fn rejected_passphrase_is_command_failure() {
        let rt = runtime().await;
        let (mut node, opts) = (node(), options());
        let mut ctl = NodeController::new(&rt, &node, true, &opts);
        ctl.create_container(&spec()).await.unwrap();
        ctl.generate_wallet().await.unwrap();
        let handle = ctl.handle().unwrap().clone();
        ctl.start_wallet_daemon().await.unwrap();
        drop(ctl);

        // Unlock with a different passphrase than the wizard set.
        node.walletpass = "wrong".into();
        let mut ctl = NodeController::new(&rt, &node, true, &opts).attached(handle);
        let err = ctl.unlock_wallet().await.unwrap_err();
        assert!(matches!(err, DevnetError::CommandExecution { .. }));
        assert!(!err.to_string().contains("wrong"), "passphrase leaked: {err}");
    }

    #[tokio::test]
    async fn restart_replaces_chain_daemon() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = unlocked(&rt, &node, &opts).await;
        let handle = ctl.handle().unwrap().clone();

        let peers = vec!["B:18555".to_string()];
        ctl.restart_chain_daemon(Some("Saddr"), &peers).await.unwrap();
        assert_eq!(ctl.phase(), NodePhase::Connected);

        let chains: Vec<Vec<String>> = rt
            .processes(&handle)
            .into_iter()
            .filter(|argv| argv[0] == "bbld")
            .collect();
        assert_eq!(chains.len(), 1);
        assert!(chains[0].contains(&"--miningaddr=Saddr".to_string()));
        assert!(chains[0].contains(&"--connect=B:18555".to_string()));
    }

    #[tokio::test]
    async fn restart_without_running_daemon_starts_fresh() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = NodeController::new(&rt, &node, true, &opts);
        ctl.create_container(&spec()).await.unwrap();
        ctl.restart_chain_daemon(None, &[]).await.unwrap();
        let handle = ctl.handle().unwrap().clone();
        assert_eq!(rt.processes(&handle).len(), 1);
    }

    #[tokio::test]
    async fn mining_toggles() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = unlocked(&rt, &node, &opts).await;
        let handle = ctl.handle().unwrap().clone();

        ctl.start_mining().await.unwrap();
        assert!(rt.is_mining(&handle));
        assert_eq!(ctl.phase(), NodePhase::Mining);
        ctl.stop_mining().await.unwrap();
        assert!(!rt.is_mining(&handle));
    }

    #[tokio::test]
    async fn phase_never_moves_backwards() {
        let rt = runtime().await;
        let (node, opts) = (node(), options());
        let mut ctl = unlocked(&rt, &node, &opts).await;
        ctl.start_mining().await.unwrap();
        ctl.start_wallet_daemon().await.unwrap();
        assert_eq!(ctl.phase(), NodePhase::Mining);
    }

    #[tokio::test]
    async fn chain_probe_fails_when_daemon_dies_at_start() {
        let rt = runtime().await;
        rt.fail_command("bbld");
        let node = node();
        let opts = DeployOptions {
            readiness: Readiness::Probe { interval: Duration::from_millis(10) },
            ..options()
        };
        let mut ctl = NodeController::new(&rt, &node, true, &opts);
        ctl.create_container(&spec()).await.unwrap();
        ctl.start_chain_daemon(None, &[]).await.unwrap();
        let err = ctl.wait_for_chain(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DevnetError::NotReady { ref target, .. } if target == "A/bbld"));
    }

    #[test]
    fn label_hides_credentials() {
        let argv: Vec<String> = ["btcctl", "--rpcuser=u", "--rpcpass=secret", "--wallet", "walletpassphrase", "pw", "1800"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(command_label(&argv), "btcctl walletpassphrase");
    }
}
