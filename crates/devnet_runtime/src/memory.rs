use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use devnet_core::DevnetError;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;
use uuid::Uuid;

use crate::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecResult, ExecStream, NetworkId};

const IDLE_FRAME: &[u8] = b"\r\n";

/// How a recorded command was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Attached,
    Detached,
    Interactive,
}

/// One command issued against a simulated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container: ContainerHandle,
    pub argv: Vec<String>,
    pub mode: ExecMode,
}

impl ExecRecord {
    /// First positional (non-flag) argument after the program name.
    pub fn subcommand(&self) -> Option<&str> {
        positional(&self.argv).first().copied()
    }
}

/// Prompts played by the simulated wallet-creation wizard.
#[derive(Debug, Clone)]
pub struct WizardScript {
    pub prompts: Vec<String>,
    /// Idle frames sent before every prompt.
    pub idle_frames: usize,
    /// Stop responding (but keep the stream open) before this prompt.
    pub stall_before: Option<usize>,
}

impl Default for WizardScript {
    fn default() -> Self {
        Self {
            prompts: vec![
                "Enter the private passphrase for your new wallet: ".into(),
                "Confirm passphrase: ".into(),
                "Do you want to add an additional layer of encryption for public data? (n/no/y/yes) [no]: ".into(),
                "Do you have an existing wallet seed you want to use? (n/no/y/yes) [no]: ".into(),
                "Your wallet generation seed is:\nabandon abandon ...\nOnce you have stored the seed in a safe and secure location, enter \"OK\" to continue: ".into(),
            ],
            idle_frames: 2,
            stall_before: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated container contents
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SimProcess {
    pid: u32,
    argv: Vec<String>,
}

impl SimProcess {
    fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug)]
struct SimContainer {
    spec: ContainerSpec,
    processes: Vec<SimProcess>,
    accounts: BTreeMap<String, Vec<String>>,
    wallet_passphrase: Option<String>,
    wizard_answers: Vec<String>,
    unlocked: bool,
    mining: bool,
}

impl SimContainer {
    fn new(spec: ContainerSpec) -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert("default".to_string(), Vec::new());
        Self {
            spec,
            processes: Vec::new(),
            accounts,
            wallet_passphrase: None,
            wizard_answers: Vec::new(),
            unlocked: false,
            mining: false,
        }
    }

    fn runs(&self, program: &str) -> bool {
        self.processes.iter().any(|p| p.program() == program)
    }
}

#[derive(Debug)]
struct Inner {
    containers: BTreeMap<String, SimContainer>,
    networks: BTreeMap<String, String>,
    exec_log: Vec<ExecRecord>,
    failing: HashSet<String>,
    fail_network_removal: bool,
    wizard: WizardScript,
    chain_daemon: String,
    wallet_daemon: String,
    next_pid: u32,
    next_address: u64,
}

// ---------------------------------------------------------------------------
// MemoryRuntime
// ---------------------------------------------------------------------------

/// In-memory [`ContainerRuntime`].
///
/// Tracks containers and networks, simulates daemon processes and a wallet
/// per container, and plays a scripted wallet-creation wizard over a
/// `tokio::io::duplex` pipe. No container engine is involved.
#[derive(Debug, Clone)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRuntime {
    /// Simulated runtime whose daemons are `bbld` and `btcwallet`.
    pub fn new() -> Self {
        Self::with_daemons("bbld", "btcwallet")
    }

    pub fn with_daemons(chain: impl Into<String>, wallet: impl Into<String>) -> Self {
        debug!("creating new MemoryRuntime");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                containers: BTreeMap::new(),
                networks: BTreeMap::new(),
                exec_log: Vec::new(),
                failing: HashSet::new(),
                fail_network_removal: false,
                wizard: WizardScript::default(),
                chain_daemon: chain.into(),
                wallet_daemon: wallet.into(),
                next_pid: 100,
                next_address: 1,
            })),
        }
    }

    // -- Fault injection ----------------------------------------------------

    /// Make every command whose program or subcommand is `name` fail.
    /// Detached launches of `name` silently never start.
    pub fn fail_command(&self, name: impl Into<String>) {
        self.inner.lock().failing.insert(name.into());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.failing.clear();
        inner.fail_network_removal = false;
    }

    pub fn fail_network_removal(&self) {
        self.inner.lock().fail_network_removal = true;
    }

    pub fn set_wizard_script(&self, script: WizardScript) {
        self.inner.lock().wizard = script;
    }

    /// Remove a container behind the tracker's back (like `docker rm -f`).
    pub fn remove_externally(&self, handle: &ContainerHandle) -> bool {
        self.inner.lock().containers.remove(handle.id()).is_some()
    }

    /// Remove a network behind the tracker's back (like `docker network rm`).
    pub fn remove_network_externally(&self, id: &NetworkId) -> bool {
        self.inner.lock().networks.remove(id.id()).is_some()
    }

    // -- Inspection ---------------------------------------------------------

    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.inner.lock().networks.len()
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.inner.lock().exec_log.clone()
    }

    /// Name the container was created with.
    pub fn container_name(&self, handle: &ContainerHandle) -> Option<String> {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.spec.name.clone())
    }

    pub fn container_spec(&self, handle: &ContainerHandle) -> Option<ContainerSpec> {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.spec.clone())
    }

    /// Answers the simulated wizard received, in order.
    pub fn wizard_answers(&self, handle: &ContainerHandle) -> Vec<String> {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.wizard_answers.clone())
            .unwrap_or_default()
    }

    /// Argv of every running process in the container.
    pub fn processes(&self, handle: &ContainerHandle) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.processes.iter().map(|p| p.argv.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_mining(&self, handle: &ContainerHandle) -> bool {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .is_some_and(|c| c.mining)
    }

    pub fn is_unlocked(&self, handle: &ContainerHandle) -> bool {
        self.inner
            .lock()
            .containers
            .get(handle.id())
            .is_some_and(|c| c.unlocked)
    }

    fn record(&self, handle: &ContainerHandle, argv: &[String], mode: ExecMode) {
        self.inner.lock().exec_log.push(ExecRecord {
            container: handle.clone(),
            argv: argv.to_vec(),
            mode,
        });
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_network(&self, name: &str) -> Result<NetworkId, DevnetError> {
        let mut inner = self.inner.lock();
        if inner.networks.values().any(|n| n == name) {
            return Err(DevnetError::command(
                format!("network create {name}"),
                anyhow::anyhow!("network with name {name} already exists"),
            ));
        }
        let id = Uuid::new_v4().simple().to_string();
        debug!(id = %id, name = %name, "creating simulated network");
        inner.networks.insert(id.clone(), name.to_string());
        Ok(NetworkId::new(id))
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<(), DevnetError> {
        let mut inner = self.inner.lock();
        let Some(name) = inner.networks.get(id.id()).cloned() else {
            return Err(DevnetError::NetworkNotFound(id.id().to_string()));
        };
        let attached = inner.containers.values().any(|c| c.spec.network == name);
        if inner.fail_network_removal || attached {
            return Err(DevnetError::command(
                format!("network rm {id}"),
                anyhow::anyhow!("network {name} has active endpoints"),
            ));
        }
        inner.networks.remove(id.id());
        Ok(())
    }

    async fn network_exists(&self, id: &NetworkId) -> Result<bool, DevnetError> {
        Ok(self.inner.lock().networks.contains_key(id.id()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, DevnetError> {
        let mut inner = self.inner.lock();
        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(DevnetError::AlreadyExists(spec.name.clone()));
        }
        if !inner.networks.values().any(|n| *n == spec.network) {
            return Err(DevnetError::command(
                format!("run {}", spec.name),
                anyhow::anyhow!("network {} not found", spec.network),
            ));
        }
        let id = Uuid::new_v4().simple().to_string();
        debug!(id = %id, image = %spec.image, name = %spec.name, "creating simulated container");
        inner.containers.insert(id.clone(), SimContainer::new(spec.clone()));
        Ok(ContainerHandle::new(id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerHandle>, DevnetError> {
        Ok(self
            .inner
            .lock()
            .containers
            .keys()
            .map(ContainerHandle::new)
            .collect())
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<ExecResult, DevnetError> {
        self.record(handle, argv, ExecMode::Attached);
        let mut inner = self.inner.lock();
        let failing = is_failing(&inner.failing, argv);
        let chain = inner.chain_daemon.clone();
        let wallet = inner.wallet_daemon.clone();
        let serial = inner.next_address;
        let container = inner
            .containers
            .get_mut(handle.id())
            .ok_or_else(|| DevnetError::NotFound(handle.id().to_string()))?;

        if failing {
            return Ok(ExecResult::failed(1, b"injected failure".to_vec()));
        }

        let result = simulate(container, argv, &chain, &wallet, handle, serial);
        if result.consumed_address {
            inner.next_address += 1;
        }
        Ok(result.output)
    }

    async fn exec_detached(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<(), DevnetError> {
        self.record(handle, argv, ExecMode::Detached);
        let mut inner = self.inner.lock();
        let failing = is_failing(&inner.failing, argv);
        let pid = inner.next_pid;
        let container = inner
            .containers
            .get_mut(handle.id())
            .ok_or_else(|| DevnetError::NotFound(handle.id().to_string()))?;
        if failing {
            debug!(container = %handle, cmd = %argv.join(" "), "simulated process exited at once");
            return Ok(());
        }
        container.processes.push(SimProcess {
            pid,
            argv: argv.to_vec(),
        });
        inner.next_pid += 1;
        Ok(())
    }

    async fn exec_interactive(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
    ) -> Result<ExecStream, DevnetError> {
        self.record(handle, argv, ExecMode::Interactive);
        let script = {
            let inner = self.inner.lock();
            if !inner.containers.contains_key(handle.id()) {
                return Err(DevnetError::NotFound(handle.id().to_string()));
            }
            inner.wizard.clone()
        };

        let (client, server) = tokio::io::duplex(4096);
        let inner = Arc::clone(&self.inner);
        let id = handle.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = play_wizard(server, script, inner, id).await {
                debug!(error = %e, "simulated wizard stopped");
            }
        });
        Ok(Box::new(client))
    }

    async fn stop_and_remove(&self, handle: &ContainerHandle) -> Result<(), DevnetError> {
        let removed = self.inner.lock().containers.remove(handle.id());
        match removed {
            Some(_) => {
                debug!(container = %handle, "removed simulated container");
                Ok(())
            }
            None => Err(DevnetError::NotFound(handle.id().to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Command simulation
// ---------------------------------------------------------------------------

struct Simulated {
    output: ExecResult,
    consumed_address: bool,
}

impl From<ExecResult> for Simulated {
    fn from(output: ExecResult) -> Self {
        Self {
            output,
            consumed_address: false,
        }
    }
}

fn positional(argv: &[String]) -> Vec<&str> {
    argv.iter()
        .skip(1)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect()
}

fn is_failing(failing: &HashSet<String>, argv: &[String]) -> bool {
    let program = argv.first().map(String::as_str).unwrap_or("");
    let sub = positional(argv).first().copied().unwrap_or("");
    failing.contains(program) || failing.contains(sub)
}

fn simulate(
    container: &mut SimContainer,
    argv: &[String],
    chain: &str,
    wallet: &str,
    handle: &ContainerHandle,
    serial: u64,
) -> Simulated {
    let program = argv.first().map(String::as_str).unwrap_or("");
    let args = positional(argv);

    match program {
        "pidof" => {
            let name = args.first().copied().unwrap_or("");
            let pids: Vec<String> = container
                .processes
                .iter()
                .filter(|p| p.program() == name)
                .map(|p| p.pid.to_string())
                .collect();
            if pids.is_empty() {
                ExecResult::failed(1, Vec::new()).into()
            } else {
                ExecResult::ok(format!("{}\n", pids.join(" "))).into()
            }
        }
        "kill" => {
            let mut missing = Vec::new();
            for pid in &args {
                let before = container.processes.len();
                container.processes.retain(|p| p.pid.to_string() != *pid);
                if container.processes.len() == before {
                    missing.push(*pid);
                }
            }
            if missing.is_empty() {
                ExecResult::ok(Vec::new()).into()
            } else {
                ExecResult::failed(1, format!("kill: ({}) - No such process", missing.join(", ")))
                    .into()
            }
        }
        _ => simulate_ctl(container, &args, chain, wallet, handle, serial),
    }
}

fn simulate_ctl(
    container: &mut SimContainer,
    args: &[&str],
    chain: &str,
    wallet: &str,
    handle: &ContainerHandle,
    serial: u64,
) -> Simulated {
    let sub = args.first().copied().unwrap_or("");
    let param = args.get(1).copied();

    match sub {
        "getinfo" if container.runs(chain) => ExecResult::ok(b"{\"blocks\": 0}".to_vec()).into(),
        "getinfo" => ExecResult::failed(1, b"connection refused".to_vec()).into(),
        _ if !container.runs(wallet) => ExecResult::failed(1, b"connection refused".to_vec()).into(),
        "getbalance" => ExecResult::ok(b"0".to_vec()).into(),
        "listaccounts" => {
            let map: serde_json::Map<String, serde_json::Value> = container
                .accounts
                .keys()
                .map(|k| (k.clone(), serde_json::json!(0.0)))
                .collect();
            ExecResult::ok(serde_json::Value::Object(map).to_string()).into()
        }
        "createnewaccount" => {
            let account = param.unwrap_or("");
            if container.accounts.contains_key(account) {
                ExecResult::failed(1, format!("account {account} already exists")).into()
            } else {
                container.accounts.insert(account.to_string(), Vec::new());
                ExecResult::ok(Vec::new()).into()
            }
        }
        "getnewaddress" => {
            let account = param.unwrap_or("default");
            let Some(addresses) = container.accounts.get_mut(account) else {
                return ExecResult::failed(1, format!("account {account} not found")).into();
            };
            let address = format!("S{}x{serial:04}", &handle.to_string());
            addresses.push(address.clone());
            Simulated {
                output: ExecResult::ok(format!("{address}\n")),
                consumed_address: true,
            }
        }
        "getaddressesbyaccount" => {
            let account = param.unwrap_or("default");
            match container.accounts.get(account) {
                Some(addresses) => {
                    ExecResult::ok(serde_json::json!(addresses).to_string()).into()
                }
                None => ExecResult::failed(1, format!("account {account} not found")).into(),
            }
        }
        "walletpassphrase" => {
            let given = param.unwrap_or("");
            if container.wallet_passphrase.as_deref() == Some(given) {
                container.unlocked = true;
                ExecResult::ok(Vec::new()).into()
            } else {
                ExecResult::failed(1, b"invalid passphrase for master private key".to_vec()).into()
            }
        }
        "setgenerate" => {
            container.mining = param == Some("1");
            ExecResult::ok(Vec::new()).into()
        }
        _ => ExecResult::ok(Vec::new()).into(),
    }
}

// ---------------------------------------------------------------------------
// Scripted wizard
// ---------------------------------------------------------------------------

async fn play_wizard(
    mut server: DuplexStream,
    script: WizardScript,
    inner: Arc<Mutex<Inner>>,
    container_id: String,
) -> std::io::Result<()> {
    for (index, prompt) in script.prompts.iter().enumerate() {
        if script.stall_before == Some(index) {
            std::future::pending::<()>().await;
        }
        for _ in 0..script.idle_frames {
            server.write_all(IDLE_FRAME).await?;
            tokio::task::yield_now().await;
        }
        server.write_all(prompt.as_bytes()).await?;

        let answer = read_line(&mut server).await?;
        let mut guard = inner.lock();
        if let Some(container) = guard.containers.get_mut(&container_id) {
            if index == 0 {
                container.wallet_passphrase = Some(answer.clone());
            }
            container.wizard_answers.push(answer);
        }
    }
    server
        .write_all(b"\r\nThe wallet has been created successfully.\r\n")
        .await?;
    server.shutdown().await
}

async fn read_line(stream: &mut DuplexStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
}
