use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Platform pinned on every node container unless overridden.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// How long to wait for daemons after starting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    /// Sleep for the whole settle interval, probing nothing.
    FixedSettle,
    /// Probe every `interval` until ready or the settle interval runs out.
    Probe { interval: Duration },
}

/// How wizard prompts are matched before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptCheck {
    /// Any non-idle output counts as the next prompt.
    Blind,
    /// The output must mention the prompt's keyword.
    Keyword,
}

/// Executable names inside the node image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonBinaries {
    pub chain: String,
    pub wallet: String,
    pub ctl: String,
}

impl Default for DaemonBinaries {
    fn default() -> Self {
        Self {
            chain: "bbld".into(),
            wallet: "btcwallet".into(),
            ctl: "btcctl".into(),
        }
    }
}

/// Knobs for one deploy run, built from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Node image. Only needed when containers get created.
    pub image: String,
    pub platform: Option<String>,
    /// Budget for each daemon to come up after start.
    pub settle_interval: Duration,
    /// Budget for all chain daemons to come back after the restart pass.
    pub restart_settle_interval: Duration,
    pub readiness: Readiness,
    /// Seconds the wallet stays unlocked.
    pub unlock_duration_secs: u64,
    /// Per-prompt timeout of the wallet wizard.
    pub wizard_step_timeout: Duration,
    /// Timeout of the read that drains output after the last answer.
    pub wizard_drain_timeout: Duration,
    pub prompt_check: PromptCheck,
    pub binaries: DaemonBinaries,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            image: String::new(),
            platform: Some(DEFAULT_PLATFORM.to_string()),
            settle_interval: Duration::from_secs(60),
            restart_settle_interval: Duration::from_secs(120),
            readiness: Readiness::Probe {
                interval: Duration::from_secs(2),
            },
            unlock_duration_secs: 1800,
            wizard_step_timeout: Duration::from_secs(60),
            wizard_drain_timeout: Duration::from_secs(10),
            prompt_check: PromptCheck::Blind,
            binaries: DaemonBinaries::default(),
        }
    }
}

impl DeployOptions {
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}
