use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use devnet_core::logging;
use devnet_core::{DevnetError, NetworkConfig, StateStore};
use devnet_deploy::{DeployOptions, Deployer, PromptCheck, Readiness};
use devnet_runtime::DockerCli;

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "devnet", version, about = "Deploy a private multi-node chain test network")]
struct Cli {
    /// Network config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// State file, created if absent.
    #[arg(long, default_value = "storage.json")]
    storage: PathBuf,

    /// Node image. Required for deploy.
    #[arg(long)]
    image: Option<String>,

    #[arg(long, default_value = "linux/amd64")]
    platform: String,

    /// Seconds each daemon gets to come up.
    #[arg(long, default_value_t = 60)]
    settle_secs: u64,

    /// Seconds the chain daemons get after the restart pass.
    #[arg(long, default_value_t = 120)]
    restart_settle_secs: u64,

    #[arg(long, default_value_t = 2)]
    probe_interval_secs: u64,

    /// Sleep the full settle time instead of probing the daemons.
    #[arg(long)]
    fixed_settle: bool,

    /// Seconds the wallet stays unlocked.
    #[arg(long, default_value_t = 1800)]
    unlock_secs: u64,

    /// Seconds to wait for each wallet creation prompt.
    #[arg(long, default_value_t = 60)]
    wizard_timeout_secs: u64,

    /// Check that each wallet prompt is the expected one before answering.
    #[arg(long)]
    strict_wizard: bool,

    /// Path to the docker executable.
    #[arg(long)]
    docker: Option<String>,

    /// Also write daily-rolling logs into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Create the network and bring every node up, peered and mining
    Deploy,
    /// Remove every node container and the network
    Destroy,
    /// Turn mining off on every running node
    StopMining,
}

impl Cli {
    fn deploy_options(&self) -> DeployOptions {
        let readiness = if self.fixed_settle {
            Readiness::FixedSettle
        } else {
            Readiness::Probe {
                interval: Duration::from_secs(self.probe_interval_secs),
            }
        };
        DeployOptions {
            image: self.image.clone().unwrap_or_default(),
            platform: Some(self.platform.clone()).filter(|p| !p.is_empty()),
            settle_interval: Duration::from_secs(self.settle_secs),
            restart_settle_interval: Duration::from_secs(self.restart_settle_secs),
            readiness,
            unlock_duration_secs: self.unlock_secs,
            wizard_step_timeout: Duration::from_secs(self.wizard_timeout_secs),
            prompt_check: if self.strict_wizard {
                PromptCheck::Keyword
            } else {
                PromptCheck::Blind
            },
            ..DeployOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match logging::init_logging(cli.log_dir.as_deref(), logging::DEFAULT_FILTER) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<DevnetError>() {
                Some(err) => error!(category = ?err.category(), "{e:#}"),
                None => error!("{e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = NetworkConfig::load_from_path(&cli.config)?;
    if cli.command == Command::Deploy && cli.image.as_deref().is_none_or(str::is_empty) {
        bail!("--image is required for deploy");
    }

    let runtime = match &cli.docker {
        Some(path) => DockerCli::with_docker_path(path.as_str()),
        None => DockerCli::new(),
    };
    let options = cli.deploy_options();
    let mut deployer = Deployer::new(runtime, config, options, StateStore::new(&cli.storage))?;

    match cli.command {
        Command::Deploy => {
            deployer.deploy().await?;
            info!(storage = %cli.storage.display(), "network deployed");
        }
        Command::Destroy => {
            let report = deployer.destroy().await?;
            info!(
                removed = report.removed.len(),
                not_running = report.not_running.len(),
                network_removed = report.network_removed,
                "network destroyed"
            );
        }
        Command::StopMining => {
            deployer.stop_mining().await?;
            info!("mining stopped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_probe_readiness() {
        let cli = Cli::parse_from(["devnet", "--image", "bbld:latest", "deploy"]);
        assert_eq!(cli.command, Command::Deploy);
        let opts = cli.deploy_options();
        assert_eq!(opts.image, "bbld:latest");
        assert_eq!(opts.platform.as_deref(), Some("linux/amd64"));
        assert_eq!(
            opts.readiness,
            Readiness::Probe {
                interval: Duration::from_secs(2)
            }
        );
        assert_eq!(opts.prompt_check, PromptCheck::Blind);
        assert_eq!(cli.config, PathBuf::from("config.json"));
    }

    #[test]
    fn flags_map_onto_options() {
        let cli = Cli::parse_from([
            "devnet",
            "--fixed-settle",
            "--settle-secs",
            "5",
            "--strict-wizard",
            "--unlock-secs",
            "60",
            "stop-mining",
        ]);
        assert_eq!(cli.command, Command::StopMining);
        let opts = cli.deploy_options();
        assert_eq!(opts.readiness, Readiness::FixedSettle);
        assert_eq!(opts.settle_interval, Duration::from_secs(5));
        assert_eq!(opts.unlock_duration_secs, 60);
        assert_eq!(opts.prompt_check, PromptCheck::Keyword);
        assert!(opts.image.is_empty());
    }

    #[tokio::test]
    async fn missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let cli = Cli::parse_from(["devnet", "--config", missing.to_str().unwrap(), "destroy"]);
        let err = run(cli).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got: {err}");
    }
}
