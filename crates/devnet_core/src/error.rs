use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a deploy, destroy or runtime call can surface.
#[derive(Error, Debug)]
pub enum DevnetError {
    #[error("No live container tracked for node {0}")]
    NotFound(String),

    #[error("Container name {0} is already in use")]
    AlreadyExists(String),

    #[error("Account {account} does not exist on node {node}")]
    AccountNotFound { node: String, account: String },

    #[error("Command `{command}` failed: {source:#}")]
    CommandExecution {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Network {0} does not exist")]
    NetworkNotFound(String),

    #[error("{target} not ready after {waited:?}")]
    NotReady { target: String, waited: Duration },

    #[error("Wallet wizard timed out in state {state} after {after:?}")]
    WizardTimeout { state: &'static str, after: Duration },

    #[error("Wallet wizard desynchronized in state {state}: {reason}")]
    WizardDesync { state: &'static str, reason: String },

    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Teardown incomplete, network {network} is still recorded: {source}")]
    PartialTeardown {
        network: String,
        #[source]
        source: Box<DevnetError>,
    },
}

/// Broad classification used for log routing and exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// A container, network or account the caller referenced is missing.
    Missing,
    /// Something already exists that should not.
    Conflict,
    /// A command or probe inside a container failed or never became ready.
    Runtime,
    /// The wallet creation wizard misbehaved.
    Wizard,
    /// Bad input: config file or topology.
    Input,
    /// The state record could not be read or written.
    Storage,
    /// Teardown stopped halfway.
    Teardown,
}

impl DevnetError {
    /// Wrap a transport error raised while running `command`.
    pub fn command(command: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            source: source.into(),
        }
    }

    /// Returns the broad error category for routing and display purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) | Self::AccountNotFound { .. } | Self::NetworkNotFound(_) => {
                ErrorCategory::Missing
            }
            Self::AlreadyExists(_) => ErrorCategory::Conflict,
            Self::CommandExecution { .. } | Self::NotReady { .. } => ErrorCategory::Runtime,
            Self::WizardTimeout { .. } | Self::WizardDesync { .. } => ErrorCategory::Wizard,
            Self::Topology(_) | Self::Config(_) => ErrorCategory::Input,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::PartialTeardown { .. } => ErrorCategory::Teardown,
        }
    }
}
