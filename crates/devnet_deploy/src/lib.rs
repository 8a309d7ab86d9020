//! Deploy pipeline for a private multi-node chain test network.
//!
//! [`Deployer`] owns the persisted state record and walks every node through
//! its lifecycle via a [`NodeController`]; the controller reports what it
//! changed as [`devnet_core::StateDelta`]s.

pub mod commands;
pub mod node;
pub mod options;
pub mod orchestrator;
pub mod readiness;
pub mod topology;
pub mod wizard;

pub use node::{NodeController, NodePhase};
pub use options::{DaemonBinaries, DeployOptions, PromptCheck, Readiness};
pub use orchestrator::{Deployer, DestroyReport};
pub use topology::Topology;
pub use wizard::{WizardDriver, WizardOutcome, WizardState};
