// Shared data model: config file, persisted state record, error taxonomy, logging.

pub mod config;
pub mod error;
pub mod logging;
pub mod state;

pub use config::{NetworkConfig, NetworkSection, NodeConfig, DEFAULT_ACCOUNT};
pub use error::{DevnetError, ErrorCategory};
pub use state::{AccountState, PersistedNodeState, PersistedState, StateDelta, StateStore, WalletState};
