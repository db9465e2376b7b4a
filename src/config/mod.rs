//! Configuration system
//!
//! Loads ~/.config/metagroup-sync/config.yaml with:
//! - Roster database location
//! - Sync policy (global switch, sync_all, skip list, unenrol action)
//! - Daemon settings

mod sync_config;
pub mod validation;

pub use sync_config::{DaemonSettings, SyncConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
