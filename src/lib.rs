//! metagroup-sync - course metagroup enrolment synchronization
//!
//! Keeps a child course's memberships, attributed role grants and group
//! memberships consistent with the members of a group in a parent course.
//! Every change is idempotent and attributed to the link that caused it, so
//! the engine can later revoke exactly what it granted.
//!
//! # Architecture
//!
//! - **model**: Identifiers, memberships, validity windows, links
//! - **policy**: Per-installation sync policy (`sync_all`, skip list, unenrol action)
//! - **store**: Store traits and their SQLite implementation over the `roster` crate
//! - **sync**: Aggregator, reconciler, event reactor and bulk sweep
//! - **registry**: Link administration (create, enable, delete, group naming)
//! - **daemon**: Background loop running sweeps and reactions
//! - **config**: YAML configuration and validation

pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod registry;
pub mod store;
pub mod sync;

// Re-exports
pub use error::{Result, SyncError};
pub use policy::{SyncPolicy, UnenrolAction};
pub use registry::LinkRegistry;
pub use sync::{BulkSweep, EventReactor, Reconciler, SweepReport, SweepStatus, SyncContext};
