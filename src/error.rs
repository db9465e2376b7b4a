//! Error types for metagroup-sync
//!
//! One enum covers every failure the engine can report. Store failures wrap the
//! roster crate's error so callers can tell them apart from configuration
//! problems.

use crate::model::{CourseId, GroupId, LinkId};
use thiserror::Error;

/// Result type alias for metagroup-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type for metagroup-sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A link references a course or group that no longer exists
    #[error("Configuration error on link {link}: {message}")]
    Configuration { link: LinkId, message: String },

    /// Parent course equals child course
    #[error("Course {0} cannot be linked to itself")]
    SelfLink(CourseId),

    /// An enabled link already covers this (child, parent, group) triple
    #[error("Link {existing} already syncs group {group} of course {parent} into course {child}")]
    DuplicateLink {
        existing: LinkId,
        child: CourseId,
        parent: CourseId,
        group: GroupId,
    },

    /// The roster store rejected a query or mutation
    #[error("Store error: {0}")]
    Store(#[from] roster::Error),

    /// The engine is globally disabled
    #[error("Metagroup sync is disabled")]
    Disabled,

    /// The caller may not perform this action
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or configuration file contents
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Store(roster::Error::Database(err))
    }
}

impl SyncError {
    /// True when the error comes from the store rather than from bad configuration
    pub fn is_store_failure(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }

    /// True for link configuration problems that skip a unit instead of failing it
    pub fn is_configuration(&self) -> bool {
        matches!(self, SyncError::Configuration { .. })
    }

    /// Short label used for metrics and reports
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration { .. } => "configuration",
            SyncError::SelfLink(_) => "self_link",
            SyncError::DuplicateLink { .. } => "duplicate_link",
            SyncError::Store(_) => "store",
            SyncError::Disabled => "disabled",
            SyncError::PermissionDenied(_) => "permission_denied",
            SyncError::NotFound(_) => "not_found",
            SyncError::Config(_) => "config",
            SyncError::Io(_) => "io",
            SyncError::Yaml(_) => "yaml",
            SyncError::Json(_) => "json",
            SyncError::Other(_) | SyncError::Anyhow(_) => "other",
        }
    }
}
