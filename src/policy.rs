//! Engine-wide sync policy
//!
//! Read once per sweep or reaction. The policy is part of the YAML config file
//! (see [`crate::config::SyncConfig`]) but can be built directly in code.

use crate::model::RoleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What happens to a child membership once its parent source disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnenrolAction {
    /// Delete the membership, its roles and its group membership
    Remove,
    /// Suspend the membership and keep every attributed role
    Suspend,
    /// Suspend the membership and revoke its attributed roles
    #[default]
    SuspendNoRoles,
}

impl UnenrolAction {
    /// Roles are never revoked under this action
    pub fn preserves_roles(self) -> bool {
        self == UnenrolAction::Suspend
    }
}

impl fmt::Display for UnenrolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnenrolAction::Remove => write!(f, "remove"),
            UnenrolAction::Suspend => write!(f, "suspend"),
            UnenrolAction::SuspendNoRoles => write!(f, "suspend_no_roles"),
        }
    }
}

impl std::str::FromStr for UnenrolAction {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "remove" | "unenrol" => Ok(UnenrolAction::Remove),
            "suspend" => Ok(UnenrolAction::Suspend),
            "suspend_no_roles" | "suspend-no-roles" => Ok(UnenrolAction::SuspendNoRoles),
            other => Err(crate::SyncError::Config(format!(
                "Unknown unenrol action '{}'. Must be one of: remove, suspend, suspend_no_roles",
                other
            ))),
        }
    }
}

/// Sync policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Global switch; when off a sweep only revokes attributed roles
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sync users that hold no propagated role in the parent course
    #[serde(default = "default_true")]
    pub sync_all: bool,

    /// Parent roles that are never propagated
    #[serde(default)]
    pub skip_roles: BTreeSet<RoleId>,

    #[serde(default)]
    pub unenrol_action: UnenrolAction,
}

fn default_true() -> bool {
    true
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_all: true,
            skip_roles: BTreeSet::new(),
            unenrol_action: UnenrolAction::default(),
        }
    }
}

impl SyncPolicy {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_sync_all(mut self, sync_all: bool) -> Self {
        self.sync_all = sync_all;
        self
    }

    pub fn with_skip_roles(mut self, roles: impl IntoIterator<Item = RoleId>) -> Self {
        self.skip_roles = roles.into_iter().collect();
        self
    }

    pub fn with_unenrol_action(mut self, action: UnenrolAction) -> Self {
        self.unenrol_action = action;
        self
    }

    pub fn is_skipped(&self, role: RoleId) -> bool {
        self.skip_roles.contains(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = SyncPolicy::default();
        assert!(policy.enabled);
        assert!(policy.sync_all);
        assert!(policy.skip_roles.is_empty());
        assert_eq!(policy.unenrol_action, UnenrolAction::SuspendNoRoles);
    }

    #[test]
    fn test_yaml_defaults_fill_missing_fields() {
        let policy: SyncPolicy = serde_yaml::from_str("skip_roles: [3, 4]\n").unwrap();
        assert!(policy.enabled);
        assert!(policy.is_skipped(RoleId::new(3)));
        assert!(!policy.is_skipped(RoleId::new(5)));
        assert_eq!(policy.unenrol_action, UnenrolAction::SuspendNoRoles);
    }

    #[test]
    fn test_unenrol_action_parse() {
        assert_eq!("remove".parse::<UnenrolAction>().unwrap(), UnenrolAction::Remove);
        assert_eq!(
            "suspend-no-roles".parse::<UnenrolAction>().unwrap(),
            UnenrolAction::SuspendNoRoles
        );
        assert!("purge".parse::<UnenrolAction>().is_err());
        assert!(UnenrolAction::Suspend.preserves_roles());
        assert!(!UnenrolAction::Remove.preserves_roles());
    }
}
