//! Configuration validation
//!
//! Checks a loaded configuration for values the engine cannot work with:
//! - Empty database path
//! - Zero poll interval or channel capacity
//! - Non-positive role ids in the skip list

use super::sync_config::SyncConfig;
use crate::SyncError;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a metagroup-sync configuration
pub fn validate_config(config: &SyncConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.database.as_os_str().is_empty() {
        errors.push(ValidationError::new("database", "Database path cannot be empty"));
    }

    if config.daemon.poll_interval_secs == 0 {
        errors.push(ValidationError::new(
            "daemon.poll_interval_secs",
            "Poll interval must be greater than 0",
        ));
    }

    if config.daemon.event_channel_capacity == 0 {
        errors.push(ValidationError::new(
            "daemon.event_channel_capacity",
            "Event channel capacity must be greater than 0",
        ));
    }

    for role in &config.policy.skip_roles {
        if role.get() <= 0 {
            errors.push(ValidationError::new(
                "policy.skip_roles",
                format!("Invalid role id {}", role),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and fold every problem into one error
pub fn validate_config_result(config: &SyncConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        SyncError::Config(messages.join("; "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoleId;

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&SyncConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = SyncConfig::default();
        config.daemon.poll_interval_secs = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "daemon.poll_interval_secs");
    }

    #[test]
    fn test_bad_role_ids_collected() {
        let mut config = SyncConfig::default();
        config.policy = config
            .policy
            .with_skip_roles([RoleId::new(0), RoleId::new(-2), RoleId::new(3)]);
        config.database = Default::default();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);

        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("database"));
    }
}
