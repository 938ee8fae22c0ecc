//! Configuration module
//!
//! Handles loading and saving controller configuration from TOML files.

use crate::error::ConfigError;
use crate::types::IdentityParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod toml_config;

/// Delay between a drop and the automatic reconnect attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Interval of the unauthorized-connection poll
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Timer policy of the session controller
///
/// The values are policy constants. They can only be overridden
/// programmatically, never from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub reconnect_delay: Duration,
    pub monitor_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            monitor_interval: MONITOR_INTERVAL,
        }
    }
}

/// Controller configuration structure
///
/// Identifies which tunnel profile the controller binds to and where its
/// durable state lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Identifier of the tunnel provider (profile match key)
    pub provider_id: String,

    /// Human readable description shown for the profile
    pub description: String,

    /// Scope of the persisted connection intent
    pub group_id: String,

    /// Reconnect automatically after an unexpected drop
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl ControllerConfig {
    /// Create a new controller configuration
    pub fn new(provider_id: String, description: String, group_id: String) -> Self {
        Self {
            provider_id,
            description,
            group_id,
            auto_reconnect: false,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("provider_id", &self.provider_id),
            ("description", &self.description),
            ("group_id", &self.group_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        // The group id names a file in the state directory
        if !self
            .group_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Err(ConfigError::ValidationError {
                message: format!("group_id contains invalid characters: {}", self.group_id),
            });
        }

        Ok(())
    }

    /// Identity parameters for `SessionController::initialize`
    pub fn identity(&self) -> IdentityParams {
        IdentityParams::new(
            self.provider_id.clone(),
            self.description.clone(),
            self.group_id.clone(),
        )
    }
}

/// Settings for the local OpenVPN process backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnSettings {
    /// Path of the openvpn binary (looked up on PATH when absent)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Tunnel configuration document passed on connect
    pub config_path: PathBuf,

    /// Username for `auth-user-pass` (password comes from the environment)
    #[serde(default)]
    pub username: Option<String>,
}

impl OpenVpnSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "config_path".to_string(),
            });
        }
        if let Some(username) = &self.username {
            if username.trim().is_empty() {
                return Err(ConfigError::ValidationError {
                    message: "username cannot be empty when set".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig::new(
            "net.openvpn.client".to_string(),
            "Office VPN".to_string(),
            "group.office".to_string(),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
        assert!(!config().auto_reconnect);
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let mut missing = config();
        missing.provider_id = String::new();
        assert!(matches!(
            missing.validate(),
            Err(ConfigError::MissingField { field }) if field == "provider_id"
        ));
    }

    #[test]
    fn test_group_id_must_be_a_file_name() {
        let mut bad = config();
        bad.group_id = "../escape".to_string();
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_default_timing_uses_policy_constants() {
        let timing = Timing::default();
        assert_eq!(timing.reconnect_delay, Duration::from_secs(2));
        assert_eq!(timing.monitor_interval, Duration::from_secs(2));
    }
}
