//! TOML configuration file I/O
//!
//! Handles loading and saving controller configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::{ControllerConfig, OpenVpnSettings};
use crate::error::{ConfigError, TunnelGuardError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete TOML configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Controller identity and reconnect flag
    pub controller: ControllerConfig,

    /// OpenVPN backend settings (optional)
    #[serde(default)]
    pub openvpn: Option<OpenVpnSettings>,
}

impl TomlConfig {
    /// Create a new TOML configuration
    pub fn new(controller: ControllerConfig, openvpn: Option<OpenVpnSettings>) -> Self {
        Self {
            controller,
            openvpn,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, TunnelGuardError> {
        use tracing::debug;

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TunnelGuardError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => TunnelGuardError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            TunnelGuardError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate()?;

        debug!(
            provider_id = %config.controller.provider_id,
            group_id = %config.controller.group_id,
            auto_reconnect = config.controller.auto_reconnect,
            "Loaded controller configuration"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), TunnelGuardError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TunnelGuardError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_| {
            TunnelGuardError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate every section that is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        if let Some(openvpn) = &self.openvpn {
            openvpn.validate()?;
        }
        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Subdirectory holding persisted intent and tunnel profiles
const STATE_DIR_NAME: &str = "state";

/// Get the default configuration directory
///
/// Returns ~/.config/tunnelguard, or TUNNELGUARD_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, TunnelGuardError> {
    // Allow tests to override config directory via environment variable
    if let Ok(config_dir) = std::env::var("TUNNELGUARD_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        TunnelGuardError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("tunnelguard"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, TunnelGuardError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Directory for the durable key-value store and profile records
pub fn get_state_dir() -> Result<PathBuf, TunnelGuardError> {
    Ok(get_config_dir()?.join(STATE_DIR_NAME))
}

/// Load configuration from the default TOML file
pub fn load_config() -> Result<TomlConfig, TunnelGuardError> {
    let config_path = get_config_path()?;
    TomlConfig::from_file(&config_path)
}

/// Save configuration to the default TOML file
pub fn save_config(config: &TomlConfig) -> Result<(), TunnelGuardError> {
    let config_path = get_config_path()?;
    config.to_file(&config_path)
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, TunnelGuardError> {
    Ok(get_config_path()?.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> TomlConfig {
        let mut controller = ControllerConfig::new(
            "net.openvpn.client".to_string(),
            "Office VPN".to_string(),
            "group.office".to_string(),
        );
        controller.auto_reconnect = true;
        TomlConfig::new(
            controller,
            Some(OpenVpnSettings {
                binary: None,
                config_path: PathBuf::from("/etc/openvpn/office.ovpn"),
                username: Some("alice".to_string()),
            }),
        )
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let original = sample();
        original.to_file(&config_path).unwrap();

        let loaded = TomlConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded.controller, original.controller);
        assert_eq!(loaded.openvpn, original.openvpn);
    }

    #[test]
    fn test_missing_file_is_load_failed() {
        let temp_dir = tempdir().unwrap();
        let result = TomlConfig::from_file(&temp_dir.path().join("absent.toml"));
        assert!(matches!(
            result,
            Err(TunnelGuardError::Config(ConfigError::LoadFailed { .. }))
        ));
    }

    #[test]
    fn test_auto_reconnect_defaults_to_false() {
        let parsed: TomlConfig = toml::from_str(
            r#"
            [controller]
            provider_id = "net.openvpn.client"
            description = "Office VPN"
            group_id = "group.office"
            "#,
        )
        .unwrap();
        assert!(!parsed.controller.auto_reconnect);
        assert!(parsed.openvpn.is_none());
    }

    #[test]
    fn test_invalid_config_is_not_saved() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = sample();
        config.controller.group_id = String::new();

        assert!(config.to_file(&config_path).is_err());
        assert!(!config_path.exists());
    }
}
