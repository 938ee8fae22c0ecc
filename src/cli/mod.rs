//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands and the
//! wiring they share: configuration, state store and tunnel provider.

pub mod permission;
pub mod run;
pub mod state;

use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tunnelguard_core::config::toml_config::{get_state_dir, load_config, TomlConfig};
use tunnelguard_core::error::{ConfigError, TunnelGuardError};
use tunnelguard_core::store::{KeyValueStore, TomlFileStore};
use tunnelguard_core::tunnel::{OpenVpnProvider, SimulatedProvider, Stage, TunnelProvider};

/// Environment variable holding the tunnel password
pub const PASSWORD_ENV: &str = "TUNNELGUARD_PASSWORD";

/// Validated configuration plus the durable store it points at
pub struct Environment {
    pub config: TomlConfig,
    pub store: Arc<dyn KeyValueStore>,
    state_dir: std::path::PathBuf,
}

impl Environment {
    pub fn load() -> Result<Self, TunnelGuardError> {
        let config = load_config()?;
        config.validate()?;

        let state_dir = get_state_dir()?;
        let store = TomlFileStore::open(&state_dir)?;

        Ok(Self {
            config,
            store: Arc::new(store),
            state_dir,
        })
    }

    /// OpenVPN backend, or the simulated one with `--simulate`
    pub fn provider(&self, simulate: bool) -> Result<Arc<dyn TunnelProvider>, TunnelGuardError> {
        if simulate {
            return Ok(Arc::new(SimulatedProvider::autonomous()));
        }

        let openvpn = self.config.openvpn.as_ref().ok_or(ConfigError::MissingField {
            field: "openvpn".to_string(),
        })?;
        let provider = OpenVpnProvider::new(
            openvpn.binary.clone(),
            self.state_dir.clone(),
            Arc::clone(&self.store),
        )?;
        Ok(Arc::new(provider))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

/// One stage notification as a timestamped, colored line
pub fn format_stage(stage: Stage) -> String {
    let label = match stage {
        Stage::Connected => stage.as_str().green().bold(),
        Stage::Connecting | Stage::Reasserting => stage.as_str().yellow(),
        Stage::Disconnecting | Stage::Disconnected => stage.as_str().normal(),
        Stage::Invalid => stage.as_str().red(),
    };
    format!(
        "[{}] {}",
        chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
        label
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stage_names_stage() {
        colored::control::set_override(false);
        let line = format_stage(Stage::Reasserting);
        assert!(line.ends_with("] reasserting"));
        assert!(line.starts_with('['));
    }
}
