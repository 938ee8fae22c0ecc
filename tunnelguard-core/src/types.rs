//! Type definitions shared across the session supervisor
//!
//! Credentials are wrapped with the secrecy crate so they never show up in
//! logs or debug output while they are passed through to the tunnel driver.

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

/// Wrapper for the tunnel password handed to the provisioning backend
///
/// The controller never inspects the password, it only keeps it around so an
/// automatic reconnect can replay the last explicit connect.
#[derive(Clone, Debug)]
pub struct TunnelPassword(Secret<String>);

impl TunnelPassword {
    /// Create a new TunnelPassword from a raw string
    pub fn new(password: String) -> Self {
        Self(Secret::new(password))
    }

    /// Expose the password value (use with caution!)
    ///
    /// This should only be called when handing the credential to the
    /// tunnel driver.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for TunnelPassword {
    fn from(password: String) -> Self {
        Self::new(password)
    }
}

impl From<&str> for TunnelPassword {
    fn from(password: &str) -> Self {
        Self::new(password.to_string())
    }
}

/// Username and password pair used as tunnel start options
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: TunnelPassword,
}

/// Last-known tunnel configuration, kept in memory for automatic reconnect
///
/// The config blob is opaque to the controller. It is never persisted by the
/// controller itself and is released on `dispose`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Opaque tunnel configuration (e.g. an .ovpn document)
    pub config: String,
    pub username: Option<String>,
    pub password: Option<TunnelPassword>,
}

impl SessionConfig {
    /// Create a session config without credentials
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            username: None,
            password: None,
        }
    }

    /// Attach a username/password pair
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<TunnelPassword>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Start options are only sent when both halves are present
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Identifying parameters supplied on `initialize`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityParams {
    /// Identifier of the tunnel provider the profile must be bound to
    pub provider_id: String,
    /// Human readable profile description
    pub description: String,
    /// Scope of the durable key-value store
    pub group_id: String,
}

impl IdentityParams {
    pub fn new(
        provider_id: impl Into<String>,
        description: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            description: description.into(),
            group_id: group_id.into(),
        }
    }

    /// Reject empty identifiers
    pub fn validate(&self) -> Result<(), crate::error::SessionError> {
        for (field, value) in [
            ("provider_id", &self.provider_id),
            ("description", &self.description),
            ("group_id", &self.group_id),
        ] {
            if value.trim().is_empty() {
                return Err(crate::error::SessionError::MissingParameter {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The user's connection intent, persisted across process restarts
///
/// Both fields are always written together.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionIntent {
    /// The last explicit user action was "connect"
    pub should_be_connected: bool,
    /// The live (or most recently started) tunnel was started by this controller
    pub app_initiated: bool,
}

impl ConnectionIntent {
    /// Intent after an explicit connect
    pub const CONNECT: Self = Self {
        should_be_connected: true,
        app_initiated: true,
    };

    /// Intent after disconnect, dispose or a forced disconnect
    pub const IDLE: Self = Self {
        should_be_connected: false,
        app_initiated: false,
    };
}
