//! Error types for the tunnelguard session supervisor
//!
//! This module defines all error types used throughout the application,
//! providing consistent error handling and user-friendly error messages.

use thiserror::Error;

/// Main error type for the tunnelguard application
#[derive(Error, Debug)]
pub enum TunnelGuardError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by the session controller
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Errors from the tunnel provisioning backend
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// Errors from the persisted intent store
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors surfaced by [`crate::session::SessionController`] operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session controller is not initialized")]
    NotInitialized,

    #[error("Missing required parameter: {field}")]
    MissingParameter { field: String },

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("No tunnel profile available for provider {provider_id}")]
    NoProfileAvailable { provider_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session controller has shut down")]
    ControllerGone,
}

/// Failures reported by a [`crate::tunnel::TunnelProvider`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Failed to load tunnel profiles: {reason}")]
    LoadFailed { reason: String },

    #[error("Failed to save tunnel profile: {reason}")]
    SaveFailed { reason: String },

    #[error("Failed to start tunnel: {reason}")]
    StartFailed { reason: String },

    #[error("Failed to stop tunnel: {reason}")]
    StopFailed { reason: String },

    #[error("Tunnel profile {profile} no longer exists")]
    ProfileMissing { profile: String },

    #[error("Tunnel process error: {reason}")]
    Process { reason: String },
}

/// Durable key-value store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to read state for group {group}: {reason}")]
    Read { group: String, reason: String },

    #[error("Failed to write state for group {group}: {reason}")]
    Write { group: String, reason: String },

    #[error("State for group {group} is corrupt: {reason}")]
    Corrupt { group: String, reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TunnelGuardError>;
