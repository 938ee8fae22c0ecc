//! Core library for the tunnelguard VPN session supervisor
//!
//! This crate owns the lifecycle of a single logical tunnel session: the
//! user's persisted connection intent, the check that every live tunnel was
//! started by us, drop recovery through a single-slot reconnect timer and a
//! periodic poll that tears down sessions we do not own.

pub mod error;
pub mod types;

pub mod config;
pub mod session;
pub mod store;
pub mod tunnel;

pub use session::SessionController;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging for production use.
/// In development, logs to stderr with appropriate formatting.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to use systemd journal logging if available
    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .init();
            return Ok(());
        }
    }

    // Fallback to stderr logging with pretty formatting
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}
