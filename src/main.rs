//! tunnelguard - VPN session supervisor
//!
//! Owns a single tunnel session: remembers whether the user wants to be
//! connected, reconnects after drops and tears down tunnels it did not start.

use clap::{Parser, Subcommand};
use std::time::Duration;
use tunnelguard_core::error::{SessionError, TunnelGuardError};
use tunnelguard_core::init_logging;

mod cli;

#[derive(Parser)]
#[command(name = "tunnelguard")]
#[command(about = "Supervise a single VPN tunnel session and refuse sessions it did not start")]
struct Cli {
    /// Use the in-process simulated tunnel instead of OpenVPN
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and supervise the tunnel until Ctrl-C
    Run {
        /// Override the configured auto-reconnect setting
        #[arg(long)]
        auto_reconnect: Option<bool>,

        /// Disconnect once the session has lasted this many seconds
        #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
        max_duration: Option<u64>,
    },
    /// Inspect or reset the persisted connection intent
    State {
        #[command(subcommand)]
        action: StateCommands,
    },
    /// Check or request the tunnel profile
    Permission {
        #[command(subcommand)]
        action: PermissionCommands,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Show the persisted intent
    Show {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear the persisted intent
    Reset,
}

#[derive(Subcommand)]
enum PermissionCommands {
    /// Report whether the tunnel profile exists
    Check,
    /// Create the tunnel profile if it is missing
    Request,
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run {
                auto_reconnect,
                max_duration,
            } => {
                let limit = max_duration.map(Duration::from_secs);
                cli::run::run_session(cli.simulate, auto_reconnect, limit).await
            }
            Commands::State { action } => match action {
                StateCommands::Show { json } => cli::state::run_state_show(json),
                StateCommands::Reset => cli::state::run_state_reset(),
            },
            Commands::Permission { action } => match action {
                PermissionCommands::Check => {
                    cli::permission::run_permission_check(cli.simulate).await
                }
                PermissionCommands::Request => {
                    cli::permission::run_permission_request(cli.simulate).await
                }
            },
        }
    });

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

/// Configuration and missing parameters exit with 2, runtime failures with 1
fn exit_code(error: &TunnelGuardError) -> i32 {
    match error {
        // Configuration errors (exit code 2)
        TunnelGuardError::Config(_)
        | TunnelGuardError::Toml(_)
        | TunnelGuardError::TomlSerialize(_) => 2,
        TunnelGuardError::Session(session) => match session {
            SessionError::MissingParameter { .. } | SessionError::NotInitialized => 2,
            SessionError::Provisioning(_)
            | SessionError::NoProfileAvailable { .. }
            | SessionError::Store(_)
            | SessionError::ControllerGone => 1,
        },
        // Runtime errors (exit code 1)
        TunnelGuardError::Provisioning(_)
        | TunnelGuardError::Store(_)
        | TunnelGuardError::Io(_)
        | TunnelGuardError::Json(_) => 1,
    }
}
