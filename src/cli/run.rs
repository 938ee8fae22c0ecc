//! Foreground session supervision
//!
//! Binds the controller, connects with the configured tunnel and prints stage
//! notifications until Ctrl-C or until the session ends on its own (session
//! limit, forced disconnect), then disconnects and disposes.

use super::{format_stage, Environment, PASSWORD_ENV};
use colored::Colorize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnelguard_core::config::toml_config::TomlConfig;
use tunnelguard_core::error::{ConfigError, TunnelGuardError};
use tunnelguard_core::tunnel::Stage;
use tunnelguard_core::types::SessionConfig;
use tunnelguard_core::SessionController;

/// How long to wait for the tunnel to report it is down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Config blob used by `--simulate` when no OpenVPN settings exist
const SIMULATED_CONFIG: &str = "client\ndev tun\nremote simulated.invalid 1194";

/// Run the supervised session
pub async fn run_session(
    simulate: bool,
    auto_reconnect: Option<bool>,
    limit: Option<Duration>,
) -> Result<(), TunnelGuardError> {
    let env = Environment::load()?;
    let provider = env.provider(simulate)?;
    let controller = SessionController::new(provider, env.store.clone());
    let mut stages = controller.subscribe_stages();

    let auto_reconnect = auto_reconnect.unwrap_or(env.config.controller.auto_reconnect);
    let identity = env.config.controller.identity();
    println!(
        "Supervising {} ({}){}",
        identity.description.bold(),
        identity.provider_id,
        if simulate { " [simulated]" } else { "" }
    );

    let stage = controller.initialize(identity, auto_reconnect).await?;
    println!("{}", format_stage(stage));

    let session = session_config(&env.config, simulate)?;
    controller.connect(session).await?;
    info!(auto_reconnect, "Tunnel start accepted");

    if let Some(limit) = limit {
        controller.start_session_timer(Some(limit)).await?;
        println!("Session limited to {}s", limit.as_secs());
    }

    loop {
        tokio::select! {
            stage = stages.recv() => match stage {
                Some(stage) => {
                    println!("{}", format_stage(stage));
                    if matches!(stage, Stage::Disconnected | Stage::Invalid)
                        && session_over(&controller).await
                    {
                        println!("{}", "Session ended".yellow());
                        break;
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                println!("{}", "Disconnecting...".yellow());
                print_traffic(&controller).await;
                controller.disconnect().await;
                wait_until_down(&mut stages).await;
                break;
            }
        }
    }

    controller.dispose().await;
    println!("{}", "Session closed".green());
    Ok(())
}

/// No intent to be connected and no reconnect on the way
async fn session_over(controller: &SessionController) -> bool {
    match controller.snapshot().await {
        Ok(snapshot) => !snapshot.intent.should_be_connected && !snapshot.reconnect_pending,
        Err(_) => true,
    }
}

/// Tunnel config and credentials for `connect`
fn session_config(config: &TomlConfig, simulate: bool) -> Result<SessionConfig, TunnelGuardError> {
    let Some(openvpn) = &config.openvpn else {
        if simulate {
            return Ok(SessionConfig::new(SIMULATED_CONFIG));
        }
        return Err(ConfigError::MissingField {
            field: "openvpn".to_string(),
        }
        .into());
    };

    let blob = std::fs::read_to_string(&openvpn.config_path).map_err(|e| ConfigError::IoError {
        message: format!(
            "Failed to read tunnel configuration {}: {}",
            openvpn.config_path.display(),
            e
        ),
    })?;
    let mut session = SessionConfig::new(blob);

    if let Some(username) = &openvpn.username {
        match std::env::var(PASSWORD_ENV) {
            Ok(password) => session = session.with_credentials(username.clone(), password),
            Err(_) => warn!(
                "{} is not set, starting without credentials",
                PASSWORD_ENV
            ),
        }
    }
    Ok(session)
}

async fn print_traffic(controller: &SessionController) {
    match controller.connection_status().await {
        Ok(Some(report)) => println!("Last traffic report: {}", report),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not read traffic report"),
    }
}

/// Print stages until the tunnel reports it is down or the grace period ends
async fn wait_until_down(stages: &mut mpsc::UnboundedReceiver<Stage>) {
    let settled = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(stage) = stages.recv().await {
            println!("{}", format_stage(stage));
            if matches!(stage, Stage::Disconnected | Stage::Invalid) {
                break;
            }
        }
    })
    .await;

    if settled.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Tunnel did not report disconnected in time"
        );
    }
}
