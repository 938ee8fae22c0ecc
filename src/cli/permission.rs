//! Tunnel profile provisioning commands

use super::Environment;
use colored::Colorize;
use tunnelguard_core::error::TunnelGuardError;
use tunnelguard_core::SessionController;

fn controller(simulate: bool) -> Result<(Environment, SessionController), TunnelGuardError> {
    let env = Environment::load()?;
    let provider = env.provider(simulate)?;
    let controller = SessionController::new(provider, env.store.clone());
    Ok((env, controller))
}

/// Report whether the tunnel profile exists
pub async fn run_permission_check(simulate: bool) -> Result<(), TunnelGuardError> {
    let (env, controller) = controller(simulate)?;
    let provider_id = &env.config.controller.provider_id;

    if controller.check_permission(provider_id).await? {
        println!("{} Tunnel profile for {} is provisioned", "✓".green(), provider_id);
    } else {
        println!(
            "{} No tunnel profile for {}; run `tunnelguard permission request`",
            "✗".red(),
            provider_id
        );
    }
    Ok(())
}

/// Create the tunnel profile if it is missing
pub async fn run_permission_request(simulate: bool) -> Result<(), TunnelGuardError> {
    let (env, controller) = controller(simulate)?;
    let settings = &env.config.controller;

    controller
        .request_permission(&settings.provider_id, &settings.description)
        .await?;
    println!(
        "{} Tunnel profile for {} is provisioned",
        "✓".green(),
        settings.provider_id
    );
    Ok(())
}
