//! Persisted intent inspection

use super::Environment;
use colored::Colorize;
use serde::Serialize;
use tunnelguard_core::error::TunnelGuardError;
use tunnelguard_core::store::PersistedIntentStore;

#[derive(Serialize)]
struct StateReport<'a> {
    group: &'a str,
    should_be_connected: bool,
    app_initiated: bool,
    connection_update: Option<serde_json::Value>,
}

/// Show the persisted connection intent
pub fn run_state_show(json: bool) -> Result<(), TunnelGuardError> {
    let env = Environment::load()?;
    let store = intent_store(&env);
    let intent = store.load()?;
    let update = store.connection_update()?;

    if json {
        let report = StateReport {
            group: store.group(),
            should_be_connected: intent.should_be_connected,
            app_initiated: intent.app_initiated,
            // Reports are JSON documents; keep anything else as a string
            connection_update: update.map(|raw| {
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Group: {}", store.group().bold());
    println!("State: {}", env.state_dir().display());
    println!("  Should be connected: {}", yes_no(intent.should_be_connected));
    println!("  App initiated:       {}", yes_no(intent.app_initiated));
    match update {
        Some(report) => println!("  Last traffic report: {}", report),
        None => println!("  Last traffic report: {}", "none".dimmed()),
    }
    Ok(())
}

/// Clear the persisted connection intent
pub fn run_state_reset() -> Result<(), TunnelGuardError> {
    let env = Environment::load()?;
    let store = intent_store(&env);
    store.clear()?;
    println!("{} intent for {} cleared", "✓".green(), store.group());
    Ok(())
}

fn intent_store(env: &Environment) -> PersistedIntentStore {
    PersistedIntentStore::new(env.store.clone(), env.config.controller.group_id.clone())
}

fn yes_no(value: bool) -> colored::ColoredString {
    if value {
        "yes".green()
    } else {
        "no".normal()
    }
}
