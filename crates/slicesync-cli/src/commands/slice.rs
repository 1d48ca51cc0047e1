//! Slice command handlers
//!
//! Each command opens a session scope, binds a JSON-valued unit for one slice
//! and works through it exactly like an application would.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use slicesync_core::{Config, Phase, SessionScope, SliceKey, SyncUnit};

use super::open_scope;
use crate::output::Output;

/// Print a slice value, waiting up to `timeout` seconds for the remote
pub async fn get(config: &Config, slice: String, timeout: u64, output: &Output) -> Result<()> {
    let scope = open_scope(config)?;
    let unit = open_unit(&scope, slice)?;

    settle(&unit, Duration::from_secs(timeout), output).await;
    print(&unit, output);

    Ok(())
}

/// Replace a slice value and push it to the remote right away
pub async fn set(
    config: &Config,
    slice: String,
    value: String,
    timeout: u64,
    output: &Output,
) -> Result<()> {
    let value: Value = serde_json::from_str(&value).context("Value is not valid JSON")?;
    let scope = open_scope(config)?;
    let unit = open_unit(&scope, slice)?;

    // Writes before the first snapshot stay local, so wait for it first
    settle(&unit, Duration::from_secs(timeout), output).await;
    unit.write(value);

    if unit.session().is_none() {
        output.success(&format!("Saved {} locally (guest)", unit.slice_key()));
        return Ok(());
    }
    if unit.phase() != Phase::Synced {
        output.warn("Remote has not answered; the value is only saved locally");
        output.success(&format!("Saved {} locally", unit.slice_key()));
        return Ok(());
    }

    match unit.flush().await {
        Ok(()) => output.success(&format!("Saved {}", unit.slice_key())),
        Err(e) => {
            output.warn(&format!("Remote write failed: {}", e));
            output.success(&format!("Saved {} locally", unit.slice_key()));
        }
    }

    Ok(())
}

/// Print a slice value now and again after every change, until Ctrl-C
pub async fn watch(config: &Config, slice: String, output: &Output) -> Result<()> {
    let scope = open_scope(config)?;
    let unit = open_unit(&scope, slice)?;
    let mut changes = unit.changes();

    print(&unit, output);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print(&unit, output);
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted; stopping watch");
                break;
            }
        }
    }

    Ok(())
}

fn open_unit(scope: &SessionScope, slice: String) -> Result<SyncUnit<Value>> {
    let slice = SliceKey::new(slice).context("Invalid slice key")?;
    scope
        .unit(slice, Value::Null)
        .context("Failed to bind slice")
}

/// Wait for the first remote answer when logged in
async fn settle(unit: &SyncUnit<Value>, timeout: Duration, output: &Output) {
    if unit.session().is_none() {
        return;
    }
    if let Err(e) = unit.wait_until_synced(timeout).await {
        output.warn(&format!("{}; using the cached value", e));
    }
}

fn print(unit: &SyncUnit<Value>, output: &Output) {
    // Read the phase first; with_value holds the unit lock
    let phase = unit.phase();
    unit.with_value(|value| output.print_value(unit.slice_key().as_str(), phase.as_str(), value));
}
