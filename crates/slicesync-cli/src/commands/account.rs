//! Account command handlers

use std::io::{self, Write};

use anyhow::{bail, Result};

use slicesync_core::slices::known_slices;
use slicesync_core::Config;
use slicesync_core::Identity;

use super::open_scope;
use crate::output::{Output, OutputFormat};

/// Delete the logged-in account's remote documents and clear the local cache
///
/// Without `--yes` a human terminal is asked to confirm; other output modes
/// refuse to run.
pub async fn delete(config: &Config, yes: bool, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config);
    let Some(session) = identity.current()? else {
        bail!("Not logged in. Log in with `slicesync login <session>` first.");
    };

    if !yes {
        if !output.should_prompt() {
            bail!("Refusing to delete account '{}' without --yes", session);
        }
        if !confirm(&format!(
            "Delete every remote document of '{}' and clear the local cache? [y/N] ",
            session
        ))? {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    let scope = open_scope(config)?;
    let report = scope.delete_account(&known_slices()).await;
    identity.logout()?;

    match output.format {
        OutputFormat::Json => {
            let failed: Vec<_> = report
                .failed
                .iter()
                .map(|(slice, e)| {
                    serde_json::json!({"slice": slice.as_str(), "error": e.to_string()})
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "session": session.as_str(),
                    "deleted": report.deleted.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                    "failed": failed
                })
            );
        }
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            for (slice, e) in &report.failed {
                output.warn(&format!("Could not delete {}: {}", slice, e));
            }
            if report.is_complete() {
                output.success(&format!(
                    "Deleted {} documents of '{}' and cleared the local cache",
                    report.deleted.len(),
                    session
                ));
            } else {
                output.success(&format!(
                    "Cleared the local cache; {} of {} remote documents deleted",
                    report.deleted.len(),
                    report.deleted.len() + report.failed.len()
                ));
            }
        }
    }

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim(), "y" | "Y" | "yes"))
}
