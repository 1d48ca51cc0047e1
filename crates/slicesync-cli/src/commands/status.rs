//! Status command handler

use anyhow::{Context, Result};

use slicesync_core::{Config, Identity, LocalCache};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let session = Identity::with_config(config).current()?;
    let cache = LocalCache::open(config).context("Failed to open local cache")?;
    let cached = cache.slices(session.as_ref()).unwrap_or_default();
    let total = cache.keys().map(|keys| keys.len()).unwrap_or(0);
    let remote = config.active_remote_url();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "session": session.as_ref().map(|s| s.as_str()),
                    "sync_enabled": config.sync_enabled,
                    "remote_url": config.remote_url,
                    "debounce_ms": config.debounce_ms,
                    "cache": {
                        "path": config.cache_path(),
                        "session_entries": cached.len(),
                        "total_entries": total
                    }
                })
            );
        }
        OutputFormat::Quiet => match &session {
            Some(session) => println!("{}", session),
            None => println!("guest"),
        },
        OutputFormat::Human => {
            println!("slicesync Status");
            println!("================");
            println!();
            println!("Session:");
            match &session {
                Some(session) => println!("  Logged in as: {}", session),
                None => println!("  Guest (not logged in)"),
            }
            println!();
            println!("Sync:");
            match remote {
                Some(url) => {
                    println!("  Status:   enabled");
                    println!("  Server:   {}", url);
                    println!("  Debounce: {} ms", config.debounce_ms);
                }
                None => println!("  Status:   disabled"),
            }
            println!();
            println!("Cache:");
            println!("  Location: {}", config.cache_path().display());
            println!("  Entries:  {} ({} total)", cached.len(), total);
            if !cached.is_empty() {
                println!("  Slices:   {}", cached.join(", "));
            }
        }
    }

    Ok(())
}
