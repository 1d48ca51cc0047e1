//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use slicesync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "sync_enabled": config.sync_enabled,
                    "debounce_ms": config.debounce_ms,
                    "cache_max_entry_bytes": config.cache_max_entry_bytes,
                    "server_addr": config.server_addr,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:              {}", config.data_dir.display());
            println!(
                "  remote_url:            {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:          {}", config.sync_enabled);
            println!("  debounce_ms:           {}", config.debounce_ms);
            println!(
                "  cache_max_entry_bytes: {}",
                config
                    .cache_max_entry_bytes
                    .map(|limit| limit.to_string())
                    .unwrap_or_else(|| "(unlimited)".to_string())
            );
            println!("  server_addr:           {}", config.server_addr);
            println!(
                "  log_file:              {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(stderr)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Apply one `key = value` assignment to `config`
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_url" => {
            config.remote_url = optional(value).map(str::to_string);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "debounce_ms" => {
            config.debounce_ms = value
                .parse()
                .context("Invalid value for debounce_ms. Use a number of milliseconds.")?;
        }
        "cache_max_entry_bytes" => {
            config.cache_max_entry_bytes = optional(value)
                .map(str::parse)
                .transpose()
                .context("Invalid value for cache_max_entry_bytes. Use a byte count or 'none'.")?;
        }
        "server_addr" => {
            config.server_addr = value.to_string();
        }
        "log_file" => {
            config.log_file = optional(value).map(Into::into);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, remote_url, sync_enabled, debounce_ms, \
                 cache_max_entry_bytes, server_addr, log_file",
                key
            );
        }
    }
    Ok(())
}

/// Empty and "none" clear an optional setting
fn optional(value: &str) -> Option<&str> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value)
    }
}
