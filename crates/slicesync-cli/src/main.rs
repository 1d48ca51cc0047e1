//! slicesync CLI
//!
//! Command-line interface for slicesync - inspect and edit synced slices,
//! manage the logged-in session and run the document server.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use slicesync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "slicesync")]
#[command(about = "slicesync - per-slice state mirrored to a remote document store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use an alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Log in as a session
    Login {
        /// Session id
        session: String,
    },
    /// Return to guest mode
    Logout,
    /// Show the logged-in session
    Whoami,
    /// Show status (session, sync, cache)
    Status,
    /// Inspect the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Print a slice value
    Get {
        /// Slice key
        slice: String,
        /// Seconds to wait for the remote snapshot
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Replace a slice value
    Set {
        /// Slice key
        slice: String,
        /// New value as JSON
        value: String,
        /// Seconds to wait for the remote snapshot
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Print a slice value whenever it changes
    Watch {
        /// Slice key
        slice: String,
    },
    /// Run the document server
    Serve {
        /// Listen address (defaults to server_addr from config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Delete every remote document of the logged-in account and clear the cache
    DeleteAccount {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, sync_enabled, debounce_ms,
        /// cache_max_entry_bytes, server_addr, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached slices for the current session
    #[command(alias = "ls")]
    List {
        /// List every raw key, across all sessions
        #[arg(long)]
        all: bool,
    },
    /// Print the cached JSON for a slice
    Get {
        /// Slice key
        slice: String,
    },
    /// Clear the current session's cache namespace
    Clear {
        /// Clear every namespace, including legacy entries
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even with a broken config file
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Login { session } => commands::session::login(&config, session, &output),
        Commands::Logout => commands::session::logout(&config, &output),
        Commands::Whoami => commands::session::whoami(&config, &output),
        Commands::Status => commands::status::show(&config, &output),
        Commands::Cache { command } => match command {
            CacheCommands::List { all } => commands::cache::list(&config, all, &output),
            CacheCommands::Get { slice } => commands::cache::get(&config, slice, &output),
            CacheCommands::Clear { all } => commands::cache::clear(&config, all, &output),
        },
        Commands::Get { slice, timeout } => {
            commands::slice::get(&config, slice, timeout, &output).await
        }
        Commands::Set {
            slice,
            value,
            timeout,
        } => commands::slice::set(&config, slice, value, timeout, &output).await,
        Commands::Watch { slice } => commands::slice::watch(&config, slice, &output).await,
        Commands::Serve { addr } => commands::serve::serve(&config, addr, &output).await,
        Commands::DeleteAccount { yes } => {
            commands::account::delete(&config, yes, &output).await
        }
    }
}

/// Initialize logging when SLICESYNC_LOG is set
///
/// Logs go to `log_file` when configured, otherwise to stderr so they never
/// mix with command output.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("SLICESYNC_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "slicesync_core={},slicesync_cli={}",
        log_level, log_level
    ));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match &config.log_file {
        Some(log_path) => match File::create(log_path) {
            Ok(log_file) => {
                let _ = builder.with_ansi(false).with_writer(log_file).try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
