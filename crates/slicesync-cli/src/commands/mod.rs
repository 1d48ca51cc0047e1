//! Command handlers

pub mod account;
pub mod cache;
pub mod config;
pub mod serve;
pub mod session;
pub mod slice;
pub mod status;

use anyhow::{Context, Result};

use slicesync_core::{Config, Identity, SessionScope};

/// Open a session scope for `config` and log it in as the stored session
///
/// The scope stays in guest mode when no session is stored.
pub(crate) fn open_scope(config: &Config) -> Result<SessionScope> {
    let scope = SessionScope::from_config(config)?;
    let stored = Identity::with_config(config)
        .current()
        .context("Failed to read the stored session")?;
    if let Some(session) = stored {
        scope
            .login(session)
            .context("Failed to log in the stored session")?;
    }
    Ok(scope)
}
