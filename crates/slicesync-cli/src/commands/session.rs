//! Session command handlers

use anyhow::{Context, Result};

use slicesync_core::{Config, Identity, SessionId};

use crate::output::{Output, OutputFormat};

/// Store `session` as the logged-in session
pub fn login(config: &Config, session: String, output: &Output) -> Result<()> {
    let session = SessionId::new(session).context("Invalid session id")?;
    let identity = Identity::with_config(config);

    let previous = identity.current().ok().flatten();
    identity.login(&session)?;

    match previous {
        Some(previous) if previous != session => {
            output.success(&format!("Logged in as {} (was {})", session, previous))
        }
        _ => output.success(&format!("Logged in as {}", session)),
    }
    if config.active_remote_url().is_none() {
        output.message("Remote sync is disabled; values stay on this device.");
    }

    Ok(())
}

/// Forget the stored session and return to guest mode
pub fn logout(config: &Config, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config);

    if identity.logout()? {
        output.success("Logged out");
    } else {
        output.message("Already in guest mode.");
    }

    Ok(())
}

/// Show the stored session
pub fn whoami(config: &Config, output: &Output) -> Result<()> {
    let session = Identity::with_config(config).current()?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "session": session.as_ref().map(SessionId::as_str),
                    "guest": session.is_none()
                })
            );
        }
        OutputFormat::Quiet => {
            if let Some(session) = session {
                println!("{}", session);
            }
        }
        OutputFormat::Human => match session {
            Some(session) => println!("{}", session),
            None => println!("guest (not logged in)"),
        },
    }

    Ok(())
}
