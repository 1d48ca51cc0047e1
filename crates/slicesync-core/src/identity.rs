//! Persisted session identity
//!
//! The logged-in session survives restarts in a small file under the data
//! directory. No file means guest mode. The file is replaced atomically so a
//! crash never leaves a half-written session behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::keys::SessionId;

/// Session file manager
pub struct Identity {
    path: PathBuf,
}

impl Identity {
    /// Identity stored at the session path of `config`
    pub fn with_config(config: &Config) -> Self {
        Self {
            path: config.session_path(),
        }
    }

    /// Identity stored at an explicit path
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the session file path (for display purposes)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored session, or `None` in guest mode
    pub fn current(&self) -> Result<Option<SessionId>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session from {:?}", self.path))?;
        let session = SessionId::new(content.trim())
            .with_context(|| format!("Invalid session in {:?}", self.path))?;

        Ok(Some(session))
    }

    /// Store `session` as the logged-in session
    pub fn login(&self, session: &SessionId) -> Result<()> {
        atomic_write(&self.path, session.as_str().as_bytes())
            .with_context(|| format!("Failed to save session to {:?}", self.path))
    }

    /// Forget the stored session; returns whether one was stored
    pub fn logout(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to delete {:?}", self.path))?;
        Ok(true)
    }
}

/// Write data to a file atomically
///
/// Writes a temporary file next to the target, syncs it, then renames it
/// over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}
