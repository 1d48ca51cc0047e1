//! Sync units
//!
//! A [`SyncUnit`] holds one slice value in memory, persists every change to
//! the [`LocalCache`](crate::cache::LocalCache) and mirrors it to a
//! [`RemoteStore`](crate::remote::RemoteStore) document once bound to a
//! session.
//!
//! ## Usage
//!
//! ```ignore
//! let unit = SyncUnit::new(slice, DashboardConfig::default(), cache, remote, options);
//! unit.bind(Some(session))?;
//! unit.update(|config| config.low_threshold = 65);
//! ```

mod machine;
mod unit;

use std::time::Duration;

use thiserror::Error;

use crate::remote::RemoteError;

pub use machine::{Phase, SliceValue, SnapshotOutcome, SyncMachine, WriteOutcome};
pub use unit::{SyncUnit, UnitOptions};

/// Errors surfaced by sync unit control operations
///
/// Reads and writes never fail; these come from binding, waiting and
/// flushing only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Binding to a session requires a running Tokio runtime")]
    NoRuntime,

    #[error("Timed out after {0:?} waiting for the first remote snapshot")]
    Timeout(Duration),

    #[error("Sync unit is not bound to a session")]
    NotBound,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
