//! Remote store errors

use thiserror::Error;

/// Errors reported by a remote store adapter
///
/// Cloneable so one failure can be fanned out to every subscriber of a link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The principal may not read or write this document. Expected while a
    /// session is being torn down.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The store cannot be reached right now
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// A document or message could not be decoded
    #[error("Failed to decode remote data: {0}")]
    Decode(String),

    /// The peer sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The store failed internally
    #[error("Remote store error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Permission failures are swallowed by sync units
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied(_))
    }

    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        RemoteError::Unavailable(reason.to_string())
    }
}
