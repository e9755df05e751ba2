//! Error types shared between the daemon and its clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of every failure the system reports.
///
/// Command errors carry a kind so clients can react without parsing
/// messages, and a failed session records the kind of the runtime failure
/// that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The profile file is unreadable or not a client configuration.
    InvalidProfileFormat,
    /// No profile is registered under the given id.
    ProfileNotFound,
    /// The VPN client executable could not be started.
    ProcessSpawnFailed,
    /// A session for the profile is already active.
    SessionBusy,
    /// A credential prompt was not answered before its deadline.
    CredentialTimeout,
    /// The server rejected the supplied credentials.
    AuthFailed,
    /// The VPN client died or reported a fatal error.
    UnexpectedTermination,
    /// A credential response referenced an unknown or expired request.
    CredentialRequestNotFound,
    /// The profile registry could not be read or written.
    Storage,
    /// Any other I/O failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidProfileFormat => "invalid profile format",
            ErrorKind::ProfileNotFound => "profile not found",
            ErrorKind::ProcessSpawnFailed => "process spawn failed",
            ErrorKind::SessionBusy => "session busy",
            ErrorKind::CredentialTimeout => "credential timeout",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::UnexpectedTermination => "unexpected termination",
            ErrorKind::CredentialRequestNotFound => "credential request not found",
            ErrorKind::Storage => "storage error",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(s)
    }
}

/// Protocol-level error covering all failure modes visible to clients.
#[derive(Debug, Error)]
pub enum VpnError {
    // Profile errors
    /// The profile file is unreadable or not a client configuration.
    #[error("invalid profile format: {0}")]
    InvalidProfileFormat(String),

    /// No profile is registered under the given id.
    #[error("profile not found: {profile_id}")]
    ProfileNotFound {
        /// The missing profile identifier.
        profile_id: String,
    },

    // Session command errors
    /// The VPN client executable could not be started.
    #[error("failed to spawn VPN client: {0}")]
    ProcessSpawnFailed(String),

    /// A session for the profile is already active.
    #[error("session busy: {profile_id}")]
    SessionBusy {
        /// The profile whose session is active.
        profile_id: String,
    },

    /// A credential response referenced an unknown or expired request.
    #[error("credential request not found: {request_id}")]
    CredentialRequestNotFound {
        /// The unknown request identifier.
        request_id: String,
    },

    // Session runtime failures
    /// A credential prompt was not answered before its deadline.
    #[error("credential request timed out: {0}")]
    CredentialTimeout(String),

    /// The server rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The VPN client died or reported a fatal error.
    #[error("unexpected termination: {0}")]
    UnexpectedTermination(String),

    // Infrastructure
    /// The profile registry could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl VpnError {
    /// Returns the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VpnError::InvalidProfileFormat(_) => ErrorKind::InvalidProfileFormat,
            VpnError::ProfileNotFound { .. } => ErrorKind::ProfileNotFound,
            VpnError::ProcessSpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            VpnError::SessionBusy { .. } => ErrorKind::SessionBusy,
            VpnError::CredentialRequestNotFound { .. } => ErrorKind::CredentialRequestNotFound,
            VpnError::CredentialTimeout(_) => ErrorKind::CredentialTimeout,
            VpnError::AuthFailed(_) => ErrorKind::AuthFailed,
            VpnError::UnexpectedTermination(_) => ErrorKind::UnexpectedTermination,
            VpnError::Storage(_) => ErrorKind::Storage,
            VpnError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, VpnError>;

impl From<serde_json::Error> for VpnError {
    fn from(err: serde_json::Error) -> Self {
        VpnError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for VpnError {
    fn from(err: std::io::Error) -> Self {
        VpnError::Io(err.to_string())
    }
}
