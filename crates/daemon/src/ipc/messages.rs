//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are externally tagged JSON, one object per line.
//! After a [`IpcRequest::Subscribe`] the daemon keeps the connection open and
//! writes one [`IpcResponse::Event`] per status event.

use std::path::PathBuf;

use protocol::{
    CredentialResponse, ErrorKind, Profile, ProfileId, SessionSnapshot, StatusEvent, VpnError,
};
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Register a VPN configuration file.
    ImportProfile { path: PathBuf },
    /// List registered profiles.
    ListProfiles,
    /// Unregister a profile. A running session is left running.
    RemoveProfile { profile_id: ProfileId },
    /// Start a session.
    Connect { profile_id: ProfileId },
    /// Stop a session and wait until it settles.
    Disconnect { profile_id: ProfileId },
    /// Answer a credential prompt.
    RespondCredential(CredentialResponse),
    /// Snapshot of one session.
    Session { profile_id: ProfileId },
    /// Snapshots of all sessions.
    ListSessions,
    /// Turn this connection into a status event stream.
    Subscribe,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        profile_count: usize,
        active_sessions: usize,
        subscriber_count: usize,
        pending_credentials: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// A newly imported profile.
    ProfileImported { profile: Profile },
    /// Registered profiles.
    Profiles { profiles: Vec<Profile> },
    /// Confirmation that a profile was removed.
    ProfileRemoved { profile_id: ProfileId },
    /// One session.
    Session { session: SessionSnapshot },
    /// All sessions that have been started.
    Sessions { sessions: Vec<SessionSnapshot> },
    /// The credential was handed to the waiting session.
    CredentialAccepted { request_id: String },
    /// The subscription is live; events follow.
    Subscribed,
    /// A status event on a subscribed connection.
    Event { event: StatusEvent },
    /// An error occurred processing the request.
    Error { kind: ErrorKind, message: String },
}

impl From<VpnError> for IpcResponse {
    fn from(err: VpnError) -> Self {
        IpcResponse::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
