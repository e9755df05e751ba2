//! Shared data model for VpnPilot.
//!
//! These types describe profiles, session state, classified log output,
//! credential prompts and the status events fanned out to observers. They
//! are plain serde structures so the daemon can hand them to IPC clients
//! unchanged. All timestamps are Unix milliseconds.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Current version of the persisted profile registry format.
pub const REGISTRY_VERSION: u32 = 1;

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Profiles
// ============================================================================

/// Identifier assigned to a profile at import time.
pub type ProfileId = String;

/// Identifier of a pending credential request.
pub type RequestId = String;

/// An imported VPN configuration.
///
/// Profiles are immutable once imported; the only lifecycle operations are
/// import and removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable identifier, persisted with the registry.
    pub id: ProfileId,
    /// Human-readable name (the config file stem).
    pub display_name: String,
    /// Absolute path of the configuration handed to the VPN client.
    pub config_path: PathBuf,
    /// When the profile was imported.
    pub imported_at: u64,
}

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No process is running.
    #[default]
    Idle,
    /// The client was spawned and has not completed initialization.
    Connecting,
    /// The tunnel is up.
    Connected,
    /// A disconnect was requested and the process is being stopped.
    Disconnecting,
    /// The last attempt failed; terminal until the next connect.
    Failed,
}

impl SessionState {
    /// Whether a new connect is allowed from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }

    /// Whether a VPN client process may be alive in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session ended up in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Detail, usually the offending output line.
    pub message: String,
}

impl FailureReason {
    /// Create a new failure reason.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Endpoints of an established tunnel, as reported by the VPN client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAddresses {
    /// Address of the VPN server the tunnel is connected to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    /// Address assigned to the local tunnel interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
}

impl TunnelAddresses {
    /// Returns true if neither address is known.
    pub fn is_empty(&self) -> bool {
        self.remote_address.is_none() && self.local_address.is_none()
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Profile the session belongs to.
    pub profile_id: ProfileId,
    /// Current state.
    pub state: SessionState,
    /// PID of the VPN client, while one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the current attempt was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Most recent classified output line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<LogEvent>,
    /// Set while the session is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Tunnel endpoints, while connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelAddresses>,
    /// Connect attempt counter, incremented on every successful spawn.
    pub attempt: u64,
}

// ============================================================================
// Log events
// ============================================================================

/// Kind of secret the VPN client is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Account user name.
    Username,
    /// Account password.
    Password,
    /// Passphrase protecting the private key.
    PrivateKeyPassphrase,
    /// Static or dynamic challenge response (e.g. an OTP).
    Challenge,
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialType::Username => "username",
            CredentialType::Password => "password",
            CredentialType::PrivateKeyPassphrase => "private key passphrase",
            CredentialType::Challenge => "challenge response",
        };
        f.write_str(s)
    }
}

/// Classification of one unit of VPN client output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LogKind {
    /// Ordinary output.
    Info,
    /// The client is waiting for a credential on stdin.
    AuthRequest(CredentialType),
    /// Tunnel initialization completed.
    ConnectedMarker,
    /// The client reported an unrecoverable error.
    FatalError(String),
    /// The process exited; `None` when it was killed by a signal.
    ProcessExit(Option<i32>),
}

/// One classified line of output, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Emission sequence number, starting at 0 for every attempt.
    pub seq: u64,
    /// When the line was read.
    pub timestamp: u64,
    /// Line text without the line terminator.
    pub raw_line: String,
    /// Classification result.
    pub kind: LogKind,
}

// ============================================================================
// Credentials
// ============================================================================

/// A prompt for a secret raised by a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// Identifier to answer with.
    pub request_id: RequestId,
    /// Session that raised the prompt.
    pub profile_id: ProfileId,
    /// What is being asked for.
    pub credential_type: CredentialType,
    /// After this instant the session fails with a credential timeout.
    pub deadline: u64,
}

/// Answer to a [`CredentialRequest`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialResponse {
    /// The request being answered.
    pub request_id: RequestId,
    /// Secret value, written verbatim to the client's stdin.
    pub value: String,
}

impl std::fmt::Debug for CredentialResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResponse")
            .field("request_id", &self.request_id)
            .field("value", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Status events
// ============================================================================

/// Event fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StatusEvent {
    /// A session moved to a new state.
    SessionStateChanged {
        /// Session whose state changed.
        profile_id: ProfileId,
        /// The new state.
        state: SessionState,
        /// Present when `state` is `Failed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<FailureReason>,
        /// Present when `state` is `Connected` and the client reported
        /// its endpoints.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel: Option<TunnelAddresses>,
    },
    /// A session produced a classified output line.
    LogLineReceived {
        /// Session that produced the line.
        profile_id: ProfileId,
        /// The classified line.
        event: LogEvent,
    },
    /// A session is waiting for a credential.
    CredentialRequested(CredentialRequest),
}

impl StatusEvent {
    /// Profile the event refers to.
    pub fn profile_id(&self) -> &str {
        match self {
            StatusEvent::SessionStateChanged { profile_id, .. } => profile_id,
            StatusEvent::LogLineReceived { profile_id, .. } => profile_id,
            StatusEvent::CredentialRequested(req) => &req.profile_id,
        }
    }
}
