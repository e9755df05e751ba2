//! # VpnPilot Protocol Library
//!
//! Shared types for the VpnPilot daemon and its clients.
//!
//! ## Overview
//!
//! The daemon supervises an external VPN client (OpenVPN by default) and
//! reports what it is doing through a stream of [`StatusEvent`]s. This crate
//! holds everything that crosses that boundary:
//!
//! - **Profiles**: imported configurations ([`Profile`])
//! - **Sessions**: lifecycle state and snapshots ([`SessionState`], [`SessionSnapshot`])
//! - **Log events**: classified client output ([`LogEvent`], [`LogKind`])
//! - **Credentials**: interactive prompts and answers ([`CredentialRequest`], [`CredentialResponse`])
//! - **Errors**: the failure taxonomy ([`ErrorKind`], [`VpnError`])
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{SessionState, StatusEvent};
//!
//! let event = StatusEvent::SessionStateChanged {
//!     profile_id: "office".to_string(),
//!     state: SessionState::Connecting,
//!     failure_reason: None,
//!     tunnel: None,
//! };
//! let json = serde_json::to_string(&event).unwrap();
//! assert!(json.contains("connecting"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Data model and status events
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ErrorKind, Result, VpnError};
pub use messages::{
    now_ms, CredentialRequest, CredentialResponse, CredentialType, FailureReason, LogEvent,
    LogKind, Profile, ProfileId, RequestId, SessionSnapshot, SessionState, StatusEvent,
    TunnelAddresses, REGISTRY_VERSION,
};
