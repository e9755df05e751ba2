//! # VpnPilot Daemon Library
//!
//! This crate supervises an external VPN client on behalf of a local user.
//!
//! ## Overview
//!
//! The daemon provides:
//!
//! - **Profile Registry**: Import, list and remove VPN configuration files
//! - **Session Control**: Connect and disconnect, one client process per profile
//! - **Output Classification**: Turn client output into typed log events
//! - **Credential Prompts**: Relay username/password prompts to observers
//! - **Status Events**: Ordered fan-out of everything above to subscribers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌────────────────────┐  ┌──────────────┐  │
//! │  │   Profile    │  │ Session Controller │  │    Status    │  │
//! │  │    Store     │  │  (one slot/profile)│──▶  Publisher   │  │
//! │  └──────────────┘  └─────────┬──────────┘  └──────────────┘  │
//! │                              │                               │
//! │        ┌─────────────────────┼────────────────────┐          │
//! │        ▼                     ▼                    ▼          │
//! │  ┌───────────┐  ┌────────────────────────┐  ┌────────────┐   │
//! │  │  Process  │  │ Log Monitor/Classifier │  │ Credential │   │
//! │  │ Launcher  │  └────────────────────────┘  │   Broker   │   │
//! │  └───────────┘                              └────────────┘   │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                IPC server (Unix socket)                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     let profile = orchestrator.import_profile("office.ovpn".as_ref())?;
//!     let mut events = orchestrator.subscribe();
//!     orchestrator.connect(&profile.id).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`profiles`]: Persistent profile registry
//! - [`session`]: Process supervision and the session state machine
//! - [`publisher`]: Status event fan-out
//! - [`ipc`]: CLI-daemon socket protocol
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod profiles;
pub mod publisher;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use orchestrator::{DaemonOrchestrator, OrchestratorState};
pub use profiles::{ProfileError, ProfileStore};
pub use publisher::{StatusPublisher, SubscriberId, Subscription};
pub use session::{
    Classifier, CommandLauncher, ProcessControl, ProcessLauncher, SessionController,
    SessionError, SessionSettings, SpawnedProcess,
};
