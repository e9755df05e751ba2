//! VPN connection sessions.
//!
//! A session is one run of the VPN client for one profile. The
//! [`SessionController`] owns the state machine; the other modules provide
//! the process seam, output classification, and credential prompts it
//! drives.

pub mod classifier;
pub mod controller;
pub mod credentials;
pub mod monitor;
pub mod process;

pub use classifier::{Classified, Classifier, ClassifierError};
pub use controller::{SessionController, SessionError, SessionSettings};
pub use credentials::{CredentialBroker, CredentialOutcome, PendingCredential};
pub use monitor::{LogMonitor, MonitorEvent, OutputStream};
pub use process::{CommandLauncher, Invocation, ProcessControl, ProcessLauncher, SpawnedProcess};
