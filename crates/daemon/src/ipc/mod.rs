//! Unix Domain Socket IPC between the CLI and the daemon.
//!
//! ## Overview
//!
//! Messages are JSON objects, one per line. Most requests get exactly one
//! response. `Subscribe` is the exception: the daemon acknowledges it and
//! then streams [`IpcResponse::Event`] lines until either side hangs up.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/vpnpilot/daemon.sock`
//! - Fallback: `/tmp/vpnpilot-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     for profile in client.list_profiles().await? {
//!         println!("{} {}", profile.id, profile.display_name);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::{EventStream, IpcClient};
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/vpnpilot/daemon.sock`
/// 2. Otherwise: `/tmp/vpnpilot-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("vpnpilot").join("daemon.sock")
    } else {
        // Owner of /proc/self is the current uid.
        let uid = std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0);

        PathBuf::from(format!("/tmp/vpnpilot-{}", uid)).join("daemon.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<F: FnOnce()>(value: Option<&str>, f: F) {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: env tests are serialized
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        f();
        // SAFETY: env tests are serialized
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_socket_path_with_xdg_runtime_dir() {
        with_runtime_dir(Some("/run/user/1000"), || {
            assert_eq!(
                get_socket_path(),
                PathBuf::from("/run/user/1000/vpnpilot/daemon.sock")
            );
        });
    }

    #[test]
    #[serial]
    fn test_socket_path_fallback() {
        with_runtime_dir(None, || {
            let path = get_socket_path();
            let path = path.to_str().unwrap();
            assert!(path.starts_with("/tmp/vpnpilot-"));
            assert!(path.ends_with("/daemon.sock"));
        });
    }

    #[test]
    #[serial]
    fn test_socket_path_is_absolute() {
        assert!(get_socket_path().is_absolute());
    }
}
