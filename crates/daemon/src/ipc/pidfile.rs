//! PID file handling for daemon running detection.
//!
//! The PID file lives at:
//! - `$XDG_DATA_HOME/vpnpilot/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/vpnpilot/daemon.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{get_daemon_pid, is_daemon_running};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("vpnpilot").join("daemon.pid")
}

/// Check if a daemon process is currently running.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// PID of the running daemon, if any. Stale PID files are removed.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Reads the PID stored at `path` and returns it if that process is alive.
///
/// Unparseable files and files naming a dead process are removed.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        tracing::debug!(path = %path.display(), "Removing unparseable PID file");
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        tracing::debug!(path = %path.display(), pid, "Removing stale PID file");
        cleanup_stale_pid_file(path);
        None
    }
}

/// Checks a pid with signal 0.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// The PID file of the running daemon. Removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process id to `path`.
    ///
    /// Fails with `AlreadyExists` if the file names another live process.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(pid) = read_live_pid(path) {
            if pid != std::process::id() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("daemon already running with PID {}", pid),
                ));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        cleanup_stale_pid_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_pid_file_path_uses_xdg_data_home() {
        let original = std::env::var("XDG_DATA_HOME").ok();
        // SAFETY: serialized with the other env tests
        unsafe {
            std::env::set_var("XDG_DATA_HOME", "/var/lib/test-data");
        }
        assert_eq!(
            get_pid_file_path(),
            PathBuf::from("/var/lib/test-data/vpnpilot/daemon.pid")
        );
        // SAFETY: serialized with the other env tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_DATA_HOME", val),
                None => std::env::remove_var("XDG_DATA_HOME"),
            }
        }
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_out_of_range_pid_is_not_running() {
        assert!(!is_process_running(4_000_000_000));
        assert!(!is_process_running(0));
    }

    #[test]
    fn test_read_live_pid_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(read_live_pid(&dir.path().join("daemon.pid")), None);
    }

    #[test]
    fn test_read_live_pid_removes_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_live_pid_removes_dead_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(read_live_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        assert_eq!(read_live_pid(&path), Some(std::process::id()));

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_refuses_live_foreign_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // PID 1 always exists.
        fs::write(&path, "1\n").unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(path.exists());
    }
}
