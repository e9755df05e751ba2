//! Launching and signalling the external VPN client.
//!
//! [`ProcessLauncher`] is the seam between the session controller and the
//! operating system. [`CommandLauncher`] runs the configured client through
//! `tokio::process` with all three stdio streams piped; tests substitute
//! in-memory launchers.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;

/// Boxed child stdin.
pub type ChildInput = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Boxed child stdout or stderr.
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Sends termination signals to a running client.
pub trait ProcessControl: Send + Sync {
    /// Asks the process to exit (SIGTERM).
    fn terminate(&self) -> io::Result<()>;

    /// Forces the process to exit (SIGKILL).
    fn kill(&self) -> io::Result<()>;
}

/// A freshly spawned client with its streams and exit notification.
pub struct SpawnedProcess {
    /// OS process id, when known.
    pub pid: Option<u32>,
    /// Write end of the child's stdin.
    pub stdin: ChildInput,
    /// Read end of the child's stdout.
    pub stdout: ChildOutput,
    /// Read end of the child's stderr.
    pub stderr: ChildOutput,
    /// Resolves with the exit code once the child has been reaped.
    pub exit: oneshot::Receiver<Option<i32>>,
    /// Cancelled once the child has been reaped.
    pub exited: CancellationToken,
    /// Signal delivery.
    pub control: Arc<dyn ProcessControl>,
}

/// Starts VPN client processes.
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the client for the given configuration file.
    fn launch(&self, config_path: &Path) -> io::Result<SpawnedProcess>;
}

/// The program and arguments used to start the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Builds `[privilege_wrapper...] <binary> --config <path> [extra_args...]`.
    pub fn build(client: &ClientConfig, config_path: &Path) -> Self {
        let mut parts: Vec<String> = client
            .privilege_wrapper
            .as_deref()
            .map(|w| w.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        parts.push(client.binary.clone());
        parts.push("--config".to_string());
        parts.push(config_path.to_string_lossy().into_owned());
        parts.extend(client.extra_args.iter().cloned());

        let program = parts.remove(0);
        Self {
            program,
            args: parts,
        }
    }
}

/// Launches the configured client with `tokio::process`.
pub struct CommandLauncher {
    client: ClientConfig,
}

impl CommandLauncher {
    pub fn new(client: ClientConfig) -> Self {
        Self { client }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, config_path: &Path) -> io::Result<SpawnedProcess> {
        let invocation = Invocation::build(&self.client, config_path);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = |name: &str| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("child {} not piped", name),
            )
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        tracing::info!(
            program = %invocation.program,
            config = %config_path.display(),
            pid = ?pid,
            "Spawned VPN client"
        );

        let exited = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        // The waiter owns the child, so dropping it (runtime shutdown) kills
        // the client.
        let reaped = exited.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for VPN client");
                    None
                }
            };
            tracing::debug!(pid = ?pid, code = ?code, "VPN client exited");
            reaped.cancel();
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: exit_rx,
            exited: exited.clone(),
            control: Arc::new(SignalControl { pid, exited }),
        })
    }
}

/// Delivers signals by pid until the child has been reaped.
struct SignalControl {
    pid: Option<u32>,
    exited: CancellationToken,
}

impl SignalControl {
    fn send(&self, sig: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exited.is_cancelled() {
            return Ok(());
        }
        let pid = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

impl ProcessControl for SignalControl {
    fn terminate(&self) -> io::Result<()> {
        self.send(Signal::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.send(Signal::SIGKILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Runs `script` through `sh -c`; `$0` is `--config` and `$1` the path.
    fn sh_client(script: &str) -> ClientConfig {
        ClientConfig {
            binary: script.to_string(),
            privilege_wrapper: Some("/bin/sh -c".to_string()),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_invocation_defaults() {
        let inv = Invocation::build(&ClientConfig::default(), Path::new("/etc/vpn/office.ovpn"));
        assert_eq!(inv.program, "openvpn");
        assert_eq!(
            inv.args,
            vec!["--config", "/etc/vpn/office.ovpn", "--auth-retry", "none", "--verb", "3"]
        );
    }

    #[test]
    fn test_invocation_with_wrapper() {
        let client = ClientConfig {
            binary: "/usr/sbin/openvpn".to_string(),
            privilege_wrapper: Some("sudo -n".to_string()),
            extra_args: Vec::new(),
        };
        let inv = Invocation::build(&client, &PathBuf::from("/tmp/a.ovpn"));
        assert_eq!(inv.program, "sudo");
        assert_eq!(inv.args, vec!["-n", "/usr/sbin/openvpn", "--config", "/tmp/a.ovpn"]);
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let launcher = CommandLauncher::new(ClientConfig {
            binary: "/nonexistent/openvpn".to_string(),
            privilege_wrapper: None,
            extra_args: Vec::new(),
        });
        assert!(launcher.launch(Path::new("/tmp/x.ovpn")).is_err());
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let launcher = CommandLauncher::new(sh_client("exit 3"));
        let spawned = launcher.launch(Path::new("/tmp/x.ovpn")).unwrap();
        assert!(spawned.pid.is_some());

        let code = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(3));
        assert!(spawned.exited.is_cancelled());
    }

    #[tokio::test]
    async fn test_config_path_is_passed() {
        let launcher = CommandLauncher::new(sh_client("echo \"$0 $1\""));
        let spawned = launcher.launch(Path::new("/tmp/office.ovpn")).unwrap();

        let mut lines = BufReader::new(spawned.stdout).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("--config /tmp/office.ovpn"));
    }

    #[tokio::test]
    async fn test_stdin_and_stdout_are_piped() {
        let launcher = CommandLauncher::new(sh_client("read line; echo \"got $line\""));
        let spawned = launcher.launch(Path::new("/tmp/x.ovpn")).unwrap();

        let mut stdin = spawned.stdin;
        stdin.write_all(b"secret\n").await.unwrap();
        stdin.flush().await.unwrap();

        let mut lines = BufReader::new(spawned.stdout).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("got secret"));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let launcher = CommandLauncher::new(sh_client("exec sleep 30"));
        let spawned = launcher.launch(Path::new("/tmp/x.ovpn")).unwrap();

        spawned.control.terminate().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, None);

        // Signalling a reaped child is a no-op.
        assert!(spawned.control.kill().is_ok());
    }
}
