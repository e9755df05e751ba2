//! VpnPilot daemon and command-line client.
//!
//! `vpnpilot start` runs the daemon in the foreground; every other command
//! talks to it over the IPC socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, EventStream, IpcClient, IpcResponse,
    IpcServer, PidFile,
};
use daemon::orchestrator::DaemonOrchestrator;
use protocol::{now_ms, Profile, SessionSnapshot, SessionState, StatusEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// VpnPilot - supervise VPN client connections.
#[derive(Parser, Debug)]
#[command(name = "vpnpilot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage VPN profiles
    #[command(subcommand)]
    Profiles(ProfilesCommands),

    /// Connect a profile
    Connect {
        /// Profile ID or name
        profile: String,

        /// Follow the session until it is up or has failed, answering
        /// credential prompts from stdin
        #[arg(long, short)]
        wait: bool,
    },

    /// Disconnect a profile
    Disconnect {
        /// Profile ID or name
        profile: String,
    },

    /// List sessions
    Sessions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stream status events and answer credential prompts
    Watch {
        /// Only show events of this profile (ID or name)
        profile: Option<String>,
    },
}

/// Subcommands for profile management.
#[derive(Subcommand, Debug, Clone)]
pub enum ProfilesCommands {
    /// Import a VPN configuration file
    Import {
        /// Path to the configuration file
        path: PathBuf,
    },

    /// List imported profiles
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove a profile; a running session keeps running
    Remove {
        /// Profile ID or name
        profile: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let daemon_mode = matches!(cli.command, Commands::Start);
    let _log_guard = init_tracing(&config, cli.verbose, daemon_mode)?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Start => run_daemon(config).await,
        Commands::Stop { force, timeout } => {
            if force {
                force_stop_daemon()?;
                println!("Daemon forcefully terminated");
            } else {
                graceful_stop_daemon(timeout).await?;
                println!("Daemon stopped successfully");
            }
            Ok(())
        }
        Commands::Status => show_status().await,
        Commands::Profiles(cmd) => {
            let mut client = connect_client().await?;
            match cmd {
                ProfilesCommands::Import { path } => {
                    let path = std::fs::canonicalize(&path)
                        .with_context(|| format!("Cannot access {}", path.display()))?;
                    let profile = client.import_profile(&path).await?;
                    println!("Imported profile '{}' ({})", profile.display_name, profile.id);
                }
                ProfilesCommands::List { json } => {
                    let profiles = client.list_profiles().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&profiles)?);
                    } else {
                        print_profiles_table(&profiles);
                    }
                }
                ProfilesCommands::Remove { profile } => {
                    let profile_id = resolve_profile(&mut client, &profile).await?;
                    client.remove_profile(&profile_id).await?;
                    println!("Removed profile {}", profile_id);
                }
            }
            Ok(())
        }
        Commands::Connect { profile, wait } => {
            let mut client = connect_client().await?;
            let profile_id = resolve_profile(&mut client, &profile).await?;

            // Subscribe before connecting so no event is missed.
            let stream = if wait {
                Some(connect_client().await?.subscribe().await?)
            } else {
                None
            };

            let session = client.connect_session(&profile_id).await?;
            println!("Connecting {} (pid {})", profile_id, format_pid(session.pid));

            match stream {
                Some(mut stream) => follow_events(&mut stream, &mut client, Some(&profile_id), true).await,
                None => Ok(()),
            }
        }
        Commands::Disconnect { profile } => {
            let mut client = connect_client().await?;
            let profile_id = resolve_profile(&mut client, &profile).await?;
            let session = client.disconnect_session(&profile_id).await?;
            println!("{}: {}", profile_id, session.state);
            Ok(())
        }
        Commands::Sessions { json } => {
            let sessions = connect_client().await?.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
            Ok(())
        }
        Commands::Watch { profile } => {
            let mut client = connect_client().await?;
            let profile_id = match profile {
                Some(p) => Some(resolve_profile(&mut client, &p).await?),
                None => None,
            };
            let mut stream = connect_client().await?.subscribe().await?;
            follow_events(&mut stream, &mut client, profile_id.as_deref(), false).await
        }
    }
}

/// Sets up the global subscriber.
///
/// The daemon logs at the configured level and, when `log_file` is set, also
/// to that file. CLI commands only log warnings unless `--verbose` is given.
fn init_tracing(
    config: &Config,
    verbose: bool,
    daemon_mode: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else if daemon_mode {
        config.daemon.log_level.as_str()
    } else {
        "warn"
    };

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(fmt::layer().with_writer(std::io::stderr));

    match (&config.daemon.log_file, daemon_mode) {
        (Some(path), true) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        _ => {
            registry.init();
            Ok(None)
        }
    }
}

/// Runs the daemon until SIGTERM/SIGINT or an IPC stop request.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    if let Some(pid) = get_daemon_pid() {
        anyhow::bail!(
            "Daemon already running (PID: {})\n\nTo stop it, run:\n  vpnpilot stop",
            pid
        );
    }

    config
        .check_client_binary()
        .context("VPN client is not available")?;

    let _pid_file = PidFile::create(&get_pid_file_path()).context("Failed to write PID file")?;
    let orchestrator = Arc::new(DaemonOrchestrator::new(config)?);

    let socket_path = get_socket_path();
    let server = IpcServer::bind(&socket_path)
        .await
        .with_context(|| format!("Failed to bind IPC socket: {}", socket_path.display()))?;

    orchestrator.start().await?;
    let serving = tokio::spawn(Arc::clone(&orchestrator).serve(server));

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        signal = wait_for_shutdown_signal() => signal?,
        _ = shutdown.cancelled() => tracing::info!("Received stop request"),
    }

    orchestrator.stop().await?;
    if let Err(e) = serving.await {
        tracing::warn!(error = %e, "IPC server task failed");
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn connect_client() -> anyhow::Result<IpcClient> {
    IpcClient::connect(&get_socket_path())
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Accepts a profile id or a unique display name.
async fn resolve_profile(client: &mut IpcClient, key: &str) -> anyhow::Result<String> {
    let profiles = client.list_profiles().await?;
    if profiles.iter().any(|p| p.id == key) {
        return Ok(key.to_string());
    }

    let named: Vec<&Profile> = profiles.iter().filter(|p| p.display_name == key).collect();
    match named.as_slice() {
        [profile] => Ok(profile.id.clone()),
        [] => Ok(key.to_string()),
        _ => anyhow::bail!(
            "Profile name '{}' is ambiguous; use one of: {}",
            key,
            named.iter().map(|p| p.id.as_str()).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Prints events and answers credential prompts from stdin.
///
/// With `until_settled`, returns once the profile is connected, and fails if
/// it ends up `Failed` or `Idle` instead.
async fn follow_events(
    stream: &mut EventStream,
    client: &mut IpcClient,
    profile_id: Option<&str>,
    until_settled: bool,
) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = stream.next_event().await? {
        if profile_id.is_some_and(|id| event.profile_id() != id) {
            continue;
        }

        match event {
            StatusEvent::LogLineReceived { profile_id, event } => {
                println!("[{}] {}", short_id(&profile_id), event.raw_line);
            }
            StatusEvent::SessionStateChanged {
                profile_id,
                state,
                failure_reason,
                tunnel,
            } => {
                match (&failure_reason, &tunnel) {
                    (Some(reason), _) => {
                        println!("[{}] {} ({})", short_id(&profile_id), state, reason)
                    }
                    (None, Some(tunnel)) => println!(
                        "[{}] {} ({})",
                        short_id(&profile_id),
                        state,
                        format_tunnel(tunnel)
                    ),
                    (None, None) => println!("[{}] {}", short_id(&profile_id), state),
                }
                if until_settled {
                    match state {
                        SessionState::Connected => return Ok(()),
                        SessionState::Failed => anyhow::bail!(
                            "Connection failed: {}",
                            failure_reason.map(|r| r.to_string()).unwrap_or_default()
                        ),
                        SessionState::Idle => anyhow::bail!("Session was disconnected"),
                        _ => {}
                    }
                }
            }
            StatusEvent::CredentialRequested(request) => {
                eprint!("{} for {}: ", request.credential_type, short_id(&request.profile_id));
                let Some(value) = stdin.next_line().await? else {
                    anyhow::bail!("stdin closed while a credential was requested");
                };
                client.respond_credential(&request.request_id, value).await?;
            }
        }
    }

    if until_settled {
        anyhow::bail!("Daemon closed the event stream");
    }
    Ok(())
}

async fn show_status() -> anyhow::Result<()> {
    let mut client = connect_client().await?;
    match client.status().await? {
        IpcResponse::Status {
            running,
            uptime_secs,
            profile_count,
            active_sessions,
            subscriber_count,
            pending_credentials,
        } => {
            println!("Daemon Status: {}", if running { "running" } else { "stopping" });
            println!("  Uptime:      {}", format_duration(uptime_secs));
            println!("  Profiles:    {}", profile_count);
            println!("  Active:      {}", active_sessions);
            println!("  Watchers:    {}", subscriber_count);
            println!("  Prompts:     {}", pending_credentials);
            Ok(())
        }
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect_client().await?;

    println!("Sending shutdown request...");
    client.stop().await.context("Failed to send stop request")?;
    println!("Shutdown acknowledged, waiting for daemon to exit...");

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists()
            || IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!(
        "Timeout waiting for daemon to exit ({}s)\nTry: vpnpilot stop --force",
        timeout_secs
    )
}

/// Force stop the daemon using SIGKILL.
///
/// Running VPN clients are not disconnected.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid().context("Daemon is not running (no live PID file)")?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);
    eprintln!("Warning: VPN client processes started by the daemon may still be running");

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

fn print_profiles_table(profiles: &[Profile]) {
    if profiles.is_empty() {
        println!("No profiles imported.");
        return;
    }

    let name_width = profiles
        .iter()
        .map(|p| p.display_name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!("{:<36}  {:<name_width$}  PATH", "ID", "NAME", name_width = name_width);
    for profile in profiles {
        println!(
            "{:<36}  {:<name_width$}  {}",
            profile.id,
            profile.display_name,
            profile.config_path.display(),
            name_width = name_width
        );
    }
}

fn print_sessions_table(sessions: &[SessionSnapshot]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    println!(
        "{:<10}  {:<13}  {:>8}  {:>10}  {}",
        "PROFILE", "STATE", "PID", "STARTED", "LAST EVENT"
    );
    println!("{}", "-".repeat(64));

    for session in sessions {
        let started = session
            .started_at
            .map(format_relative_time)
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&session.failure_reason, &session.last_event) {
            (Some(reason), _) => reason.to_string(),
            (None, Some(event)) => event.raw_line.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<10}  {:<13}  {:>8}  {:>10}  {}",
            short_id(&session.profile_id),
            session.state.to_string(),
            format_pid(session.pid),
            started,
            truncate_str(&detail, 60)
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn format_pid(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Renders tunnel addresses as `remote -> local`.
fn format_tunnel(tunnel: &protocol::TunnelAddresses) -> String {
    format!(
        "{} -> {}",
        tunnel.remote_address.as_deref().unwrap_or("?"),
        tunnel.local_address.as_deref().unwrap_or("?")
    )
}

/// First eight characters of a profile id.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Format a Unix timestamp in milliseconds as relative time (e.g. "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = now_ms().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_chars` characters, adding "..." if
/// truncated.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
