//! Daemon orchestrator wiring the subsystems together.
//!
//! The [`DaemonOrchestrator`] owns the profile store, the status publisher
//! and the session controller, exposes the command interface used by the
//! CLI, and serves that interface over the IPC socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use protocol::{Profile, SessionSnapshot, VpnError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::profiles::ProfileStore;
use crate::publisher::{StatusPublisher, SubscriberId, Subscription};
use crate::session::{
    Classifier, CommandLauncher, ProcessLauncher, SessionController, SessionSettings,
};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Running and accepting commands.
    Running,
    /// Disconnecting sessions before exit.
    ShuttingDown,
}

/// Coordinates profiles, sessions and observers.
pub struct DaemonOrchestrator {
    config: Config,
    state: RwLock<OrchestratorState>,
    profiles: Arc<ProfileStore>,
    publisher: Arc<StatusPublisher>,
    sessions: SessionController,
    started_at: Instant,
    shutdown_token: CancellationToken,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator that runs the configured VPN client.
    pub fn new(config: Config) -> Result<Self> {
        let launcher = Arc::new(CommandLauncher::new(config.client.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Creates an orchestrator with a custom process launcher.
    pub fn with_launcher(config: Config, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        let data_dir = &config.daemon.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let profiles = Arc::new(ProfileStore::from_config(&config));
        profiles
            .load()
            .with_context(|| format!("Failed to load profile registry: {}", profiles.path().display()))?;

        let classifier = Arc::new(
            Classifier::from_config(&config.monitor).context("Invalid output classification rules")?,
        );
        debug!(rules = classifier.len(), "Loaded classification rules");

        let publisher = Arc::new(StatusPublisher::new());
        let sessions = SessionController::new(
            Arc::clone(&profiles),
            launcher,
            classifier,
            Arc::clone(&publisher),
            SessionSettings::from_config(&config),
        );

        info!(
            data_dir = %data_dir.display(),
            profiles = profiles.len().unwrap_or(0),
            "Daemon initialized"
        );

        Ok(Self {
            config,
            state: RwLock::new(OrchestratorState::Stopped),
            profiles,
            publisher,
            sessions,
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Marks the orchestrator as running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != OrchestratorState::Stopped {
            anyhow::bail!("Orchestrator is already running");
        }
        *state = OrchestratorState::Running;
        info!("Daemon orchestrator started");
        Ok(())
    }

    /// Disconnects every session and stops serving.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down")
                }
                OrchestratorState::Running => *state = OrchestratorState::ShuttingDown,
            }
        }

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();
        self.sessions.shutdown().await;

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Cancelled once shutdown has been requested, locally or over IPC.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // ------------------------------------------------------------------
    // Command interface
    // ------------------------------------------------------------------

    /// Registers an observer of status events.
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.publisher.unsubscribe(id)
    }

    pub async fn connect(&self, profile_id: &str) -> protocol::Result<SessionSnapshot> {
        Ok(self.sessions.connect(profile_id).await?)
    }

    /// Stops a session. The session of a profile removed while it was
    /// running is dropped once it has settled.
    pub async fn disconnect(&self, profile_id: &str) -> protocol::Result<SessionSnapshot> {
        let snapshot = self.sessions.disconnect(profile_id).await?;
        if self.profiles.get(profile_id)?.is_none() {
            self.sessions.forget(profile_id);
        }
        Ok(snapshot)
    }

    pub fn respond_credential(&self, request_id: &str, value: String) -> protocol::Result<()> {
        Ok(self.sessions.respond_credential(request_id, value)?)
    }

    pub fn import_profile(&self, path: &Path) -> protocol::Result<Profile> {
        Ok(self.profiles.import(path)?)
    }

    pub fn list_profiles(&self) -> protocol::Result<Vec<Profile>> {
        Ok(self.profiles.list()?)
    }

    /// Unregisters a profile.
    ///
    /// An active session keeps running and can still be disconnected; an
    /// inactive one is dropped along with the profile.
    pub async fn remove_profile(&self, profile_id: &str) -> protocol::Result<Profile> {
        if self.profiles.get(profile_id)?.is_none() {
            return Err(VpnError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            });
        }

        let profile = self.profiles.remove(profile_id)?;
        self.sessions.forget(profile_id);
        Ok(profile)
    }

    pub async fn session(&self, profile_id: &str) -> protocol::Result<SessionSnapshot> {
        self.sessions
            .session(profile_id)
            .await?
            .ok_or_else(|| VpnError::ProfileNotFound {
                profile_id: profile_id.to_string(),
            })
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.sessions().await
    }

    // ------------------------------------------------------------------
    // IPC
    // ------------------------------------------------------------------

    /// Accepts IPC connections until shutdown is requested.
    pub async fn serve(self: Arc<Self>, server: IpcServer) {
        info!(path = %server.path().display(), "Listening for IPC connections");
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle_connection(conn).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
                },
            }
        }
        debug!("IPC server stopped");
    }

    async fn handle_connection(&self, mut conn: IpcConnection) {
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    let response = IpcResponse::from(VpnError::Io(format!("malformed request: {}", e)));
                    if conn.send_response(&response).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "IPC connection closed");
                    break;
                }
            };

            if request == IpcRequest::Subscribe {
                self.stream_events(conn).await;
                return;
            }

            let response = self.handle_request(request).await;
            if let Err(e) = conn.send_response(&response).await {
                debug!(error = %e, "Failed to send IPC response");
                break;
            }
        }
    }

    /// Executes one request.
    pub async fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: self.state().await == OrchestratorState::Running,
                uptime_secs: self.uptime_secs(),
                profile_count: self.profiles.len().unwrap_or(0),
                active_sessions: self.sessions.active_count().await,
                subscriber_count: self.publisher.subscriber_count(),
                pending_credentials: self.sessions.pending_credentials(),
            },
            IpcRequest::Stop => {
                info!("Shutdown requested over IPC");
                self.shutdown_token.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ImportProfile { path } => respond(self.import_profile(&path), |profile| {
                IpcResponse::ProfileImported { profile }
            }),
            IpcRequest::ListProfiles => {
                respond(self.list_profiles(), |profiles| IpcResponse::Profiles { profiles })
            }
            IpcRequest::RemoveProfile { profile_id } => {
                respond(self.remove_profile(&profile_id).await, |profile| {
                    IpcResponse::ProfileRemoved {
                        profile_id: profile.id,
                    }
                })
            }
            IpcRequest::Connect { profile_id } => {
                respond(self.connect(&profile_id).await, |session| {
                    IpcResponse::Session { session }
                })
            }
            IpcRequest::Disconnect { profile_id } => {
                respond(self.disconnect(&profile_id).await, |session| {
                    IpcResponse::Session { session }
                })
            }
            IpcRequest::RespondCredential(answer) => {
                let request_id = answer.request_id.clone();
                respond(
                    self.respond_credential(&answer.request_id, answer.value),
                    |()| IpcResponse::CredentialAccepted { request_id },
                )
            }
            IpcRequest::Session { profile_id } => {
                respond(self.session(&profile_id).await, |session| {
                    IpcResponse::Session { session }
                })
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.sessions().await,
            },
            IpcRequest::Subscribe => IpcResponse::from(VpnError::Io(
                "subscribe must be the first request on a connection".to_string(),
            )),
        }
    }

    /// Forwards status events to a subscribed connection until either side
    /// goes away.
    async fn stream_events(&self, mut conn: IpcConnection) {
        let mut subscription = self.publisher.subscribe();
        let id = subscription.id();
        debug!(subscriber_id = id, "IPC subscriber attached");

        if conn.send_response(&IpcResponse::Subscribed).await.is_ok() {
            loop {
                let event = tokio::select! {
                    _ = self.shutdown_token.cancelled() => break,
                    event = subscription.recv() => event,
                    request = conn.read_request() => match request {
                        // Subscribed connections only listen.
                        Ok(Some(_)) => continue,
                        _ => break,
                    },
                };
                let Some(event) = event else { break };
                if conn.send_response(&IpcResponse::Event { event }).await.is_err() {
                    break;
                }
            }
        }

        self.publisher.unsubscribe(id);
        debug!(subscriber_id = id, "IPC subscriber detached");
    }
}

fn respond<T>(result: protocol::Result<T>, ok: impl FnOnce(T) -> IpcResponse) -> IpcResponse {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            debug!(kind = %e.kind(), error = %e, "Request failed");
            IpcResponse::from(e)
        }
    }
}
