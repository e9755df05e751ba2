//! Connection session controller.
//!
//! The controller owns one session slot per profile and is the only code
//! that changes a session's state. `connect` spawns the VPN client and hands
//! its output to a supervisor task, which applies classified events to the
//! state machine:
//!
//! ```text
//!  Idle/Failed --connect--> Connecting --ConnectedMarker--> Connected
//!  Connecting/Connected --FatalError/ProcessExit--> Failed
//!  Connecting/Connected --disconnect--> Disconnecting --ProcessExit--> Idle
//! ```
//!
//! Every transition happens under the slot's lock and is published while
//! the lock is held, so observers see transitions in the order they were
//! applied.
//!
//! A client that was told to stop after a failure may outlive the `Failed`
//! transition. Its exit token stays in the slot until it is reaped, and a new
//! `connect` waits for it rather than running two clients side by side.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{
    now_ms, ErrorKind, FailureReason, LogEvent, LogKind, ProfileId, SessionSnapshot,
    SessionState, StatusEvent, TunnelAddresses, VpnError,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::classifier::Classifier;
use super::credentials::{CredentialBroker, CredentialOutcome, PendingCredential};
use super::monitor::{LogMonitor, MonitorEvent};
use super::process::{ChildInput, ProcessControl, ProcessLauncher, SpawnedProcess};
use crate::config::Config;
use crate::profiles::{ProfileError, ProfileStore};
use crate::publisher::StatusPublisher;

/// Errors returned synchronously by session commands.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("profile not found: {0}")]
    ProfileNotFound(ProfileId),

    #[error("session busy: {profile_id} is {state}")]
    Busy {
        profile_id: ProfileId,
        state: SessionState,
    },

    #[error("failed to spawn VPN client: {0}")]
    SpawnFailed(String),

    #[error("credential request not found: {0}")]
    CredentialRequestNotFound(String),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl SessionError {
    /// Returns the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ProfileNotFound(_) => ErrorKind::ProfileNotFound,
            SessionError::Busy { .. } => ErrorKind::SessionBusy,
            SessionError::SpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            SessionError::CredentialRequestNotFound(_) => ErrorKind::CredentialRequestNotFound,
            SessionError::Profile(e) => e.kind(),
        }
    }
}

impl From<SessionError> for VpnError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ProfileNotFound(profile_id) => VpnError::ProfileNotFound { profile_id },
            SessionError::Busy { profile_id, .. } => VpnError::SessionBusy { profile_id },
            SessionError::SpawnFailed(message) => VpnError::ProcessSpawnFailed(message),
            SessionError::CredentialRequestNotFound(request_id) => {
                VpnError::CredentialRequestNotFound { request_id }
            }
            SessionError::Profile(e) => e.into(),
        }
    }
}

/// Timing used by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub disconnect_grace: Duration,
    /// Wait after SIGKILL before settling without an exit.
    pub kill_timeout: Duration,
    /// Lifetime of a credential request.
    pub credential_timeout: Duration,
    /// Silence after which a partial output line is emitted.
    pub prompt_flush: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            disconnect_grace: config.session.disconnect_grace(),
            kill_timeout: config.session.kill_timeout(),
            credential_timeout: config.session.credential_timeout(),
            prompt_flush: config.monitor.prompt_flush(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Mutable per-profile session record.
struct SessionSlot {
    profile_id: ProfileId,
    state: SessionState,
    /// Incremented on every spawn; supervisors of older attempts are ignored.
    attempt: u64,
    pid: Option<u32>,
    started_at: Option<u64>,
    last_event: Option<LogEvent>,
    failure_reason: Option<FailureReason>,
    /// Endpoints seen during the current attempt.
    tunnel: TunnelAddresses,
    control: Option<Arc<dyn ProcessControl>>,
    /// Cancelled once the current client has been reaped.
    exited: Option<CancellationToken>,
    /// Cancelled on disconnect or exit; aborts credential waits.
    cancel: CancellationToken,
    state_tx: watch::Sender<SessionState>,
}

impl SessionSlot {
    fn new(profile_id: &str) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            profile_id: profile_id.to_string(),
            state: SessionState::Idle,
            attempt: 0,
            pid: None,
            started_at: None,
            last_event: None,
            failure_reason: None,
            tunnel: TunnelAddresses::default(),
            control: None,
            exited: None,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    /// Exit token of a client that is still running.
    fn lingering_process(&self) -> Option<CancellationToken> {
        self.exited.clone().filter(|t| !t.is_cancelled())
    }

    /// Addresses as reported to observers: only while connected.
    fn reported_tunnel(&self) -> Option<TunnelAddresses> {
        if self.state == SessionState::Connected && !self.tunnel.is_empty() {
            Some(self.tunnel.clone())
        } else {
            None
        }
    }

    fn record_tunnel(&mut self, seen: TunnelAddresses) {
        if seen.remote_address.is_some() {
            self.tunnel.remote_address = seen.remote_address;
        }
        if seen.local_address.is_some() {
            self.tunnel.local_address = seen.local_address;
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            profile_id: self.profile_id.clone(),
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            last_event: self.last_event.clone(),
            failure_reason: self.failure_reason.clone(),
            tunnel: self.reported_tunnel(),
            attempt: self.attempt,
        }
    }

    /// Applies and publishes a state change. Must be called with the slot
    /// lock held.
    fn transition(
        &mut self,
        publisher: &StatusPublisher,
        state: SessionState,
        reason: Option<FailureReason>,
    ) {
        let from = self.state;
        self.state = state;
        self.failure_reason = if state == SessionState::Failed {
            reason
        } else {
            None
        };
        if !matches!(state, SessionState::Connecting | SessionState::Connected) {
            self.tunnel = TunnelAddresses::default();
        }
        self.state_tx.send_replace(state);

        match &self.failure_reason {
            Some(reason) => tracing::warn!(
                profile_id = %self.profile_id,
                attempt = self.attempt,
                from = %from,
                to = %state,
                reason = %reason,
                "Session state changed"
            ),
            None => tracing::info!(
                profile_id = %self.profile_id,
                attempt = self.attempt,
                from = %from,
                to = %state,
                "Session state changed"
            ),
        }

        publisher.publish(StatusEvent::SessionStateChanged {
            profile_id: self.profile_id.clone(),
            state,
            failure_reason: self.failure_reason.clone(),
            tunnel: self.reported_tunnel(),
        });
    }
}

type SlotRef = Arc<Mutex<SessionSlot>>;

/// A disconnect that sent SIGTERM and now waits for the exit.
struct PendingDisconnect {
    profile_id: ProfileId,
    slot: SlotRef,
    state_rx: watch::Receiver<SessionState>,
    /// Set when this call initiated the disconnect and owns escalation.
    escalate: Option<(u64, Option<Arc<dyn ProcessControl>>)>,
}

/// Drives VPN client sessions, one per profile.
pub struct SessionController {
    profiles: Arc<ProfileStore>,
    launcher: Arc<dyn ProcessLauncher>,
    classifier: Arc<Classifier>,
    broker: Arc<CredentialBroker>,
    publisher: Arc<StatusPublisher>,
    settings: SessionSettings,
    sessions: DashMap<ProfileId, SlotRef>,
}

impl SessionController {
    pub fn new(
        profiles: Arc<ProfileStore>,
        launcher: Arc<dyn ProcessLauncher>,
        classifier: Arc<Classifier>,
        publisher: Arc<StatusPublisher>,
        settings: SessionSettings,
    ) -> Self {
        let broker = Arc::new(CredentialBroker::new(settings.credential_timeout));
        Self {
            profiles,
            launcher,
            classifier,
            broker,
            publisher,
            settings,
            sessions: DashMap::new(),
        }
    }

    fn slot(&self, profile_id: &str) -> SlotRef {
        self.sessions
            .entry(profile_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new(profile_id))))
            .value()
            .clone()
    }

    fn existing_slot(&self, profile_id: &str) -> Option<SlotRef> {
        self.sessions.get(profile_id).map(|s| Arc::clone(s.value()))
    }

    /// Starts the VPN client for `profile_id`.
    ///
    /// Allowed from `Idle` or `Failed`. If the client of the previous attempt
    /// is still shutting down, waits for it for up to the grace period plus
    /// the kill timeout. A spawn failure leaves the session untouched and
    /// publishes nothing.
    pub async fn connect(&self, profile_id: &str) -> Result<SessionSnapshot, SessionError> {
        let profile = self
            .profiles
            .get(profile_id)?
            .ok_or_else(|| SessionError::ProfileNotFound(profile_id.to_string()))?;

        let slot = self.slot(profile_id);
        let mut guard = slot.lock().await;

        if guard.state.can_connect() {
            if let Some(exited) = guard.lingering_process() {
                drop(guard);
                tracing::debug!(profile_id = %profile_id, "Waiting for previous VPN client to exit");
                let limit = self.settings.disconnect_grace + self.settings.kill_timeout;
                let _ = tokio::time::timeout(limit, exited.cancelled()).await;
                guard = slot.lock().await;
            }
        }

        if !guard.state.can_connect() || guard.lingering_process().is_some() {
            tracing::debug!(profile_id = %profile_id, state = %guard.state, "Connect rejected");
            return Err(SessionError::Busy {
                profile_id: profile_id.to_string(),
                state: guard.state,
            });
        }

        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
            exited,
            control,
        } = self.launcher.launch(&profile.config_path).map_err(|e| {
            tracing::error!(
                profile_id = %profile_id,
                config = %profile.config_path.display(),
                error = %e,
                "Failed to spawn VPN client"
            );
            SessionError::SpawnFailed(e.to_string())
        })?;

        guard.attempt += 1;
        guard.pid = pid;
        guard.started_at = Some(now_ms());
        guard.last_event = None;
        guard.tunnel = TunnelAddresses::default();
        guard.control = Some(Arc::clone(&control));
        guard.exited = Some(exited.clone());
        guard.cancel = CancellationToken::new();
        guard.transition(&self.publisher, SessionState::Connecting, None);

        let monitor = LogMonitor::attach(
            stdout,
            stderr,
            exit,
            Arc::clone(&self.classifier),
            self.settings.prompt_flush,
        );
        let supervisor = Supervisor {
            profile_id: profile_id.to_string(),
            attempt: guard.attempt,
            slot: Arc::clone(&slot),
            publisher: Arc::clone(&self.publisher),
            broker: Arc::clone(&self.broker),
            control,
            cancel: guard.cancel.clone(),
            exited,
            stdin,
            kill_after: self.settings.disconnect_grace,
        };
        tokio::spawn(supervisor.run(monitor));

        tracing::info!(
            profile_id = %profile_id,
            name = %profile.display_name,
            pid = ?pid,
            attempt = guard.attempt,
            "Session started"
        );
        Ok(guard.snapshot())
    }

    /// Stops the session for `profile_id` and waits until it has settled.
    ///
    /// A session that is not running is left alone. Sends SIGTERM, escalates
    /// to SIGKILL after the grace period, and settles to `Idle` at the latest
    /// once the kill timeout has passed as well.
    pub async fn disconnect(&self, profile_id: &str) -> Result<SessionSnapshot, SessionError> {
        let Some(slot) = self.existing_slot(profile_id) else {
            if self.profiles.get(profile_id)?.is_none() {
                return Err(SessionError::ProfileNotFound(profile_id.to_string()));
            }
            return Ok(SessionSlot::new(profile_id).snapshot());
        };

        if let Some(pending) = self.begin_disconnect(profile_id, slot.clone()).await {
            self.finish_disconnect(pending).await;
        }

        let snapshot = slot.lock().await.snapshot();
        Ok(snapshot)
    }

    async fn begin_disconnect(&self, profile_id: &str, slot: SlotRef) -> Option<PendingDisconnect> {
        let mut guard = slot.lock().await;
        let escalate = match guard.state {
            SessionState::Idle | SessionState::Failed => {
                tracing::debug!(profile_id = %profile_id, state = %guard.state, "Nothing to disconnect");
                return None;
            }
            SessionState::Disconnecting => None,
            SessionState::Connecting | SessionState::Connected => {
                guard.transition(&self.publisher, SessionState::Disconnecting, None);
                guard.cancel.cancel();
                let control = guard.control.clone();
                if let Some(control) = &control {
                    if let Err(e) = control.terminate() {
                        tracing::warn!(profile_id = %profile_id, error = %e, "Failed to send SIGTERM");
                    }
                }
                Some((guard.attempt, control))
            }
        };
        let state_rx = guard.state_tx.subscribe();
        drop(guard);

        Some(PendingDisconnect {
            profile_id: profile_id.to_string(),
            slot,
            state_rx,
            escalate,
        })
    }

    async fn finish_disconnect(&self, pending: PendingDisconnect) {
        let PendingDisconnect {
            profile_id,
            slot,
            mut state_rx,
            escalate,
        } = pending;
        let grace = self.settings.disconnect_grace;
        let kill_timeout = self.settings.kill_timeout;

        let Some((attempt, control)) = escalate else {
            // Another caller owns escalation; wait for the same settlement.
            let limit = grace + kill_timeout + Duration::from_secs(1);
            if tokio::time::timeout(limit, settled(&mut state_rx)).await.is_err() {
                tracing::warn!(profile_id = %profile_id, "Timed out waiting for disconnect");
            }
            return;
        };

        if tokio::time::timeout(grace, settled(&mut state_rx)).await.is_ok() {
            return;
        }

        tracing::warn!(
            profile_id = %profile_id,
            grace_secs = grace.as_secs(),
            "VPN client ignored SIGTERM, sending SIGKILL"
        );
        if let Some(control) = &control {
            if let Err(e) = control.kill() {
                tracing::warn!(profile_id = %profile_id, error = %e, "Failed to send SIGKILL");
            }
        }

        if tokio::time::timeout(kill_timeout, settled(&mut state_rx)).await.is_ok() {
            return;
        }

        let mut guard = slot.lock().await;
        if guard.attempt == attempt && guard.state == SessionState::Disconnecting {
            tracing::error!(
                profile_id = %profile_id,
                pid = ?guard.pid,
                "VPN client did not exit after SIGKILL, settling session"
            );
            guard.pid = None;
            guard.control = None;
            guard.transition(&self.publisher, SessionState::Idle, None);
        }
    }

    /// Answers an outstanding credential request.
    pub fn respond_credential(&self, request_id: &str, value: String) -> Result<(), SessionError> {
        if self.broker.respond(request_id, value) {
            Ok(())
        } else {
            Err(SessionError::CredentialRequestNotFound(request_id.to_string()))
        }
    }

    /// Number of credential requests awaiting an answer.
    pub fn pending_credentials(&self) -> usize {
        self.broker.pending_count()
    }

    /// Snapshot of one session.
    ///
    /// Known profiles that never connected report `Idle`; unknown profiles
    /// without a session return `None`.
    pub async fn session(&self, profile_id: &str) -> Result<Option<SessionSnapshot>, SessionError> {
        if let Some(slot) = self.existing_slot(profile_id) {
            let snapshot = slot.lock().await.snapshot();
            return Ok(Some(snapshot));
        }
        Ok(self
            .profiles
            .get(profile_id)?
            .map(|p| SessionSlot::new(&p.id).snapshot()))
    }

    /// Snapshots of every session that has been started at least once.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<SlotRef> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(slot.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        snapshots
    }

    /// Number of sessions with a live client.
    pub async fn active_count(&self) -> usize {
        self.sessions()
            .await
            .iter()
            .filter(|s| s.state.is_active())
            .count()
    }

    /// Drops the slot of an inactive session, e.g. after its profile was
    /// removed. Active sessions, and failed ones whose client has not exited
    /// yet, are left alone.
    pub fn forget(&self, profile_id: &str) -> bool {
        self.sessions
            .remove_if(profile_id, |_, slot| match slot.try_lock() {
                Ok(guard) => !guard.state.is_active() && guard.lingering_process().is_none(),
                Err(_) => false,
            })
            .is_some()
    }

    /// Disconnects every running session.
    pub async fn shutdown(&self) {
        let slots: Vec<(ProfileId, SlotRef)> = self
            .sessions
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();

        // Signal everything first so the waits overlap.
        let mut pending = Vec::new();
        for (profile_id, slot) in slots {
            if let Some(p) = self.begin_disconnect(&profile_id, slot).await {
                pending.push(p);
            }
        }
        let count = pending.len();
        for p in pending {
            self.finish_disconnect(p).await;
        }
        if count > 0 {
            tracing::info!(sessions = count, "Stopped all sessions");
        }
    }
}

async fn settled(rx: &mut watch::Receiver<SessionState>) {
    let _ = rx.wait_for(|s| *s != SessionState::Disconnecting).await;
}

/// Per-attempt task applying monitor events to the session.
struct Supervisor {
    profile_id: ProfileId,
    attempt: u64,
    slot: SlotRef,
    publisher: Arc<StatusPublisher>,
    broker: Arc<CredentialBroker>,
    control: Arc<dyn ProcessControl>,
    cancel: CancellationToken,
    exited: CancellationToken,
    stdin: ChildInput,
    kill_after: Duration,
}

impl Supervisor {
    async fn run(mut self, mut monitor: LogMonitor) {
        // Process exit also aborts credential waits.
        let cancel = self.cancel.clone();
        let exited = self.exited.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = exited.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        while let Some(MonitorEvent {
            event,
            failure,
            tunnel,
        }) = monitor.next().await
        {
            let mut slot = self.slot.lock().await;
            if slot.attempt != self.attempt {
                // Superseded; keep draining so the child is reaped.
                continue;
            }

            if matches!(slot.state, SessionState::Connecting | SessionState::Connected) {
                slot.record_tunnel(tunnel);
            }
            slot.last_event = Some(event.clone());
            self.publisher.publish(StatusEvent::LogLineReceived {
                profile_id: self.profile_id.clone(),
                event: event.clone(),
            });

            match event.kind {
                LogKind::Info => {}
                LogKind::ConnectedMarker => {
                    if slot.state == SessionState::Connecting {
                        slot.transition(&self.publisher, SessionState::Connected, None);
                    }
                }
                LogKind::FatalError(detail) => {
                    if matches!(slot.state, SessionState::Connecting | SessionState::Connected) {
                        let kind = failure.unwrap_or(ErrorKind::UnexpectedTermination);
                        slot.transition(
                            &self.publisher,
                            SessionState::Failed,
                            Some(FailureReason::new(kind, detail)),
                        );
                        drop(slot);
                        self.stop_process();
                    }
                }
                LogKind::AuthRequest(credential_type) => {
                    if matches!(slot.state, SessionState::Connecting | SessionState::Connected) {
                        let pending = self.broker.issue(&self.profile_id, credential_type);
                        self.publisher
                            .publish(StatusEvent::CredentialRequested(pending.request.clone()));
                        drop(slot);
                        self.answer(pending).await;
                    }
                }
                LogKind::ProcessExit(code) => {
                    let reason = |message: String| {
                        Some(FailureReason::new(ErrorKind::UnexpectedTermination, message))
                    };
                    match slot.state {
                        SessionState::Connecting => slot.transition(
                            &self.publisher,
                            SessionState::Failed,
                            reason(format!("{} before the tunnel came up", describe_exit(code))),
                        ),
                        SessionState::Connected => slot.transition(
                            &self.publisher,
                            SessionState::Failed,
                            reason(format!("{} while connected", describe_exit(code))),
                        ),
                        SessionState::Disconnecting => {
                            slot.transition(&self.publisher, SessionState::Idle, None)
                        }
                        SessionState::Idle | SessionState::Failed => {}
                    }
                    slot.pid = None;
                    slot.control = None;
                    slot.exited = None;
                }
            }
        }

        self.cancel.cancel();
        tracing::debug!(
            profile_id = %self.profile_id,
            attempt = self.attempt,
            "Session supervisor finished"
        );
    }

    /// Waits for the answer to a credential prompt and forwards it.
    async fn answer(&mut self, pending: PendingCredential) {
        let credential_type = pending.request.credential_type;
        match self.broker.wait(pending, &self.cancel).await {
            CredentialOutcome::Provided(value) => {
                if let Err(e) = self.write_secret(&value).await {
                    tracing::warn!(
                        profile_id = %self.profile_id,
                        error = %e,
                        "Failed to forward credential to VPN client"
                    );
                    self.fail(
                        ErrorKind::UnexpectedTermination,
                        format!("failed to forward credential: {}", e),
                    )
                    .await;
                }
            }
            CredentialOutcome::TimedOut => {
                let message = format!(
                    "no {} supplied within {}s",
                    credential_type,
                    self.broker.timeout().as_secs()
                );
                self.fail(ErrorKind::CredentialTimeout, message).await;
            }
            CredentialOutcome::Cancelled => {}
        }
    }

    /// Fails a running session of this attempt and stops its client.
    async fn fail(&self, kind: ErrorKind, message: String) {
        let mut slot = self.slot.lock().await;
        if slot.attempt != self.attempt
            || !matches!(slot.state, SessionState::Connecting | SessionState::Connected)
        {
            return;
        }
        slot.transition(
            &self.publisher,
            SessionState::Failed,
            Some(FailureReason::new(kind, message)),
        );
        drop(slot);
        self.stop_process();
    }

    async fn write_secret(&mut self, value: &str) -> std::io::Result<()> {
        self.stdin.write_all(value.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    /// Terminates the client after a failure, escalating to SIGKILL if it
    /// is still running after the grace period.
    fn stop_process(&self) {
        self.cancel.cancel();
        if let Err(e) = self.control.terminate() {
            tracing::warn!(profile_id = %self.profile_id, error = %e, "Failed to send SIGTERM");
        }

        let control = Arc::clone(&self.control);
        let exited = self.exited.clone();
        let kill_after = self.kill_after;
        let profile_id = self.profile_id.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(kill_after, exited.cancelled()).await.is_err() {
                tracing::warn!(profile_id = %profile_id, "VPN client ignored SIGTERM, sending SIGKILL");
                if let Err(e) = control.kill() {
                    tracing::warn!(profile_id = %profile_id, error = %e, "Failed to send SIGKILL");
                }
            }
        });
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("VPN client exited with code {}", code),
        None => "VPN client was killed by a signal".to_string(),
    }
}
