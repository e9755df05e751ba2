//! Credential prompts raised by running sessions.
//!
//! When the client asks for a secret, the session supervisor issues a
//! [`CredentialRequest`] through the [`CredentialBroker`] and waits for an
//! answer from whoever is observing the event stream. Requests expire after
//! the configured timeout; answering an unknown or expired request fails.

use std::time::Duration;

use dashmap::DashMap;
use protocol::{now_ms, CredentialRequest, CredentialType, ProfileId, RequestId};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a credential wait ended.
#[derive(PartialEq, Eq)]
pub enum CredentialOutcome {
    /// A value was supplied in time.
    Provided(String),
    /// The deadline passed.
    TimedOut,
    /// The wait was aborted (disconnect or process exit).
    Cancelled,
}

impl std::fmt::Debug for CredentialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialOutcome::Provided(_) => f.write_str("Provided(<redacted>)"),
            CredentialOutcome::TimedOut => f.write_str("TimedOut"),
            CredentialOutcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// An issued request and the receiving end of its answer.
pub struct PendingCredential {
    pub request: CredentialRequest,
    rx: oneshot::Receiver<String>,
}

struct Waiter {
    profile_id: ProfileId,
    tx: oneshot::Sender<String>,
}

/// Matches credential answers to outstanding requests.
pub struct CredentialBroker {
    pending: DashMap<RequestId, Waiter>,
    timeout: Duration,
}

impl CredentialBroker {
    /// Creates a broker whose requests expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// The configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a new request for `profile_id`.
    ///
    /// The caller publishes the returned request and then calls
    /// [`CredentialBroker::wait`].
    pub fn issue(&self, profile_id: &str, credential_type: CredentialType) -> PendingCredential {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let request = CredentialRequest {
            request_id: request_id.clone(),
            profile_id: profile_id.to_string(),
            credential_type,
            deadline: now_ms() + self.timeout.as_millis() as u64,
        };

        self.pending.insert(
            request_id.clone(),
            Waiter {
                profile_id: profile_id.to_string(),
                tx,
            },
        );

        tracing::info!(
            profile_id = %profile_id,
            request_id = %request_id,
            credential = %credential_type,
            "Credential requested"
        );
        PendingCredential { request, rx }
    }

    /// Waits for the answer to `pending` until the timeout elapses or
    /// `cancel` fires. The request is forgotten on every outcome.
    pub async fn wait(
        &self,
        pending: PendingCredential,
        cancel: &CancellationToken,
    ) -> CredentialOutcome {
        let PendingCredential { request, rx } = pending;

        let outcome = tokio::select! {
            answer = rx => match answer {
                Ok(value) => CredentialOutcome::Provided(value),
                Err(_) => CredentialOutcome::Cancelled,
            },
            _ = tokio::time::sleep(self.timeout) => CredentialOutcome::TimedOut,
            _ = cancel.cancelled() => CredentialOutcome::Cancelled,
        };

        self.pending.remove(&request.request_id);
        match &outcome {
            CredentialOutcome::Provided(_) => tracing::debug!(
                request_id = %request.request_id,
                "Credential received"
            ),
            CredentialOutcome::TimedOut => tracing::warn!(
                profile_id = %request.profile_id,
                request_id = %request.request_id,
                timeout_secs = self.timeout.as_secs(),
                "Credential request timed out"
            ),
            CredentialOutcome::Cancelled => tracing::debug!(
                request_id = %request.request_id,
                "Credential request cancelled"
            ),
        }
        outcome
    }

    /// Answers an outstanding request.
    ///
    /// Returns false if the request is unknown or already expired.
    pub fn respond(&self, request_id: &str, value: String) -> bool {
        let Some((_, waiter)) = self.pending.remove(request_id) else {
            tracing::debug!(request_id = %request_id, "Answer for unknown credential request");
            return false;
        };
        let delivered = waiter.tx.send(value).is_ok();
        if delivered {
            tracing::info!(
                profile_id = %waiter.profile_id,
                request_id = %request_id,
                "Credential answered"
            );
        }
        delivered
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_timely_response() {
        let broker = Arc::new(CredentialBroker::new(Duration::from_secs(5)));
        let pending = broker.issue("office", CredentialType::Password);
        let request_id = pending.request.request_id.clone();
        assert_eq!(pending.request.profile_id, "office");
        assert_eq!(broker.pending_count(), 1);

        let responder = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(responder.respond(&request_id, "hunter2".to_string()));
        });

        let outcome = broker.wait(pending, &CancellationToken::new()).await;
        assert_eq!(outcome, CredentialOutcome::Provided("hunter2".to_string()));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let broker = CredentialBroker::new(Duration::from_millis(50));
        let pending = broker.issue("office", CredentialType::Username);
        let request_id = pending.request.request_id.clone();

        let outcome = broker.wait(pending, &CancellationToken::new()).await;
        assert_eq!(outcome, CredentialOutcome::TimedOut);

        // Expired requests can no longer be answered.
        assert!(!broker.respond(&request_id, "late".to_string()));
    }

    #[tokio::test]
    async fn test_cancel() {
        let broker = CredentialBroker::new(Duration::from_secs(60));
        let pending = broker.issue("office", CredentialType::Challenge);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(broker.wait(pending, &cancel).await, CredentialOutcome::Cancelled);
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn test_respond_unknown_request() {
        let broker = CredentialBroker::new(Duration::from_secs(1));
        assert!(!broker.respond("missing", "x".to_string()));
    }

    #[test]
    fn test_deadline_is_in_the_future() {
        let broker = CredentialBroker::new(Duration::from_secs(120));
        let before = now_ms();
        let pending = broker.issue("office", CredentialType::Password);
        assert!(pending.request.deadline >= before + 120_000);
    }

    #[test]
    fn test_pending_requests_are_tracked() {
        let broker = CredentialBroker::new(Duration::from_secs(1));
        let _a = broker.issue("a", CredentialType::Username);
        let _b = broker.issue("a", CredentialType::Password);
        let c = broker.issue("b", CredentialType::Password);
        assert_eq!(broker.pending_count(), 3);

        assert!(broker.respond(&c.request.request_id, "x".to_string()));
        assert_eq!(broker.pending_count(), 2);
    }

    #[test]
    fn test_outcome_debug_redacts_value() {
        let debug = format!("{:?}", CredentialOutcome::Provided("hunter2".to_string()));
        assert!(!debug.contains("hunter2"));
    }
}
