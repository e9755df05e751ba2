//! IPC client used by the CLI to talk to a running daemon.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{CredentialResponse, Profile, SessionSnapshot, StatusEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Timeout for requests that wait on a VPN client to exit.
const SETTLE_TIMEOUT_SECS: u64 = 30;

type Reader = BufReader<tokio::io::ReadHalf<UnixStream>>;
type Writer = tokio::io::WriteHalf<UnixStream>;

/// A request/response client for the daemon socket.
pub struct IpcClient {
    reader: Reader,
    writer: Writer,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom timeout, which also applies to each request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let timeout = self.timeout;
        self.send_within(request, timeout).await
    }

    async fn send_within(
        &mut self,
        request: IpcRequest,
        timeout: Duration,
    ) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
    }

    async fn exchange(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        write_request(&mut self.writer, &request).await?;
        read_response(&mut self.reader)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed connection").into())
    }

    fn settle_timeout(&self) -> Duration {
        self.timeout.max(Duration::from_secs(SETTLE_TIMEOUT_SECS))
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Daemon status; the response is always [`IpcResponse::Status`].
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        match self.send(IpcRequest::Status).await? {
            status @ IpcResponse::Status { .. } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to disconnect everything and exit.
    pub async fn stop(&mut self) -> Result<(), IpcError> {
        match self.send(IpcRequest::Stop).await? {
            IpcResponse::Stopping => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn import_profile(&mut self, path: &Path) -> Result<Profile, IpcError> {
        let request = IpcRequest::ImportProfile {
            path: path.to_path_buf(),
        };
        match self.send(request).await? {
            IpcResponse::ProfileImported { profile } => Ok(profile),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_profiles(&mut self) -> Result<Vec<Profile>, IpcError> {
        match self.send(IpcRequest::ListProfiles).await? {
            IpcResponse::Profiles { profiles } => Ok(profiles),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove_profile(&mut self, profile_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::RemoveProfile {
            profile_id: profile_id.to_string(),
        };
        let timeout = self.settle_timeout();
        match self.send_within(request, timeout).await? {
            IpcResponse::ProfileRemoved { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Start the session for a profile.
    pub async fn connect_session(&mut self, profile_id: &str) -> Result<SessionSnapshot, IpcError> {
        let request = IpcRequest::Connect {
            profile_id: profile_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the session for a profile; returns once it has settled.
    pub async fn disconnect_session(
        &mut self,
        profile_id: &str,
    ) -> Result<SessionSnapshot, IpcError> {
        let request = IpcRequest::Disconnect {
            profile_id: profile_id.to_string(),
        };
        let timeout = self.settle_timeout();
        match self.send_within(request, timeout).await? {
            IpcResponse::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn respond_credential(
        &mut self,
        request_id: &str,
        value: String,
    ) -> Result<(), IpcError> {
        let request = IpcRequest::RespondCredential(CredentialResponse {
            request_id: request_id.to_string(),
            value,
        });
        match self.send(request).await? {
            IpcResponse::CredentialAccepted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn session(&mut self, profile_id: &str) -> Result<SessionSnapshot, IpcError> {
        let request = IpcRequest::Session {
            profile_id: profile_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSnapshot>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Turn this connection into a status event stream.
    pub async fn subscribe(mut self) -> Result<EventStream, IpcError> {
        match self.send(IpcRequest::Subscribe).await? {
            IpcResponse::Subscribed => Ok(EventStream {
                reader: self.reader,
                _writer: self.writer,
            }),
            other => Err(unexpected(other)),
        }
    }
}

/// Status events pushed by the daemon after a subscribe.
pub struct EventStream {
    reader: Reader,
    // Dropping the write half would look like a hang-up to the daemon.
    _writer: Writer,
}

impl EventStream {
    /// Next event, or `None` when the daemon closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<StatusEvent>, IpcError> {
        match read_response(&mut self.reader).await? {
            None => Ok(None),
            Some(IpcResponse::Event { event }) => Ok(Some(event)),
            Some(other) => Err(unexpected(other)),
        }
    }
}

async fn write_request(writer: &mut Writer, request: &IpcRequest) -> Result<(), IpcError> {
    let mut json = serde_json::to_string(request)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_response(reader: &mut Reader) -> Result<Option<IpcResponse>, IpcError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim())?))
}

/// Maps an error response to [`IpcError::Daemon`] and anything else to
/// [`IpcError::UnexpectedResponse`].
fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { kind, message } => IpcError::Daemon { kind, message },
        other => IpcError::UnexpectedResponse(format!("{:?}", other)),
    }
}
