//! Output monitoring for the VPN client process.
//!
//! A [`LogMonitor`] attaches to the child's stdout and stderr at spawn time.
//! One reader task per stream frames the bytes into lines and pushes them
//! into an unbounded channel, so reading never waits on the consumer. The
//! monitor classifies the lines in arrival order, numbers them, and ends
//! with exactly one `ProcessExit` event once the streams are closed and the
//! process has been reaped.

use std::sync::Arc;
use std::time::Duration;

use protocol::{now_ms, ErrorKind, LogEvent, LogKind, TunnelAddresses};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use super::classifier::Classifier;

/// Buffer size for reading from the child's pipes.
const READ_BUFFER_SIZE: usize = 4096;

/// How long buffered lines are still drained after the process exited while
/// its pipes stay open (e.g. held by a grandchild).
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// A framed line before classification.
#[derive(Debug)]
struct RawLine {
    text: String,
    timestamp: u64,
}

/// A classified event together with the failure it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    /// The event as published.
    pub event: LogEvent,
    /// Failure kind for fatal lines.
    pub failure: Option<ErrorKind>,
    /// Tunnel endpoints the line revealed.
    pub tunnel: TunnelAddresses,
}

/// Lazily produces the ordered, finite sequence of log events of one
/// process run.
pub struct LogMonitor {
    lines: mpsc::UnboundedReceiver<RawLine>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    exit_code: Option<Option<i32>>,
    classifier: Arc<Classifier>,
    seq: u64,
    finished: bool,
}

impl LogMonitor {
    /// Starts reader tasks on both streams.
    ///
    /// `exit` resolves with the exit code once the process has been reaped
    /// (`None` when it was killed by a signal). A partial line that sees no
    /// new bytes for `prompt_flush` is emitted as a line of its own.
    pub fn attach<O, E>(
        stdout: O,
        stderr: E,
        exit: oneshot::Receiver<Option<i32>>,
        classifier: Arc<Classifier>,
        prompt_flush: Duration,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_lines(stdout, OutputStream::Stdout, tx.clone(), prompt_flush));
        tokio::spawn(read_lines(stderr, OutputStream::Stderr, tx, prompt_flush));

        Self {
            lines: rx,
            exit: Some(exit),
            exit_code: None,
            classifier,
            seq: 0,
            finished: false,
        }
    }

    /// Returns the next event, or `None` after `ProcessExit` was returned.
    pub async fn next(&mut self) -> Option<MonitorEvent> {
        if self.finished {
            return None;
        }

        loop {
            if self.exit_code.is_some() {
                // The process is gone; take what is buffered, then stop.
                return match tokio::time::timeout(EXIT_DRAIN_GRACE, self.lines.recv()).await {
                    Ok(Some(line)) => Some(self.classify(line)),
                    _ => Some(self.finish()),
                };
            }

            let Some(exit) = self.exit.as_mut() else {
                return Some(self.finish());
            };

            tokio::select! {
                biased;
                line = self.lines.recv() => match line {
                    Some(line) => return Some(self.classify(line)),
                    None => {
                        // Both streams closed; wait for the reaper.
                        let code = match self.exit.take() {
                            Some(exit) => exit.await.unwrap_or(None),
                            None => None,
                        };
                        self.exit_code = Some(code);
                        return Some(self.finish());
                    }
                },
                code = exit => {
                    self.exit = None;
                    self.exit_code = Some(code.unwrap_or(None));
                }
            }
        }
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    fn classify(&mut self, line: RawLine) -> MonitorEvent {
        let classified = self.classifier.classify(&line.text);
        let event = LogEvent {
            seq: self.next_seq(),
            timestamp: line.timestamp,
            raw_line: line.text,
            kind: classified.kind,
        };
        MonitorEvent {
            event,
            failure: classified.failure,
            tunnel: classified.tunnel,
        }
    }

    fn finish(&mut self) -> MonitorEvent {
        self.finished = true;
        let code = self.exit_code.flatten();
        let raw_line = match code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by signal".to_string(),
        };
        MonitorEvent {
            event: LogEvent {
                seq: self.next_seq(),
                timestamp: now_ms(),
                raw_line,
                kind: LogKind::ProcessExit(code),
            },
            failure: None,
            tunnel: TunnelAddresses::default(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// Reads one stream until EOF, framing it into lines.
async fn read_lines<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<RawLine>,
    prompt_flush: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        let read = if pending.is_empty() {
            reader.read(&mut buffer).await
        } else {
            match tokio::time::timeout(prompt_flush, reader.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    // Quiet with a partial line: most likely a prompt.
                    let partial = std::mem::take(&mut pending);
                    if !emit(&tx, &partial) {
                        return;
                    }
                    continue;
                }
            }
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buffer[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    if !emit(&tx, &line[..line.len() - 1]) {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Failed to read client output");
                break;
            }
        }
    }

    if !pending.is_empty() {
        emit(&tx, &pending);
    }
    tracing::trace!(stream = %stream, "Client output stream closed");
}

/// Decodes and sends one line. Returns false once the monitor is gone.
fn emit(tx: &mpsc::UnboundedSender<RawLine>, bytes: &[u8]) -> bool {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = RawLine {
        text: String::from_utf8_lossy(bytes).into_owned(),
        timestamp: now_ms(),
    };
    tx.send(line).is_ok()
}
