//! Socket-to-process bridge.
//!
//! One task drives one bridge: it selects over the socket, the process's
//! stdout and stderr, process exit and the registry's cancellation token.
//! Decoded input waits in a local FIFO and moves one chunk at a time into a
//! bounded channel feeding a dedicated stdin writer task. No arm of the loop
//! awaits that channel. While the FIFO is non-empty the socket is not read,
//! and output keeps flowing regardless of whether the process reads stdin.
//!
//! Lifecycle: `Unattached → Spawning → Attached → (ProcessExited |
//! SocketClosed) → Terminated`. Rejected attaches and failed spawns go
//! straight to `Terminated`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

use crate::control::{ControlError, ControlMessage};
use crate::frame::{self, Direction, FrameDecoder, FrameError};
use crate::process::{self, ExitReport, Launcher, ProcessError};
use crate::session::{BridgeHandle, Credential, RegistryError, SessionRegistry};

/// Substring on stderr that triggers the stored credential.
const PASSWORD_MARKER: &[u8] = b"password";

/// Status code of the close frame sent when a bridge ends.
const CLOSE_NORMAL: u16 = 1000;

/// Whether the stored credential is sent on every password prompt or only
/// the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    #[default]
    EveryPrompt,
    Once,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Largest inbound frame payload accepted.
    pub max_frame_bytes: usize,
    /// Chunks queued for process stdin before socket reads pause.
    pub input_queue: usize,
    /// Read size for the socket and the process pipes.
    pub read_buffer: usize,
    pub credential_policy: CredentialPolicy,
    /// How long to keep forwarding output after the process exits.
    pub exit_drain: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: frame::DEFAULT_MAX_PAYLOAD,
            input_queue: 64,
            read_buffer: 8192,
            credential_policy: CredentialPolicy::default(),
            exit_drain: Duration::from_millis(200),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session already has an attached bridge: {0}")]
    AlreadyAttached(String),

    #[error("first message was not an attach request: {0}")]
    ExpectedAttach(#[from] ControlError),

    #[error("socket closed before attach")]
    ClosedBeforeAttach,

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for BridgeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) | RegistryError::InvalidParams(id) => Self::UnknownSession(id),
            RegistryError::BridgeActive(id) => Self::AlreadyAttached(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unattached,
    Spawning,
    Attached,
    ProcessExited,
    SocketClosed,
    Terminated,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid bridge transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: BridgeState,
    pub to: BridgeState,
}

impl BridgeState {
    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: BridgeState) -> Result<(), InvalidTransition> {
        use BridgeState::*;
        let allowed = matches!(
            (*self, next),
            (Unattached, Spawning)
                | (Unattached, Terminated)
                | (Spawning, Attached)
                | (Spawning, Terminated)
                | (Attached, ProcessExited)
                | (Attached, SocketClosed)
                | (ProcessExited, Terminated)
                | (SocketClosed, Terminated)
        );
        if !allowed {
            return Err(InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        self == BridgeState::Terminated
    }
}

/// How an attached bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    ProcessExited(ExitReport),
    SocketClosed,
    /// The session was removed from the registry.
    Cancelled,
}

/// What to do with a chunk of process stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrAction {
    /// Write this to process stdin; do not forward the chunk.
    Answer(Bytes),
    Forward,
}

fn contains_password_prompt(chunk: &[u8]) -> bool {
    chunk
        .windows(PASSWORD_MARKER.len())
        .any(|w| w.eq_ignore_ascii_case(PASSWORD_MARKER))
}

/// Decide whether a stderr chunk is answered with the stored credential.
pub fn classify_stderr(
    chunk: &[u8],
    credential: &Credential,
    policy: CredentialPolicy,
    already_sent: bool,
) -> StderrAction {
    if credential.is_empty() || !contains_password_prompt(chunk) {
        return StderrAction::Forward;
    }
    if policy == CredentialPolicy::Once && already_sent {
        return StderrAction::Forward;
    }
    let mut answer = Vec::with_capacity(credential.expose().len() + 1);
    answer.extend_from_slice(credential.expose().as_bytes());
    answer.push(b'\n');
    StderrAction::Answer(Bytes::from(answer))
}

/// Attaches sockets to processes. Cheap to clone; one per server.
#[derive(Clone)]
pub struct Bridge {
    registry: SessionRegistry,
    launcher: Arc<dyn Launcher>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(registry: SessionRegistry, launcher: Arc<dyn Launcher>, config: BridgeConfig) -> Self {
        Self {
            registry,
            launcher,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run a bridge over an upgraded socket until it ends.
    ///
    /// `leftover` holds bytes read past the handshake; they are decoded
    /// before anything else. The socket is closed on every path out.
    pub async fn run<S>(&self, mut socket: S, leftover: Bytes) -> Result<BridgeOutcome, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut state = BridgeState::Unattached;
        let mut decoder = FrameDecoder::with_max_payload(Direction::ClientToServer, self.config.max_frame_bytes);

        let mut pending = match self.await_attach(&mut socket, &mut decoder, leftover).await {
            Ok(messages) => messages,
            Err(err) => {
                finish(&mut state, BridgeState::Terminated);
                tracing::debug!(%err, "connection ended before attach");
                close_socket(&mut socket).await;
                return Err(err);
            }
        };
        let attach = pending.remove(0);
        let request = match ControlMessage::parse(&attach) {
            Ok(request) => request,
            Err(err) => {
                finish(&mut state, BridgeState::Terminated);
                tracing::debug!(?err, "rejecting connection without attach request");
                send_notice_and_close(&mut socket, "expected `SESSION <id>` as the first message\r\n").await;
                return Err(err.into());
            }
        };
        let session_id = request.session_id().to_string();

        let lease = match self.registry.acquire_bridge(&session_id) {
            Ok(lease) => lease,
            Err(err) => {
                finish(&mut state, BridgeState::Terminated);
                let err = BridgeError::from(err);
                tracing::info!(session = %session_id, %err, "attach rejected");
                send_notice_and_close(&mut socket, &format!("{err}\r\n")).await;
                return Err(err);
            }
        };
        let handle = lease.handle().clone();
        let session = lease.session().clone();

        finish(&mut state, BridgeState::Spawning);
        let mut process = match process::spawn(self.launcher.as_ref(), &session) {
            Ok(process) => process,
            Err(err) => {
                finish(&mut state, BridgeState::Terminated);
                tracing::error!(session = %session_id, %err, "failed to start bridge process");
                send_notice_and_close(&mut socket, &format!("\r\nfailed to start process: {err}\r\n")).await;
                return Err(err.into());
            }
        };
        if let Some(pid) = process.pid {
            handle.set_pid(pid);
        }
        if handle.is_cancelled() {
            // Removed while spawning.
            let _ = process.child.start_kill();
        }
        finish(&mut state, BridgeState::Attached);
        tracing::info!(session = %session_id, pid = ?process.pid, program = self.launcher.program(), "bridge attached");

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(self.config.input_queue.max(1));
        let writer = tokio::spawn(write_input(process.stdin, input_rx));

        let (mut sock_rd, sock_wr) = tokio::io::split(socket);
        let mut pump = Pump {
            sock_wr,
            // The rest of the batch the attach request arrived in.
            input: VecDeque::from(pending),
            input_open: true,
            credential: session.params.credential.clone(),
            policy: self.config.credential_policy,
            credential_sent: false,
            socket_open: true,
        };

        let cancel = handle.cancellation();
        let mut stdout = process.stdout;
        let mut stderr = process.stderr;
        let mut out_buf = vec![0u8; self.config.read_buffer];
        let mut err_buf = vec![0u8; self.config.read_buffer];
        let mut sock_buf = vec![0u8; self.config.read_buffer];
        let mut stdout_done = false;
        let mut stderr_done = false;

        let outcome = {
            let exited = process::wait_exit(&mut process.child, &handle);
            tokio::pin!(exited);
            loop {
                tokio::select! {
                    // Removal cancels before it kills, so cancellation wins.
                    biased;

                    _ = cancel.cancelled() => break BridgeOutcome::Cancelled,

                    status = &mut exited => {
                        let report = match status {
                            Ok(status) => ExitReport::from(status),
                            Err(err) => {
                                tracing::error!(session = %session_id, %err, "error waiting for bridge process");
                                ExitReport::Unknown
                            }
                        };
                        break BridgeOutcome::ProcessExited(report);
                    }

                    read = stdout.read(&mut out_buf), if !stdout_done => match read {
                        Ok(0) | Err(_) => stdout_done = true,
                        Ok(n) => pump.to_socket(&out_buf[..n]).await,
                    },

                    read = stderr.read(&mut err_buf), if !stderr_done => match read {
                        Ok(0) | Err(_) => stderr_done = true,
                        Ok(n) => pump.stderr(&err_buf[..n]).await,
                    },

                    permit = input_tx.reserve(), if !pump.input.is_empty() => match permit {
                        Ok(permit) => {
                            if let Some(chunk) = pump.input.pop_front() {
                                permit.send(chunk);
                            }
                        }
                        Err(_) => pump.close_input(),
                    },

                    // Paused while input is backed up.
                    read = sock_rd.read(&mut sock_buf), if pump.input.is_empty() => match read {
                        Ok(0) => break BridgeOutcome::SocketClosed,
                        Err(err) => {
                            tracing::debug!(session = %session_id, ?err, "socket read failed");
                            break BridgeOutcome::SocketClosed;
                        }
                        Ok(n) => match decoder.decode(&sock_buf[..n]) {
                            Ok(messages) => {
                                for message in messages {
                                    pump.to_process(message);
                                }
                                if decoder.close_received() {
                                    break BridgeOutcome::SocketClosed;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(session = %session_id, %err, "protocol violation, dropping connection");
                                break BridgeOutcome::SocketClosed;
                            }
                        },
                    },
                }

                if !pump.socket_open {
                    break BridgeOutcome::SocketClosed;
                }
            }
        };

        let notice = match outcome {
            BridgeOutcome::ProcessExited(report) => {
                finish(&mut state, BridgeState::ProcessExited);
                let drain = async {
                    while !(stdout_done && stderr_done) && pump.socket_open {
                        tokio::select! {
                            read = stdout.read(&mut out_buf), if !stdout_done => match read {
                                Ok(0) | Err(_) => stdout_done = true,
                                Ok(n) => pump.to_socket(&out_buf[..n]).await,
                            },
                            read = stderr.read(&mut err_buf), if !stderr_done => match read {
                                Ok(0) | Err(_) => stderr_done = true,
                                Ok(n) => pump.stderr(&err_buf[..n]).await,
                            },
                        }
                    }
                };
                if tokio::time::timeout(self.config.exit_drain, drain).await.is_err() {
                    tracing::debug!(session = %session_id, "output drain timed out after process exit");
                }
                tracing::info!(session = %session_id, %report, "bridge process ended");
                format!("\r\nprocess {report}\r\n")
            }
            BridgeOutcome::SocketClosed => {
                finish(&mut state, BridgeState::SocketClosed);
                tracing::info!(session = %session_id, "socket closed, killing bridge process");
                reap(&mut process.child, &handle).await;
                String::new()
            }
            BridgeOutcome::Cancelled => {
                finish(&mut state, BridgeState::SocketClosed);
                tracing::info!(session = %session_id, "session removed, closing bridge");
                reap(&mut process.child, &handle).await;
                "\r\nsession closed\r\n".to_string()
            }
        };

        // The process is gone; free the slot before the client sees the close
        // so an immediate reattach succeeds.
        drop(lease);
        drop(input_tx);
        writer.abort();
        pump.close(&notice).await;
        finish(&mut state, BridgeState::Terminated);
        Ok(outcome)
    }

    /// Read frames until the first text message arrives. Returns it first,
    /// followed by any text messages decoded in the same read.
    async fn await_attach<S>(
        &self,
        socket: &mut S,
        decoder: &mut FrameDecoder,
        leftover: Bytes,
    ) -> Result<Vec<Bytes>, BridgeError>
    where
        S: AsyncRead + Unpin,
    {
        let mut messages = decoder.decode(&leftover)?;
        let mut buf = vec![0u8; self.config.read_buffer];
        while messages.is_empty() {
            if decoder.close_received() {
                return Err(BridgeError::ClosedBeforeAttach);
            }
            let n = socket.read(&mut buf).await?;
            if n == 0 {
                return Err(BridgeError::ClosedBeforeAttach);
            }
            messages = decoder.decode(&buf[..n])?;
        }
        Ok(messages)
    }
}

fn finish(state: &mut BridgeState, next: BridgeState) {
    if let Err(err) = state.advance(next) {
        tracing::error!(%err, "bridge state machine violated");
    }
}

/// Forward direction helpers for one attached bridge.
struct Pump<W> {
    sock_wr: W,
    /// Process input not yet handed to the stdin writer, in arrival order.
    input: VecDeque<Bytes>,
    input_open: bool,
    credential: Credential,
    policy: CredentialPolicy,
    credential_sent: bool,
    socket_open: bool,
}

impl<W: AsyncWrite + Unpin> Pump<W> {
    async fn to_socket(&mut self, chunk: &[u8]) {
        if !self.socket_open {
            return;
        }
        let encoded = frame::text(chunk);
        if let Err(err) = self.sock_wr.write_all(&encoded).await {
            tracing::debug!(?err, "socket write failed");
            self.socket_open = false;
        }
    }

    async fn stderr(&mut self, chunk: &[u8]) {
        match classify_stderr(chunk, &self.credential, self.policy, self.credential_sent) {
            StderrAction::Answer(answer) => {
                tracing::debug!("answering password prompt with stored credential");
                self.credential_sent = true;
                self.to_process(answer);
            }
            StderrAction::Forward => self.to_socket(chunk).await,
        }
    }

    fn to_process(&mut self, data: Bytes) {
        if self.input_open {
            self.input.push_back(data);
        } else {
            tracing::debug!(len = data.len(), "process input closed, dropping data");
        }
    }

    /// The stdin writer is gone; queued and future input is discarded.
    fn close_input(&mut self) {
        tracing::debug!(dropped = self.input.len(), "process input closed");
        self.input.clear();
        self.input_open = false;
    }

    async fn close(&mut self, notice: &str) {
        if !self.socket_open {
            return;
        }
        if !notice.is_empty() {
            self.to_socket(notice.as_bytes()).await;
        }
        send_close(&mut self.sock_wr).await;
        self.socket_open = false;
    }
}

async fn write_input(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(&data).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}

async fn reap(child: &mut tokio::process::Child, handle: &BridgeHandle) {
    if handle.has_exited() {
        return;
    }
    // Only this task reaps, so the child's pid is still ours here.
    let _ = child.start_kill();
    match process::wait_exit(child, handle).await {
        Ok(status) => tracing::debug!(?status, "bridge process reaped"),
        Err(err) => tracing::warn!(%err, "failed to reap bridge process"),
    }
}

async fn send_close<W: AsyncWrite + Unpin>(writer: &mut W) {
    let _ = writer.write_all(&frame::close(CLOSE_NORMAL, "")).await;
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

async fn close_socket<W: AsyncWrite + Unpin>(writer: &mut W) {
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

/// Write one plain-text notice frame, then close.
async fn send_notice_and_close<W: AsyncWrite + Unpin>(writer: &mut W, notice: &str) {
    let _ = writer.write_all(&frame::text(notice)).await;
    send_close(writer).await;
}
