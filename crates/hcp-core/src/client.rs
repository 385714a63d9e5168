//! Unix socket client for the hub's control-plane stream.
//!
//! One reader task owns the connection's [`LineFramer`] and the
//! [`ObservedCursorState`]; pushed events whose cursor does not advance are
//! dropped there before they reach the event channel.

use crate::codec::{encode_client, parse_server_line};
use crate::command::{
    PtySubscribeInput, SessionRef, StreamCommand, StreamSubscribeInput, StreamUnsubscribeInput,
};
use crate::cursor::{observe_cursor, CursorUpdate, ObservedCursorState};
use crate::envelope::{
    AuthPayload, Base64Bytes, ClientEnvelope, CommandPayload, PtyInputPayload, PtyResizePayload,
    PtySignal, PtySignalPayload, ServerEnvelope,
};
use crate::framing::{FrameError, LineFramer, DEFAULT_MAX_FRAME_BYTES};
use crate::subscription::{ObservedEventSource, SessionControlError, SessionStreams};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("unexpected envelope: {0}")]
    UnexpectedEnvelope(&'static str),
    #[error("unexpected command result: {0}")]
    UnexpectedResult(String),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub token: String,
    pub event_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            token: token.into(),
            event_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

enum CommandOutcome {
    Completed(Value),
    Failed(String),
}

struct PendingCommand {
    reply: oneshot::Sender<CommandOutcome>,
    /// Cursor key the reader drops once this command has its terminal reply.
    releases: Option<String>,
}

/// In-flight commands. `closed` is set by the reader when it stops, under the
/// same lock, so no command can be registered after the final drain.
#[derive(Default)]
struct PendingState {
    commands: HashMap<String, PendingCommand>,
    closed: bool,
}

type PendingCommands = Arc<Mutex<PendingState>>;

fn pty_key(session_id: &str) -> String {
    format!("pty:{session_id}")
}

fn stream_key(subscription_id: &str) -> String {
    format!("stream:{subscription_id}")
}

/// Cursor key whose events stop once `command` completes.
fn released_key(command: &StreamCommand) -> Option<String> {
    match command {
        StreamCommand::PtyUnsubscribe(input) => Some(pty_key(&input.session_id)),
        StreamCommand::StreamUnsubscribe(input) => Some(stream_key(&input.subscription_id)),
        _ => None,
    }
}

pub struct ControlPlaneClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingCommands,
    command_seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl ControlPlaneClient {
    /// Connects and authenticates. Pushed events (`pty.output`, `pty.exit`,
    /// `pty.event`, `stream.event`) arrive on the returned receiver, which must
    /// be drained for command replies to keep flowing.
    pub async fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ServerEnvelope>), ClientError> {
        let stream = UnixStream::connect(&config.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let auth = encode_client(&ClientEnvelope::Auth(AuthPayload {
            token: config.token.clone(),
        }))?;
        writer.write_all(auth.as_bytes()).await?;
        writer.flush().await?;

        let mut inbound = Inbound::new(reader, config.max_frame_bytes);
        match inbound.next_envelope().await? {
            Some(ServerEnvelope::AuthOk) => {}
            Some(ServerEnvelope::AuthError(payload)) => {
                return Err(ClientError::AuthRejected(payload.error));
            }
            Some(other) => return Err(ClientError::UnexpectedEnvelope(other.kind())),
            None => return Err(ClientError::Closed),
        }

        let pending: PendingCommands = Arc::default();
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let reader = tokio::spawn(reader_loop(inbound, pending.clone(), events_tx));

        Ok((
            Self {
                writer: Mutex::new(writer),
                pending,
                command_seq: AtomicU64::new(0),
                reader,
            },
            events_rx,
        ))
    }

    pub async fn send_command(&self, command: &StreamCommand) -> Result<Value, ClientError> {
        let value = command
            .to_value()
            .map_err(|err| FrameError::Encode(err.to_string()))?;
        self.dispatch(value, released_key(command)).await
    }

    /// Sends an arbitrary command value and waits for its terminal envelope.
    pub async fn send_command_value(&self, command: Value) -> Result<Value, ClientError> {
        self.dispatch(command, None).await
    }

    async fn dispatch(
        &self,
        command: Value,
        releases: Option<String>,
    ) -> Result<Value, ClientError> {
        let command_id = format!("cmd-{}", self.command_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(ClientError::Closed);
            }
            pending
                .commands
                .insert(command_id.clone(), PendingCommand { reply, releases });
        }

        let envelope = ClientEnvelope::Command(CommandPayload {
            command_id: command_id.clone(),
            command,
        });
        if let Err(err) = self.send_envelope(&envelope).await {
            self.pending.lock().await.commands.remove(&command_id);
            return Err(err);
        }

        match rx.await {
            Ok(CommandOutcome::Completed(result)) => Ok(result),
            Ok(CommandOutcome::Failed(error)) => Err(ClientError::CommandFailed(error)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<(), ClientError> {
        self.send_envelope(&ClientEnvelope::PtyInput(PtyInputPayload {
            session_id: session_id.to_string(),
            data_base64: Base64Bytes::from(data),
        }))
        .await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send_envelope(&ClientEnvelope::PtyResize(PtyResizePayload {
            session_id: session_id.to_string(),
            cols,
            rows,
        }))
        .await
    }

    pub async fn signal(&self, session_id: &str, signal: PtySignal) -> Result<(), ClientError> {
        self.send_envelope(&ClientEnvelope::PtySignal(PtySignalPayload {
            session_id: session_id.to_string(),
            signal,
        }))
        .await
    }

    async fn send_envelope(&self, envelope: &ClientEnvelope) -> Result<(), ClientError> {
        let line = encode_client(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for ControlPlaneClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl SessionStreams for ControlPlaneClient {
    async fn subscribe_session(&self, session_id: &str) -> Result<(), SessionControlError> {
        let command = StreamCommand::PtySubscribe(PtySubscribeInput {
            session_id: session_id.to_string(),
            after_cursor: None,
        });
        self.send_command(&command)
            .await
            .map(|_| ())
            .map_err(session_control_error)
    }

    async fn unsubscribe_session(&self, session_id: &str) -> Result<(), SessionControlError> {
        let command = StreamCommand::PtyUnsubscribe(SessionRef {
            session_id: session_id.to_string(),
        });
        self.send_command(&command)
            .await
            .map(|_| ())
            .map_err(session_control_error)
    }
}

#[async_trait]
impl ObservedEventSource for ControlPlaneClient {
    type Error = ClientError;

    async fn subscribe_observed(&self, after_cursor: Option<u64>) -> Result<String, ClientError> {
        let command = StreamCommand::StreamSubscribe(StreamSubscribeInput { after_cursor });
        let result = self.send_command(&command).await?;
        result
            .get("subscriptionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::UnexpectedResult(result.to_string()))
    }

    async fn unsubscribe_observed(&self, subscription_id: &str) -> Result<(), ClientError> {
        let command = StreamCommand::StreamUnsubscribe(StreamUnsubscribeInput {
            subscription_id: subscription_id.to_string(),
        });
        self.send_command(&command).await.map(|_| ())
    }
}

fn session_control_error(err: ClientError) -> SessionControlError {
    match err {
        ClientError::CommandFailed(message) => SessionControlError::from_failure(&message),
        other => SessionControlError::Other(other.to_string()),
    }
}

struct Inbound {
    reader: OwnedReadHalf,
    framer: LineFramer,
    lines: VecDeque<String>,
    buf: Vec<u8>,
}

impl Inbound {
    fn new(reader: OwnedReadHalf, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            framer: LineFramer::new(max_frame_bytes),
            lines: VecDeque::new(),
            buf: vec![0; READ_BUFFER_BYTES],
        }
    }

    async fn next_envelope(&mut self) -> Result<Option<ServerEnvelope>, ClientError> {
        loop {
            while let Some(line) = self.lines.pop_front() {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_server_line(&line) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(err) => warn!(event = "client_decode_error", error = %err),
                }
            }

            let read = self.reader.read(&mut self.buf).await?;
            if read == 0 {
                return Ok(None);
            }
            let batch = self.framer.push_chunk(&self.buf[..read]);
            for err in batch.errors {
                warn!(event = "client_frame_error", error = %err);
            }
            self.lines.extend(batch.lines);
        }
    }
}

async fn reader_loop(
    mut inbound: Inbound,
    pending: PendingCommands,
    events: mpsc::Sender<ServerEnvelope>,
) {
    let mut cursors = ObservedCursorState::new();

    loop {
        let envelope = match inbound.next_envelope().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(err) => {
                warn!(event = "client_read_error", error = %err);
                break;
            }
        };

        let forward = match &envelope {
            ServerEnvelope::CommandAccepted(payload) => {
                debug!(event = "client_command_accepted", command_id = %payload.command_id);
                false
            }
            ServerEnvelope::CommandCompleted(payload) => {
                let outcome = CommandOutcome::Completed(payload.result.clone());
                resolve(&pending, &payload.command_id, outcome, &mut cursors).await;
                false
            }
            ServerEnvelope::CommandFailed(payload) => {
                let outcome = CommandOutcome::Failed(payload.error.clone());
                resolve(&pending, &payload.command_id, outcome, &mut cursors).await;
                false
            }
            ServerEnvelope::PtyOutput(payload) => advance(
                &mut cursors,
                &pty_key(&payload.session_id),
                payload.cursor,
            ),
            ServerEnvelope::StreamEvent(payload) => advance(
                &mut cursors,
                &stream_key(&payload.subscription_id),
                payload.cursor,
            ),
            ServerEnvelope::PtyExit(_) | ServerEnvelope::PtyEvent(_) => true,
            ServerEnvelope::AuthOk | ServerEnvelope::AuthError(_) => {
                warn!(event = "client_unexpected_envelope", kind = envelope.kind());
                false
            }
        };

        if forward && events.send(envelope).await.is_err() {
            debug!(event = "client_event_receiver_dropped");
        }
    }

    // Dropping the senders fails every in-flight command with `Closed`.
    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.commands.clear();
}

fn advance(cursors: &mut ObservedCursorState, key: &str, cursor: u64) -> bool {
    let decision = observe_cursor(
        cursors,
        CursorUpdate {
            subscription_id: key,
            cursor,
        },
    );
    if !decision.accepted {
        debug!(
            event = "client_stale_event",
            key,
            cursor,
            previous = ?decision.previous_cursor
        );
        return false;
    }
    *cursors = decision.next_state;
    true
}

async fn resolve(
    pending: &PendingCommands,
    command_id: &str,
    outcome: CommandOutcome,
    cursors: &mut ObservedCursorState,
) {
    let Some(command) = pending.lock().await.commands.remove(command_id) else {
        debug!(event = "client_unknown_command_reply", command_id);
        return;
    };
    // The hub stops the forwarder before replying, so no later event can
    // carry this key.
    if let Some(key) = &command.releases {
        *cursors = cursors.forget(key);
    }
    let _ = command.reply.send(outcome);
}
