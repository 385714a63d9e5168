use crate::dispatch::{keyed, DispatchError, Dispatcher};
use crate::sessions::{SessionAttachment, SessionEvent};
use crate::store::{ObservedEvent, TaskStore};
use hcp_core::codec::{encode_line, parse_client_line};
use hcp_core::command::{parse_command, StreamCommand};
use hcp_core::envelope::{
    AuthErrorPayload, Base64Bytes, ClientEnvelope, CommandPayload, EventRecord, PtyEventPayload,
    PtyExitPayload, PtyExitStatus, PtyOutputPayload, ServerEnvelope, StreamEventPayload,
};
use hcp_core::framing::{LineFramer, DEFAULT_MAX_FRAME_BYTES};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, VecDeque},
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_BUFFER_BYTES: usize = 64 * 1024;
const INVALID_COMMAND: &str = "invalid command";
const RESULT_TOO_LARGE: &str = "result too large";
const SESSION_STATUS_EVENT: &str = "session-status";

#[derive(Clone, Debug)]
pub struct StreamUdsConfig {
    pub socket_path: PathBuf,
    /// When unset any `auth` envelope is accepted.
    pub auth_token: Option<String>,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl StreamUdsConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            auth_token: None,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[cfg(not(unix))]
pub async fn run(
    _config: StreamUdsConfig,
    _dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn run(
    config: StreamUdsConfig,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    if config.auth_token.is_none() {
        warn!(event = "stream_uds_auth_disabled", socket = %config.socket_path.display());
    }
    info!(
        event = "stream_uds_start",
        socket = %config.socket_path.display(),
        queue_capacity = config.queue_capacity
    );

    let hub = Arc::new(StreamUdsHub::new(config.clone(), dispatcher));
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            hub.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "stream_uds_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "stream_uds_stop");
    Ok(())
}

#[cfg(unix)]
struct StreamUdsHub {
    config: StreamUdsConfig,
    dispatcher: Arc<Dispatcher>,
    conn_counter: AtomicU64,
}

/// Subscriptions owned by one connection; all of them end with it.
#[cfg(unix)]
#[derive(Default)]
struct ConnectionState {
    pty_forwarders: HashMap<String, JoinHandle<()>>,
    stream: Option<(String, JoinHandle<()>)>,
}

#[cfg(unix)]
impl ConnectionState {
    fn close(&mut self) {
        for (_, forwarder) in self.pty_forwarders.drain() {
            forwarder.abort();
        }
        if let Some((_, forwarder)) = self.stream.take() {
            forwarder.abort();
        }
    }
}

#[cfg(unix)]
impl StreamUdsHub {
    fn new(config: StreamUdsConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            conn_counter: AtomicU64::new(0),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{id}")
    }

    fn token_matches(&self, presented: &str) -> bool {
        match &self.config.auth_token {
            Some(expected) => {
                Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
            }
            None => true,
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut inbound = Inbound::new(reader_half, self.config.max_frame_bytes);

        let (tx, rx) = mpsc::channel::<ServerEnvelope>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let max_frame_bytes = self.config.max_frame_bytes;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout, max_frame_bytes).await;
        });

        let rejection = match inbound.next_envelope(&conn_id).await {
            Some(ClientEnvelope::Auth(payload)) if self.token_matches(&payload.token) => None,
            Some(ClientEnvelope::Auth(_)) => Some("invalid token"),
            Some(other) => {
                warn!(event = "stream_uds_expected_auth", conn_id = %conn_id, kind = other.kind());
                Some("authentication required")
            }
            None => {
                drop(tx);
                let _ = writer_task.await;
                return;
            }
        };
        if let Some(error) = rejection {
            warn!(event = "stream_uds_auth_rejected", conn_id = %conn_id, reason = error);
            let _ = tx
                .send(ServerEnvelope::AuthError(AuthErrorPayload {
                    error: error.to_string(),
                }))
                .await;
            drop(tx);
            let _ = writer_task.await;
            return;
        }

        let _ = tx.send(ServerEnvelope::AuthOk).await;
        info!(event = "stream_uds_connect", conn_id = %conn_id);

        let mut state = ConnectionState::default();
        while let Some(envelope) = inbound.next_envelope(&conn_id).await {
            match envelope {
                ClientEnvelope::Auth(_) => {
                    debug!(event = "stream_uds_repeat_auth", conn_id = %conn_id);
                }
                ClientEnvelope::PtyInput(payload) => {
                    let result = self
                        .dispatcher
                        .sessions()
                        .write_input(&payload.session_id, payload.data_base64.into_inner())
                        .await;
                    if let Err(err) = result {
                        warn!(
                            event = "stream_uds_pty_input_rejected",
                            conn_id = %conn_id,
                            session_id = %payload.session_id,
                            error = %err
                        );
                    }
                }
                ClientEnvelope::PtyResize(payload) => {
                    let result = self
                        .dispatcher
                        .sessions()
                        .resize(&payload.session_id, payload.cols, payload.rows)
                        .await;
                    if let Err(err) = result {
                        warn!(
                            event = "stream_uds_pty_resize_rejected",
                            conn_id = %conn_id,
                            session_id = %payload.session_id,
                            error = %err
                        );
                    }
                }
                ClientEnvelope::PtySignal(payload) => {
                    let result = self
                        .dispatcher
                        .sessions()
                        .signal(&payload.session_id, payload.signal)
                        .await;
                    if let Err(err) = result {
                        warn!(
                            event = "stream_uds_pty_signal_rejected",
                            conn_id = %conn_id,
                            session_id = %payload.session_id,
                            error = %err
                        );
                    }
                }
                ClientEnvelope::Command(payload) => {
                    self.handle_command(&conn_id, payload, &mut state, &tx)
                        .await;
                }
            }
        }

        state.close();
        drop(tx);
        let _ = writer_task.await;
        info!(event = "stream_uds_disconnect", conn_id = %conn_id);
    }

    async fn handle_command(
        &self,
        conn_id: &str,
        payload: CommandPayload,
        state: &mut ConnectionState,
        tx: &mpsc::Sender<ServerEnvelope>,
    ) {
        let CommandPayload {
            command_id,
            command,
        } = payload;
        let Some(command) = parse_command(&command) else {
            debug!(event = "stream_uds_invalid_command", conn_id, command_id = %command_id);
            let _ = tx
                .send(ServerEnvelope::command_failed(command_id, INVALID_COMMAND))
                .await;
            return;
        };

        debug!(
            event = "stream_uds_command",
            conn_id,
            command_id = %command_id,
            command_type = command.command_type()
        );
        let _ = tx
            .send(ServerEnvelope::command_accepted(command_id.clone()))
            .await;

        if command.is_connection_scoped() {
            let outcome = self.connection_command(command, state, tx).await;
            let _ = tx.send(terminal_envelope(command_id, outcome)).await;
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.execute(command).await;
            let _ = tx.send(terminal_envelope(command_id, outcome)).await;
        });
    }

    async fn connection_command(
        &self,
        command: StreamCommand,
        state: &mut ConnectionState,
        tx: &mpsc::Sender<ServerEnvelope>,
    ) -> Result<serde_json::Value, DispatchError> {
        let sessions = self.dispatcher.sessions();
        match command {
            StreamCommand::PtySubscribe(input) => {
                state
                    .pty_forwarders
                    .retain(|_, forwarder| !forwarder.is_finished());
                if state.pty_forwarders.contains_key(&input.session_id) {
                    return keyed("subscribed", &true);
                }
                let attachment = sessions
                    .attach(&input.session_id, input.after_cursor)
                    .await?;
                let forwarder = tokio::spawn(forward_session(
                    input.session_id.clone(),
                    attachment,
                    tx.clone(),
                ));
                state.pty_forwarders.insert(input.session_id, forwarder);
                keyed("subscribed", &true)
            }
            StreamCommand::PtyUnsubscribe(input) => {
                let forwarder = state.pty_forwarders.remove(&input.session_id);
                let was_subscribed = forwarder.is_some();
                if let Some(forwarder) = forwarder {
                    stop_forwarder(forwarder).await;
                }
                sessions.ensure_live(&input.session_id).await?;
                keyed("unsubscribed", &was_subscribed)
            }
            StreamCommand::StreamSubscribe(input) => {
                if let Some((subscription_id, _)) = &state.stream {
                    return keyed("subscriptionId", subscription_id);
                }
                let subscription_id = format!("sub-{}", Uuid::new_v4().simple());
                let store = self.dispatcher.store().clone();
                let (replay, receiver) = store.subscribe_observed(input.after_cursor).await;
                let forwarder = tokio::spawn(forward_observed(
                    subscription_id.clone(),
                    replay,
                    receiver,
                    store,
                    tx.clone(),
                ));
                state.stream = Some((subscription_id.clone(), forwarder));
                keyed("subscriptionId", &subscription_id)
            }
            StreamCommand::StreamUnsubscribe(input) => {
                let matches = state
                    .stream
                    .as_ref()
                    .is_some_and(|(subscription_id, _)| *subscription_id == input.subscription_id);
                if !matches {
                    return keyed("unsubscribed", &false);
                }
                if let Some((_, forwarder)) = state.stream.take() {
                    stop_forwarder(forwarder).await;
                }
                keyed("unsubscribed", &true)
            }
            other => self.dispatcher.execute(other).await,
        }
    }
}

/// Aborts a forwarder and waits for it to finish, so it cannot queue an
/// event after the reply that follows.
#[cfg(unix)]
async fn stop_forwarder(forwarder: JoinHandle<()>) {
    forwarder.abort();
    let _ = forwarder.await;
}

fn terminal_envelope(
    command_id: String,
    outcome: Result<serde_json::Value, DispatchError>,
) -> ServerEnvelope {
    match outcome {
        Ok(result) => ServerEnvelope::command_completed(command_id, result),
        Err(err) => ServerEnvelope::command_failed(command_id, err.to_string()),
    }
}

#[derive(Serialize)]
struct SessionStatusRecord<'a> {
    status: &'static str,
    exit: &'a PtyExitStatus,
}

async fn forward_session(
    session_id: String,
    attachment: SessionAttachment,
    tx: mpsc::Sender<ServerEnvelope>,
) {
    let SessionAttachment {
        replay,
        mut receiver,
    } = attachment;
    let mut last_cursor = 0;

    for event in replay {
        if !emit_session_event(&session_id, event, &mut last_cursor, &tx).await {
            return;
        }
    }
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if !emit_session_event(&session_id, event, &mut last_cursor, &tx).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "pty_forward_lagged", session_id = %session_id, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Returns `false` once nothing more should be forwarded.
async fn emit_session_event(
    session_id: &str,
    event: SessionEvent,
    last_cursor: &mut u64,
    tx: &mpsc::Sender<ServerEnvelope>,
) -> bool {
    match event {
        SessionEvent::Output { cursor, chunk } => {
            if cursor <= *last_cursor {
                return true;
            }
            *last_cursor = cursor;
            tx.send(ServerEnvelope::PtyOutput(PtyOutputPayload {
                session_id: session_id.to_string(),
                cursor,
                chunk_base64: Base64Bytes(chunk),
            }))
            .await
            .is_ok()
        }
        SessionEvent::Exited(exit) => {
            let record = serde_json::to_value(SessionStatusRecord {
                status: "exited",
                exit: &exit,
            })
            .unwrap_or_default();
            let _ = tx
                .send(ServerEnvelope::PtyEvent(PtyEventPayload {
                    session_id: session_id.to_string(),
                    event: EventRecord {
                        event_type: SESSION_STATUS_EVENT.to_string(),
                        record,
                    },
                }))
                .await;
            let _ = tx
                .send(ServerEnvelope::PtyExit(PtyExitPayload {
                    session_id: session_id.to_string(),
                    exit,
                }))
                .await;
            false
        }
    }
}

async fn forward_observed(
    subscription_id: String,
    replay: Vec<ObservedEvent>,
    mut receiver: broadcast::Receiver<ObservedEvent>,
    store: Arc<TaskStore>,
    tx: mpsc::Sender<ServerEnvelope>,
) {
    let mut last_cursor = 0;
    let mut pending = VecDeque::from(replay);

    loop {
        while let Some(entry) = pending.pop_front() {
            if entry.cursor <= last_cursor {
                continue;
            }
            last_cursor = entry.cursor;
            let envelope = ServerEnvelope::StreamEvent(StreamEventPayload {
                subscription_id: subscription_id.clone(),
                cursor: entry.cursor,
                event: entry.event,
            });
            if tx.send(envelope).await.is_err() {
                return;
            }
        }

        match receiver.recv().await {
            Ok(entry) => pending.push_back(entry),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(
                    event = "stream_forward_catch_up",
                    subscription_id = %subscription_id,
                    skipped,
                    last_cursor
                );
                pending.extend(store.observed_after(last_cursor).await);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerEnvelope>,
    write_timeout: Duration,
    max_frame_bytes: usize,
) {
    while let Some(envelope) = rx.recv().await {
        let Some(line) = encode_reply(&conn_id, envelope, max_frame_bytes) else {
            continue;
        };
        let send = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "stream_uds_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "stream_uds_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
}

/// Encodes one outbound line. A `command.completed` that does not fit in a
/// frame is replaced by `command.failed` so the command still gets its
/// terminal reply.
#[cfg(unix)]
fn encode_reply(
    conn_id: &str,
    envelope: ServerEnvelope,
    max_frame_bytes: usize,
) -> Option<String> {
    let err = match encode_line(&envelope, max_frame_bytes) {
        Ok(line) => return Some(line),
        Err(err) => err,
    };
    warn!(
        event = "stream_uds_encode_error",
        conn_id,
        kind = envelope.kind(),
        error = %err
    );
    let ServerEnvelope::CommandCompleted(payload) = envelope else {
        return None;
    };
    let fallback = ServerEnvelope::command_failed(payload.command_id, RESULT_TOO_LARGE);
    encode_line(&fallback, max_frame_bytes).ok()
}

#[cfg(unix)]
struct Inbound {
    reader: OwnedReadHalf,
    framer: LineFramer,
    lines: VecDeque<String>,
    buf: Vec<u8>,
}

#[cfg(unix)]
impl Inbound {
    fn new(reader: OwnedReadHalf, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            framer: LineFramer::new(max_frame_bytes),
            lines: VecDeque::new(),
            buf: vec![0; READ_BUFFER_BYTES],
        }
    }

    /// Next decodable envelope; undecodable lines are logged and skipped.
    async fn next_envelope(&mut self, conn_id: &str) -> Option<ClientEnvelope> {
        loop {
            while let Some(line) = self.lines.pop_front() {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_client_line(&line) {
                    Ok(envelope) => return Some(envelope),
                    Err(err) => {
                        warn!(event = "stream_uds_decode_error", conn_id, error = %err);
                    }
                }
            }

            let read = match self.reader.read(&mut self.buf).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "stream_uds_read_error", conn_id, error = %err);
                    return None;
                }
            };
            if read == 0 {
                return None;
            }
            let batch = self.framer.push_chunk(&self.buf[..read]);
            for err in batch.errors {
                warn!(event = "stream_uds_frame_error", conn_id, error = %err);
            }
            self.lines.extend(batch.lines);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sessions::{SessionHost, SessionHostConfig};
    use hcp_core::client::{ClientConfig, ClientError, ControlPlaneClient};
    use hcp_core::codec::{encode_client, parse_server_line};
    use hcp_core::command::{SessionStartInput, TaskCreateInput, TaskRef};
    use hcp_core::envelope::AuthPayload;
    use hcp_core::subscription::{
        subscribe_session_events, unsubscribe_session_events, ObservedStreamSubscription,
        SessionControlError, SessionStreams,
    };
    use serde_json::json;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::io::{AsyncBufReadExt, BufReader};

    const TOKEN: &str = "test-token";

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("hcp-stream-hub-test-{name}-{nanos}"))
            .join("hub.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    struct TestHub {
        path: PathBuf,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<io::Result<()>>,
    }

    async fn launch_hub(name: &str) -> TestHub {
        let path = test_path(name);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(TaskStore::default()),
            Arc::new(SessionHost::new(SessionHostConfig::new("/bin/sh"))),
        ));
        let mut config = StreamUdsConfig::new(path.clone());
        config.auth_token = Some(TOKEN.to_string());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(config, dispatcher.clone(), shutdown_rx));
        wait_for_socket(&path).await;
        TestHub {
            path,
            dispatcher,
            shutdown,
            task,
        }
    }

    async fn connect_client(hub: &TestHub) -> (ControlPlaneClient, mpsc::Receiver<ServerEnvelope>) {
        ControlPlaneClient::connect(&ClientConfig::new(hub.path.clone(), TOKEN))
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"))
    }

    async fn connect_raw(path: &Path, token: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, mut writer) = stream.into_split();
        send_raw(
            &mut writer,
            &ClientEnvelope::Auth(AuthPayload {
                token: token.to_string(),
            }),
        )
        .await;
        (BufReader::new(reader), writer)
    }

    async fn send_raw(writer: &mut OwnedWriteHalf, envelope: &ClientEnvelope) {
        let line = encode_client(envelope).expect("encode");
        writer.write_all(line.as_bytes()).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn read_raw(reader: &mut BufReader<OwnedReadHalf>) -> Option<ServerEnvelope> {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("read timeout")
            .expect("read");
        if read == 0 {
            return None;
        }
        Some(parse_server_line(&line).expect("decode"))
    }

    async fn next_event(events: &mut mpsc::Receiver<ServerEnvelope>) -> ServerEnvelope {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel open")
    }

    fn command(command_id: &str, command: serde_json::Value) -> ClientEnvelope {
        ClientEnvelope::Command(CommandPayload {
            command_id: command_id.to_string(),
            command,
        })
    }

    fn create_input(title: &str) -> TaskCreateInput {
        TaskCreateInput {
            title: title.to_string(),
            description: None,
            tenant_id: None,
            user_id: None,
            workspace_id: None,
            repository_id: None,
            project_id: None,
            status: None,
            linear: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_token_gets_auth_error_and_close() {
        let hub = launch_hub("auth").await;

        let (mut reader, _writer) = connect_raw(&hub.path, "nope").await;
        match read_raw(&mut reader).await {
            Some(ServerEnvelope::AuthError(payload)) => assert_eq!(payload.error, "invalid token"),
            other => panic!("expected auth.error, got {other:?}"),
        }
        assert_eq!(read_raw(&mut reader).await, None);

        let err = ControlPlaneClient::connect(&ClientConfig::new(hub.path.clone(), "nope"))
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, ClientError::AuthRejected(_)));

        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_envelope_must_be_auth() {
        let hub = launch_hub("auth-first").await;
        let stream = UnixStream::connect(&hub.path).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        send_raw(&mut writer, &command("c-1", json!({"type": "task.list"}))).await;
        match read_raw(&mut reader).await {
            Some(ServerEnvelope::AuthError(payload)) => {
                assert_eq!(payload.error, "authentication required")
            }
            other => panic!("expected auth.error, got {other:?}"),
        }
        assert_eq!(read_raw(&mut reader).await, None);
        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_commands_fail_without_acceptance() {
        let hub = launch_hub("invalid").await;
        let (mut reader, mut writer) = connect_raw(&hub.path, TOKEN).await;
        assert_eq!(read_raw(&mut reader).await, Some(ServerEnvelope::AuthOk));

        writer.write_all(b"this is not json\n\n").await.expect("garbage");
        send_raw(
            &mut writer,
            &command("c-bad", json!({"type": "task.list", "limit": 0})),
        )
        .await;
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_failed("c-bad", "invalid command"))
        );

        send_raw(&mut writer, &command("c-ok", json!({"type": "task.list"}))).await;
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_accepted("c-ok"))
        );
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_completed(
                "c-ok",
                json!({"tasks": []})
            ))
        );
        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_results_fail_instead_of_vanishing() {
        let hub = launch_hub("oversized").await;
        let title = "t".repeat(300);
        for _ in 0..1200 {
            hub.dispatcher.store().create_task(create_input(&title)).await;
        }
        let (mut reader, mut writer) = connect_raw(&hub.path, TOKEN).await;
        assert_eq!(read_raw(&mut reader).await, Some(ServerEnvelope::AuthOk));

        send_raw(&mut writer, &command("c-big", json!({"type": "task.list"}))).await;
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_accepted("c-big"))
        );
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_failed("c-big", "result too large"))
        );

        send_raw(
            &mut writer,
            &command("c-small", json!({"type": "task.list", "limit": 1})),
        )
        .await;
        assert_eq!(
            read_raw(&mut reader).await,
            Some(ServerEnvelope::command_accepted("c-small"))
        );
        match read_raw(&mut reader).await {
            Some(ServerEnvelope::CommandCompleted(payload)) => {
                assert_eq!(payload.command_id, "c-small");
                assert_eq!(payload.result["tasks"].as_array().map(Vec::len), Some(1));
            }
            other => panic!("expected command.completed, got {other:?}"),
        }
        let _ = hub.shutdown.send(true);
    }

    #[test]
    fn encode_reply_only_substitutes_completed_commands() {
        let completed = ServerEnvelope::command_completed("c-1", json!({"blob": "x".repeat(64)}));
        let line = encode_reply("conn-1", completed.clone(), 1024).expect("fits");
        assert_eq!(parse_server_line(&line).expect("decode"), completed);

        let line = encode_reply("conn-1", completed, 96).expect("fallback");
        assert_eq!(
            parse_server_line(&line).expect("decode"),
            ServerEnvelope::command_failed("c-1", "result too large")
        );

        let accepted = ServerEnvelope::command_accepted("c-".repeat(64));
        assert_eq!(encode_reply("conn-1", accepted, 96), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_commands_round_trip() {
        let hub = launch_hub("commands").await;
        let repository = hub
            .dispatcher
            .store()
            .register_repository(Path::new("/srv/widget"))
            .await;
        let (client, _events) = connect_client(&hub).await;

        let created = client
            .send_command(&StreamCommand::TaskCreate(TaskCreateInput {
                repository_id: Some(repository.repository_id.clone()),
                ..create_input("Fix login")
            }))
            .await
            .expect("create");
        let task_id = created["task"]["taskId"]
            .as_str()
            .expect("task id")
            .to_string();
        assert_eq!(created["task"]["status"], "draft");

        let fetched = client
            .send_command(&StreamCommand::TaskGet(TaskRef {
                task_id: task_id.clone(),
            }))
            .await
            .expect("get");
        assert_eq!(fetched["task"]["title"], "Fix login");

        let listed = client
            .send_command_value(json!({
                "type": "task.list",
                "repositoryId": repository.repository_id,
                "scopeKind": "repository"
            }))
            .await
            .expect("list");
        assert_eq!(listed["tasks"][0]["taskId"], task_id.as_str());

        let fetched = client
            .send_command_value(json!({
                "type": "repository.get",
                "repositoryId": repository.repository_id
            }))
            .await
            .expect("repository");
        assert_eq!(fetched["repository"]["name"], "widget");

        let err = client
            .send_command_value(json!({"type": "task.get", "taskId": "task-missing"}))
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            ClientError::CommandFailed(message) if message == "task not found: task-missing"
        ));

        let err = client
            .send_command_value(json!({"type": "task.create", "title": "   "}))
            .await
            .expect_err("blank title");
        assert!(matches!(
            err,
            ClientError::CommandFailed(message) if message == "invalid command"
        ));

        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observed_stream_replays_after_cursor_then_streams_live() {
        let hub = launch_hub("observed").await;
        let store = hub.dispatcher.store().clone();
        store.create_task(create_input("one")).await;
        store.create_task(create_input("two")).await;

        let (client, mut events) = connect_client(&hub).await;
        let mut subscription = ObservedStreamSubscription::new();
        subscription
            .subscribe(&client, Some(1))
            .await
            .expect("subscribe");
        let subscription_id = subscription
            .subscription_id()
            .expect("active")
            .to_string();

        match next_event(&mut events).await {
            ServerEnvelope::StreamEvent(payload) => {
                assert_eq!(payload.subscription_id, subscription_id);
                assert_eq!(payload.cursor, 2);
                assert_eq!(payload.event.event_type, "task-created");
                assert_eq!(payload.event.record["title"], "two");
            }
            other => panic!("expected stream.event, got {other:?}"),
        }

        let again = client
            .send_command_value(json!({"type": "stream.subscribe"}))
            .await
            .expect("idempotent subscribe");
        assert_eq!(again["subscriptionId"], subscription_id.as_str());

        store.create_task(create_input("three")).await;
        match next_event(&mut events).await {
            ServerEnvelope::StreamEvent(payload) => assert_eq!(payload.cursor, 3),
            other => panic!("expected stream.event, got {other:?}"),
        }

        subscription.unsubscribe(&client).await.expect("unsubscribe");
        store.create_task(create_input("four")).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err(),
            "no events after unsubscribe"
        );

        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pty_session_streams_output_and_exit() {
        let hub = launch_hub("pty").await;
        let (client, mut events) = connect_client(&hub).await;

        // The shell stands in for a bridge: `head` echoes the DATA frame back.
        let started = client
            .send_command(&StreamCommand::SessionStart(SessionStartInput {
                command: vec!["-c".to_string(), "head -c 10; exit 5".to_string()],
                ..SessionStartInput::default()
            }))
            .await
            .expect("start");
        let session_id = started["sessionId"]
            .as_str()
            .expect("session id")
            .to_string();

        subscribe_session_events(&client, &session_id)
            .await
            .expect("subscribe");
        client
            .send_input(&session_id, b"hello")
            .await
            .expect("input");

        let mut output = Vec::new();
        let exit = loop {
            match next_event(&mut events).await {
                ServerEnvelope::PtyOutput(payload) => {
                    assert_eq!(payload.session_id, session_id);
                    output.extend(payload.chunk_base64.into_inner());
                }
                ServerEnvelope::PtyEvent(payload) => {
                    assert_eq!(payload.event.event_type, "session-status");
                    assert_eq!(payload.event.record["status"], "exited");
                }
                ServerEnvelope::PtyExit(payload) => break payload.exit,
                other => panic!("unexpected event {other:?}"),
            }
        };
        assert_eq!(output, vec![0x01, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(exit.code, Some(5));

        assert_eq!(
            client.unsubscribe_session(&session_id).await,
            Err(SessionControlError::NotLive(session_id.clone()))
        );
        unsubscribe_session_events(&client, &session_id)
            .await
            .expect("gone session is already unsubscribed");
        assert_eq!(
            client.subscribe_session("session-missing").await,
            Err(SessionControlError::NotFound("session-missing".to_string()))
        );
        subscribe_session_events(&client, "session-missing")
            .await
            .expect("missing session is swallowed");

        let attention = client
            .send_command_value(json!({"type": "attention.list"}))
            .await
            .expect("attention");
        assert_eq!(attention["sessions"][0]["sessionId"], session_id.as_str());
        assert_eq!(attention["sessions"][0]["live"], false);

        let _ = hub.shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_removes_the_socket() {
        let hub = launch_hub("shutdown").await;
        let _ = hub.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(2), hub.task)
            .await
            .expect("hub stops")
            .expect("join")
            .expect("run ok");
        assert!(!hub.path.exists());
    }
}
