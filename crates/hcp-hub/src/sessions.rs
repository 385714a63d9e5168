use chrono::{DateTime, Utc};
use hcp_core::command::SessionStartInput;
use hcp_core::envelope::{PtyExitStatus, PtySignal};
use hcp_core::pty_bridge::{signal_from_exit_code, signal_name, BridgeFrame};
use hcp_core::subscription::SessionControlError;
use hcp_core::SessionStatus;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_BUFFER_BYTES: usize = 64 * 1024;
const INPUT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct SessionHostConfig {
    /// Helper that owns the PTY; invoked as `<bridge> <command...>`.
    pub bridge_program: PathBuf,
    pub backlog_chunks: usize,
    pub event_capacity: usize,
}

impl SessionHostConfig {
    pub fn new(bridge_program: impl Into<PathBuf>) -> Self {
        Self {
            bridge_program: bridge_program.into(),
            backlog_chunks: 512,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output { cursor: u64, chunk: Vec<u8> },
    Exited(PtyExitStatus),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub status: SessionStatus,
    pub live: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub last_cursor: u64,
    pub exit: Option<PtyExitStatus>,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Backlog replay plus the live feed for one subscriber.
pub struct SessionAttachment {
    pub replay: Vec<SessionEvent>,
    pub receiver: broadcast::Receiver<SessionEvent>,
}

struct SessionState {
    status: SessionStatus,
    input: Option<mpsc::Sender<BridgeFrame>>,
    cols: Option<u16>,
    rows: Option<u16>,
    last_cursor: u64,
    backlog: VecDeque<(u64, Vec<u8>)>,
    exit: Option<PtyExitStatus>,
    exited_at: Option<DateTime<Utc>>,
}

struct SessionHandle {
    session_id: String,
    command: Vec<String>,
    cwd: Option<String>,
    started_at: DateTime<Utc>,
    backlog_max: usize,
    events: broadcast::Sender<SessionEvent>,
    state: RwLock<SessionState>,
}

impl SessionHandle {
    async fn summary(&self) -> SessionSummary {
        let state = self.state.read().await;
        SessionSummary {
            session_id: self.session_id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            status: state.status,
            live: state.status.is_live(),
            cols: state.cols,
            rows: state.rows,
            last_cursor: state.last_cursor,
            exit: state.exit.clone(),
            started_at: self.started_at,
            exited_at: state.exited_at,
        }
    }

    async fn record_output(&self, chunk: Vec<u8>) {
        let mut state = self.state.write().await;
        state.last_cursor += 1;
        let cursor = state.last_cursor;
        state.backlog.push_back((cursor, chunk.clone()));
        while state.backlog.len() > self.backlog_max {
            state.backlog.pop_front();
        }
        let _ = self.events.send(SessionEvent::Output { cursor, chunk });
    }

    async fn mark_exited(&self, exit: PtyExitStatus) {
        let mut state = self.state.write().await;
        state.status = SessionStatus::Exited;
        // Closing the queue ends the stdin writer.
        state.input = None;
        state.exit = Some(exit.clone());
        state.exited_at = Some(Utc::now());
        let _ = self.events.send(SessionEvent::Exited(exit));
    }
}

/// Spawns and tracks bridge-backed terminal sessions.
pub struct SessionHost {
    config: SessionHostConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionHost {
    pub fn new(config: SessionHostConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(&self, input: SessionStartInput) -> Result<String, SessionControlError> {
        let session_id = format!("session-{}", Uuid::new_v4().simple());

        let mut command = Command::new(&self.config.bridge_program);
        command
            .args(&input.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &input.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|err| {
            SessionControlError::Other(format!(
                "failed to spawn {}: {err}",
                self.config.bridge_program.display()
            ))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SessionControlError::Other(
                "bridge stdio unavailable".to_string(),
            ));
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        if let (Some(cols), Some(rows)) = (input.cols, input.rows) {
            let _ = input_tx.try_send(BridgeFrame::Resize { cols, rows });
        }

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let handle = Arc::new(SessionHandle {
            session_id: session_id.clone(),
            command: input.command,
            cwd: input.cwd,
            started_at: Utc::now(),
            backlog_max: self.config.backlog_chunks.max(1),
            events,
            state: RwLock::new(SessionState {
                status: SessionStatus::Running,
                input: Some(input_tx),
                cols: input.cols,
                rows: input.rows,
                last_cursor: 0,
                backlog: VecDeque::new(),
                exit: None,
                exited_at: None,
            }),
        });
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), handle.clone());

        tokio::spawn(stdin_loop(session_id.clone(), stdin, input_rx));
        tokio::spawn(output_loop(handle, stdout, child));

        info!(
            event = "session_started",
            session_id = %session_id,
            bridge = %self.config.bridge_program.display()
        );
        Ok(session_id)
    }

    pub async fn write_input(
        &self,
        session_id: &str,
        data: Vec<u8>,
    ) -> Result<(), SessionControlError> {
        self.send_frame(session_id, BridgeFrame::Data(data)).await
    }

    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionControlError> {
        let handle = self.handle(session_id).await?;
        {
            let mut state = handle.state.write().await;
            if state.status.is_live() {
                state.cols = Some(cols);
                state.rows = Some(rows);
            }
        }
        self.send_frame(session_id, BridgeFrame::Resize { cols, rows })
            .await
    }

    pub async fn signal(
        &self,
        session_id: &str,
        signal: PtySignal,
    ) -> Result<(), SessionControlError> {
        self.send_frame(session_id, BridgeFrame::for_signal(signal))
            .await
    }

    /// Attaches a subscriber. Output chunks after `after_cursor` still in the
    /// backlog are replayed; the receiver sees everything recorded later.
    pub async fn attach(
        &self,
        session_id: &str,
        after_cursor: Option<u64>,
    ) -> Result<SessionAttachment, SessionControlError> {
        let handle = self.handle(session_id).await?;
        let state = handle.state.read().await;
        if !state.status.is_live() {
            return Err(SessionControlError::NotLive(session_id.to_string()));
        }
        let receiver = handle.events.subscribe();
        let replay = state
            .backlog
            .iter()
            .filter(|(cursor, _)| after_cursor.map_or(true, |after| *cursor > after))
            .map(|(cursor, chunk)| SessionEvent::Output {
                cursor: *cursor,
                chunk: chunk.clone(),
            })
            .collect();
        Ok(SessionAttachment { replay, receiver })
    }

    /// Fails the same way `attach` would, without attaching.
    pub async fn ensure_live(&self, session_id: &str) -> Result<(), SessionControlError> {
        let handle = self.handle(session_id).await?;
        if handle.state.read().await.status.is_live() {
            Ok(())
        } else {
            Err(SessionControlError::NotLive(session_id.to_string()))
        }
    }

    /// Sessions newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<SessionStatus>, limit: usize) -> Vec<SessionSummary> {
        let mut summaries = self.summaries().await;
        summaries.retain(|summary| status.map_or(true, |status| summary.status == status));
        summaries.truncate(limit);
        summaries
    }

    /// Exited sessions whose exit was a failure, newest exit first.
    pub async fn attention(&self, limit: usize) -> Vec<SessionSummary> {
        let mut summaries = self.summaries().await;
        summaries.retain(|summary| {
            summary
                .exit
                .as_ref()
                .is_some_and(PtyExitStatus::is_failure)
        });
        summaries.sort_by(|a, b| b.exited_at.cmp(&a.exited_at));
        summaries.truncate(limit);
        summaries
    }

    /// Asks every live bridge to hang up its child.
    pub async fn shutdown(&self) {
        let handles = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for handle in handles {
            if let Err(err) = self.send_frame(&handle.session_id, BridgeFrame::Close).await {
                debug!(
                    event = "session_shutdown_skipped",
                    session_id = %handle.session_id,
                    reason = %err
                );
            }
        }
    }

    async fn summaries(&self) -> Vec<SessionSummary> {
        let handles = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionControlError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionControlError::NotFound(session_id.to_string()))
    }

    async fn send_frame(
        &self,
        session_id: &str,
        frame: BridgeFrame,
    ) -> Result<(), SessionControlError> {
        let handle = self.handle(session_id).await?;
        let input = {
            let state = handle.state.read().await;
            state
                .input
                .clone()
                .filter(|_| state.status.is_live())
                .ok_or_else(|| SessionControlError::NotLive(session_id.to_string()))?
        };
        input
            .send(frame)
            .await
            .map_err(|_| SessionControlError::NotLive(session_id.to_string()))
    }
}

async fn stdin_loop(
    session_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<BridgeFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let bytes = frame.encode();
        let write = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        };
        if let Err(err) = write.await {
            warn!(event = "session_input_error", session_id = %session_id, error = %err);
            break;
        }
    }
    debug!(event = "session_input_closed", session_id = %session_id);
}

async fn output_loop(handle: Arc<SessionHandle>, mut stdout: ChildStdout, mut child: Child) {
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => handle.record_output(buf[..n].to_vec()).await,
            Err(err) => {
                warn!(
                    event = "session_output_error",
                    session_id = %handle.session_id,
                    error = %err
                );
                break;
            }
        }
    }

    let exit = exit_status(child.wait().await);
    info!(
        event = "session_exited",
        session_id = %handle.session_id,
        code = ?exit.code,
        signal = ?exit.signal
    );
    handle.mark_exited(exit).await;
}

fn exit_status(result: io::Result<ExitStatus>) -> PtyExitStatus {
    let status = match result {
        Ok(status) => status,
        Err(err) => {
            warn!(event = "session_wait_error", error = %err);
            return PtyExitStatus::default();
        }
    };

    if let Some(code) = status.code() {
        return PtyExitStatus {
            code: Some(code),
            signal: signal_from_exit_code(code).map(signal_name),
        };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return PtyExitStatus {
                code: None,
                signal: Some(signal_name(signo)),
            };
        }
    }

    PtyExitStatus::default()
}
