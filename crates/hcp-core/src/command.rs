//! Validation and canonicalization of the `command` envelope payload.
//!
//! Parsing is fail-closed: a field with a forbidden or malformed value rejects
//! the whole command. The canonical form produced by [`StreamCommand::to_value`]
//! parses back to an equal command.

use crate::{ScopeKind, SessionStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MIN_LIST_LIMIT: u32 = 1;
pub const MAX_LIST_LIMIT: u32 = 10_000;
pub const MAX_LINEAR_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum StreamCommand {
    #[serde(rename = "task.list")]
    TaskList(TaskListQuery),
    #[serde(rename = "task.get")]
    TaskGet(TaskRef),
    #[serde(rename = "task.create")]
    TaskCreate(TaskCreateInput),
    #[serde(rename = "repository.get")]
    RepositoryGet(RepositoryRef),
    #[serde(rename = "session.list")]
    SessionList(SessionListQuery),
    #[serde(rename = "attention.list")]
    AttentionList(AttentionListQuery),
    #[serde(rename = "session.start")]
    SessionStart(SessionStartInput),
    #[serde(rename = "pty.subscribe")]
    PtySubscribe(PtySubscribeInput),
    #[serde(rename = "pty.unsubscribe")]
    PtyUnsubscribe(SessionRef),
    #[serde(rename = "stream.subscribe")]
    StreamSubscribe(StreamSubscribeInput),
    #[serde(rename = "stream.unsubscribe")]
    StreamUnsubscribe(StreamUnsubscribeInput),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_kind: Option<ScopeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreateInput {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<LinearInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinearInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub repository_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttentionListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartInput {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtySubscribeInput {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_cursor: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSubscribeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_cursor: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamUnsubscribeInput {
    pub subscription_id: String,
}

/// Parses an untrusted command value into its canonical form.
///
/// Returns `None` for anything that is not a fully valid command; callers turn
/// that into a `command.failed` envelope for the originating `commandId`.
pub fn parse_command(raw: &Value) -> Option<StreamCommand> {
    if !raw.is_object() {
        return None;
    }
    let command: StreamCommand = serde_json::from_value(raw.clone()).ok()?;
    command.normalize().ok()
}

impl StreamCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            StreamCommand::TaskList(_) => "task.list",
            StreamCommand::TaskGet(_) => "task.get",
            StreamCommand::TaskCreate(_) => "task.create",
            StreamCommand::RepositoryGet(_) => "repository.get",
            StreamCommand::SessionList(_) => "session.list",
            StreamCommand::AttentionList(_) => "attention.list",
            StreamCommand::SessionStart(_) => "session.start",
            StreamCommand::PtySubscribe(_) => "pty.subscribe",
            StreamCommand::PtyUnsubscribe(_) => "pty.unsubscribe",
            StreamCommand::StreamSubscribe(_) => "stream.subscribe",
            StreamCommand::StreamUnsubscribe(_) => "stream.unsubscribe",
        }
    }

    /// Commands whose effect is tied to the issuing connection rather than to
    /// shared daemon state.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            StreamCommand::PtySubscribe(_)
                | StreamCommand::PtyUnsubscribe(_)
                | StreamCommand::StreamSubscribe(_)
                | StreamCommand::StreamUnsubscribe(_)
        )
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn normalize(self) -> Result<Self, Rejected> {
        let command = match self {
            StreamCommand::TaskList(query) => StreamCommand::TaskList(TaskListQuery {
                tenant_id: optional(query.tenant_id)?,
                user_id: optional(query.user_id)?,
                workspace_id: optional(query.workspace_id)?,
                repository_id: optional(query.repository_id)?,
                project_id: optional(query.project_id)?,
                scope_kind: query.scope_kind,
                status: query.status,
                limit: list_limit(query.limit)?,
            }),
            StreamCommand::TaskGet(task) => StreamCommand::TaskGet(TaskRef {
                task_id: required(task.task_id)?,
            }),
            StreamCommand::TaskCreate(input) => StreamCommand::TaskCreate(TaskCreateInput {
                title: required(input.title)?,
                description: input.description,
                tenant_id: optional(input.tenant_id)?,
                user_id: optional(input.user_id)?,
                workspace_id: optional(input.workspace_id)?,
                repository_id: optional(input.repository_id)?,
                project_id: optional(input.project_id)?,
                status: input.status,
                linear: linear(input.linear)?,
            }),
            StreamCommand::RepositoryGet(repository) => {
                StreamCommand::RepositoryGet(RepositoryRef {
                    repository_id: required(repository.repository_id)?,
                })
            }
            StreamCommand::SessionList(query) => StreamCommand::SessionList(SessionListQuery {
                status: query.status,
                limit: list_limit(query.limit)?,
            }),
            StreamCommand::AttentionList(query) => {
                StreamCommand::AttentionList(AttentionListQuery {
                    limit: list_limit(query.limit)?,
                })
            }
            StreamCommand::SessionStart(input) => {
                let program = input.command.first().ok_or(Rejected)?;
                if program.trim().is_empty() {
                    return Err(Rejected);
                }
                let (cols, rows) = match (input.cols, input.rows) {
                    (Some(cols), Some(rows)) if cols > 0 && rows > 0 => (Some(cols), Some(rows)),
                    (None, None) => (None, None),
                    _ => return Err(Rejected),
                };
                StreamCommand::SessionStart(SessionStartInput {
                    command: input.command,
                    cwd: optional(input.cwd)?,
                    cols,
                    rows,
                })
            }
            StreamCommand::PtySubscribe(input) => StreamCommand::PtySubscribe(PtySubscribeInput {
                session_id: required(input.session_id)?,
                after_cursor: input.after_cursor,
            }),
            StreamCommand::PtyUnsubscribe(session) => StreamCommand::PtyUnsubscribe(SessionRef {
                session_id: required(session.session_id)?,
            }),
            StreamCommand::StreamSubscribe(input) => StreamCommand::StreamSubscribe(input),
            StreamCommand::StreamUnsubscribe(input) => {
                StreamCommand::StreamUnsubscribe(StreamUnsubscribeInput {
                    subscription_id: required(input.subscription_id)?,
                })
            }
        };
        Ok(command)
    }
}

struct Rejected;

fn required(value: String) -> Result<String, Rejected> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Rejected);
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Result<Option<String>, Rejected> {
    value.map(required).transpose()
}

fn list_limit(limit: Option<u32>) -> Result<Option<u32>, Rejected> {
    match limit {
        Some(value) if !(MIN_LIST_LIMIT..=MAX_LIST_LIMIT).contains(&value) => Err(Rejected),
        other => Ok(other),
    }
}

fn linear(input: Option<LinearInput>) -> Result<Option<LinearInput>, Rejected> {
    let Some(input) = input else {
        return Ok(None);
    };
    if input.priority.is_some_and(|priority| priority > MAX_LINEAR_PRIORITY) {
        return Err(Rejected);
    }
    let issue_id = optional(input.issue_id)?;
    if issue_id.is_none() && input.priority.is_none() {
        return Ok(None);
    }
    Ok(Some(LinearInput {
        issue_id,
        priority: input.priority,
    }))
}
