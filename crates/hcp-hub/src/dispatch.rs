use crate::sessions::SessionHost;
use crate::store::TaskStore;
use hcp_core::command::{StreamCommand, MAX_LIST_LIMIT};
use hcp_core::subscription::SessionControlError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error(transparent)]
    Session(#[from] SessionControlError),
    #[error("{0} is bound to a connection")]
    ConnectionScoped(&'static str),
    #[error("result encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Executes commands that act on shared hub state.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    sessions: Arc<SessionHost>,
}

impl Dispatcher {
    pub fn new(store: Arc<TaskStore>, sessions: Arc<SessionHost>) -> Self {
        Self { store, sessions }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionHost> {
        &self.sessions
    }

    pub async fn execute(&self, command: StreamCommand) -> Result<Value, DispatchError> {
        let command_type = command.command_type();
        match command {
            StreamCommand::TaskList(query) => {
                let tasks = self.store.list_tasks(&query).await;
                keyed("tasks", &tasks)
            }
            StreamCommand::TaskGet(task) => {
                let record = self
                    .store
                    .task(&task.task_id)
                    .await
                    .ok_or(DispatchError::TaskNotFound(task.task_id))?;
                keyed("task", &record)
            }
            StreamCommand::TaskCreate(input) => {
                let record = self.store.create_task(input).await;
                keyed("task", &record)
            }
            StreamCommand::RepositoryGet(repository) => {
                let record = self
                    .store
                    .repository(&repository.repository_id)
                    .await
                    .ok_or(DispatchError::RepositoryNotFound(repository.repository_id))?;
                keyed("repository", &record)
            }
            StreamCommand::SessionList(query) => {
                let sessions = self
                    .sessions
                    .list(query.status, list_limit(query.limit))
                    .await;
                keyed("sessions", &sessions)
            }
            StreamCommand::AttentionList(query) => {
                let sessions = self.sessions.attention(list_limit(query.limit)).await;
                keyed("sessions", &sessions)
            }
            StreamCommand::SessionStart(input) => {
                let session_id = self.sessions.start(input).await?;
                keyed("sessionId", &session_id)
            }
            StreamCommand::PtySubscribe(_)
            | StreamCommand::PtyUnsubscribe(_)
            | StreamCommand::StreamSubscribe(_)
            | StreamCommand::StreamUnsubscribe(_) => {
                Err(DispatchError::ConnectionScoped(command_type))
            }
        }
    }
}

fn list_limit(limit: Option<u32>) -> usize {
    limit.unwrap_or(MAX_LIST_LIMIT) as usize
}

/// `{ "<key>": value }`, the shape every command result takes.
pub fn keyed<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Value, DispatchError> {
    let mut map = Map::new();
    map.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionHostConfig;
    use hcp_core::command::parse_command;
    use serde_json::json;
    use std::path::Path;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(TaskStore::default()),
            Arc::new(SessionHost::new(SessionHostConfig::new("/bin/sh"))),
        )
    }

    async fn run(dispatcher: &Dispatcher, raw: Value) -> Result<Value, DispatchError> {
        let command = parse_command(&raw).expect("valid command");
        dispatcher.execute(command).await
    }

    #[tokio::test]
    async fn create_then_get_and_list_tasks() {
        let dispatcher = dispatcher();
        let created = run(
            &dispatcher,
            json!({"type": "task.create", "title": "  Write docs ", "status": "queued"}),
        )
        .await
        .expect("create");
        let task = &created["task"];
        assert_eq!(task["title"], "Write docs");
        assert_eq!(task["status"], "ready");
        let task_id = task["taskId"].as_str().expect("task id").to_string();

        let fetched = run(&dispatcher, json!({"type": "task.get", "taskId": task_id}))
            .await
            .expect("get");
        assert_eq!(&fetched["task"], task);

        let listed = run(&dispatcher, json!({"type": "task.list", "status": "ready"}))
            .await
            .expect("list");
        assert_eq!(listed["tasks"].as_array().map(Vec::len), Some(1));

        let drafts = run(&dispatcher, json!({"type": "task.list", "status": "draft"}))
            .await
            .expect("list drafts");
        assert_eq!(drafts["tasks"], json!([]));
    }

    #[tokio::test]
    async fn missing_records_fail_with_their_id() {
        let dispatcher = dispatcher();
        let err = run(&dispatcher, json!({"type": "task.get", "taskId": "task-x"}))
            .await
            .expect_err("missing task");
        assert_eq!(err.to_string(), "task not found: task-x");

        let err = run(
            &dispatcher,
            json!({"type": "repository.get", "repositoryId": "repo-x"}),
        )
        .await
        .expect_err("missing repository");
        assert_eq!(err.to_string(), "repository not found: repo-x");
    }

    #[tokio::test]
    async fn repository_get_returns_registered_checkout() {
        let dispatcher = dispatcher();
        let record = dispatcher
            .store()
            .register_repository(Path::new("/srv/repo"))
            .await;
        let result = run(
            &dispatcher,
            json!({"type": "repository.get", "repositoryId": record.repository_id}),
        )
        .await
        .expect("repository");
        assert_eq!(result["repository"]["path"], "/srv/repo");
        assert_eq!(result["repository"]["name"], "repo");
    }

    #[tokio::test]
    async fn connection_scoped_commands_are_refused() {
        let dispatcher = dispatcher();
        let err = run(&dispatcher, json!({"type": "stream.subscribe"}))
            .await
            .expect_err("connection scoped");
        assert!(matches!(err, DispatchError::ConnectionScoped("stream.subscribe")));
    }

    #[tokio::test]
    async fn session_errors_keep_their_wire_text() {
        let err = DispatchError::from(SessionControlError::NotLive("s-1".to_string()));
        assert_eq!(err.to_string(), "session not live: s-1");

        let dispatcher = dispatcher();
        let listed = run(&dispatcher, json!({"type": "session.list", "status": "running"}))
            .await
            .expect("session list");
        assert_eq!(listed, json!({"sessions": []}));
        let attention = run(&dispatcher, json!({"type": "attention.list", "limit": 5}))
            .await
            .expect("attention list");
        assert_eq!(attention, json!({"sessions": []}));
    }
}
