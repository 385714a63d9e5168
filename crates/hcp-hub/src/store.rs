use chrono::{DateTime, Utc};
use hcp_core::command::{TaskCreateInput, TaskListQuery, MAX_LIST_LIMIT};
use hcp_core::envelope::EventRecord;
use hcp_core::{ScopeKind, TaskStatus};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OBSERVED_LOG_MAX: usize = 1024;
const OBSERVED_CHANNEL_CAPACITY: usize = 256;

pub const EVENT_TASK_CREATED: &str = "task-created";
pub const EVENT_REPOSITORY_REGISTERED: &str = "repository-registered";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub repository_id: Option<String>,
    pub project_id: Option<String>,
    pub linear_issue_id: Option<String>,
    pub linear_priority: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn scope_kind(&self) -> ScopeKind {
        if self.project_id.is_some() {
            ScopeKind::Project
        } else if self.repository_id.is_some() {
            ScopeKind::Repository
        } else {
            ScopeKind::Global
        }
    }

    fn matches(&self, query: &TaskListQuery) -> bool {
        fn same(filter: &Option<String>, value: &Option<String>) -> bool {
            filter.is_none() || filter == value
        }

        same(&query.tenant_id, &self.tenant_id)
            && same(&query.user_id, &self.user_id)
            && same(&query.workspace_id, &self.workspace_id)
            && same(&query.repository_id, &self.repository_id)
            && same(&query.project_id, &self.project_id)
            && query.scope_kind.map_or(true, |kind| kind == self.scope_kind())
            && query.status.map_or(true, |status| status == self.status)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub repository_id: String,
    pub name: String,
    pub path: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub cursor: u64,
    pub event: EventRecord,
}

#[derive(Default)]
struct Records {
    tasks: Vec<TaskRecord>,
    repositories: BTreeMap<String, RepositoryRecord>,
}

struct ObservedLog {
    last_cursor: u64,
    events: VecDeque<ObservedEvent>,
    sender: broadcast::Sender<ObservedEvent>,
}

impl ObservedLog {
    fn after(&self, after_cursor: Option<u64>) -> Vec<ObservedEvent> {
        self.events
            .iter()
            .filter(|entry| after_cursor.map_or(true, |after| entry.cursor > after))
            .cloned()
            .collect()
    }
}

/// In-memory tasks and repositories plus the bounded observed-event log that
/// `stream.subscribe` replays from.
pub struct TaskStore {
    records: RwLock<Records>,
    observed: RwLock<ObservedLog>,
    observed_max: usize,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(OBSERVED_LOG_MAX)
    }
}

impl TaskStore {
    pub fn new(observed_max: usize) -> Self {
        let (sender, _) = broadcast::channel(OBSERVED_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(Records::default()),
            observed: RwLock::new(ObservedLog {
                last_cursor: 0,
                events: VecDeque::new(),
                sender,
            }),
            observed_max: observed_max.max(1),
        }
    }

    /// Registers a local checkout. Registering the same path twice returns
    /// the existing record without a second event.
    pub async fn register_repository(&self, path: &Path) -> RepositoryRecord {
        let repository_id = repository_id_for(path);
        let record = {
            let mut records = self.records.write().await;
            if let Some(existing) = records.repositories.get(&repository_id) {
                return existing.clone();
            }
            let record = RepositoryRecord {
                repository_id: repository_id.clone(),
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                path: path.display().to_string(),
                registered_at: Utc::now(),
            };
            records
                .repositories
                .insert(repository_id.clone(), record.clone());
            record
        };

        info!(
            event = "repository_registered",
            repository_id = %record.repository_id,
            path = %record.path
        );
        self.publish(EVENT_REPOSITORY_REGISTERED, &record).await;
        record
    }

    pub async fn repository(&self, repository_id: &str) -> Option<RepositoryRecord> {
        self.records
            .read()
            .await
            .repositories
            .get(repository_id)
            .cloned()
    }

    pub async fn create_task(&self, input: TaskCreateInput) -> TaskRecord {
        let (linear_issue_id, linear_priority) = match input.linear {
            Some(linear) => (linear.issue_id, linear.priority),
            None => (None, None),
        };
        let now = Utc::now();
        let record = TaskRecord {
            task_id: format!("task-{}", Uuid::new_v4().simple()),
            title: input.title,
            description: input.description,
            status: input.status.unwrap_or_default(),
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            workspace_id: input.workspace_id,
            repository_id: input.repository_id,
            project_id: input.project_id,
            linear_issue_id,
            linear_priority,
            created_at: now,
            updated_at: now,
        };
        self.records.write().await.tasks.push(record.clone());

        debug!(event = "task_created", task_id = %record.task_id, status = %record.status);
        self.publish(EVENT_TASK_CREATED, &record).await;
        record
    }

    pub async fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.records
            .read()
            .await
            .tasks
            .iter()
            .find(|task| task.task_id == task_id)
            .cloned()
    }

    /// Tasks matching every given filter, oldest first.
    pub async fn list_tasks(&self, query: &TaskListQuery) -> Vec<TaskRecord> {
        let limit = query.limit.unwrap_or(MAX_LIST_LIMIT) as usize;
        self.records
            .read()
            .await
            .tasks
            .iter()
            .filter(|task| task.matches(query))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Events retained after `after_cursor` together with a receiver for
    /// everything published later. Both are taken under one lock so the
    /// replay and the live feed neither overlap nor leave a gap.
    pub async fn subscribe_observed(
        &self,
        after_cursor: Option<u64>,
    ) -> (Vec<ObservedEvent>, broadcast::Receiver<ObservedEvent>) {
        let observed = self.observed.read().await;
        let receiver = observed.sender.subscribe();
        (observed.after(after_cursor), receiver)
    }

    /// Retained events after `cursor`, used to catch up a lagged receiver.
    pub async fn observed_after(&self, cursor: u64) -> Vec<ObservedEvent> {
        self.observed.read().await.after(Some(cursor))
    }

    pub async fn last_cursor(&self) -> u64 {
        self.observed.read().await.last_cursor
    }

    async fn publish<T: Serialize>(&self, event_type: &str, record: &T) {
        let record = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "observed_encode_error", event_type, error = %err);
                Value::Null
            }
        };

        let mut observed = self.observed.write().await;
        observed.last_cursor += 1;
        let entry = ObservedEvent {
            cursor: observed.last_cursor,
            event: EventRecord {
                event_type: event_type.to_string(),
                record,
            },
        };
        observed.events.push_back(entry.clone());
        while observed.events.len() > self.observed_max {
            observed.events.pop_front();
        }
        // No receivers is fine; the log still replays it.
        let _ = observed.sender.send(entry);
    }
}

/// Stable id for a checkout path: `repo-` and the first 12 hex digits of the
/// path's SHA-256.
pub fn repository_id_for(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex = digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("repo-{hex}")
}
