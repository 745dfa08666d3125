//! Durable work items.

pub mod sqlite;

pub use sqlite::SqliteTaskStore;

use crate::error::StorageError;
use crate::util::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub type StoreResult<T> = Result<T, StorageError>;

/// Well-known metadata keys.
pub mod meta {
    pub const RETRY_COUNT: &str = "retry_count";
    pub const BLOCKED_REASON: &str = "blocked_reason";
    pub const PREV_FAILURE_REASON: &str = "prev_failure_reason";
    pub const RECOVERY_ATTEMPTED: &str = "recovery_attempted";
    pub const RECOVERED: &str = "recovered";
    pub const RECOVERED_AT: &str = "recovered_at";
    pub const MODEL: &str = "model";
    pub const SELF_IMPROVE: &str = "self_improve";
    pub const AUTHORITY_ID: &str = "authority_id";
    pub const START_COMMIT: &str = "start_commit";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [Self; 4] = [Self::Pending, Self::InProgress, Self::Completed, Self::Blocked];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            other => Err(StorageError::Corrupt(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub source: String,
    /// Empty when unassigned.
    pub assignee: String,
    /// Empty for top-level tasks.
    pub parent_id: String,
    pub blocked_by: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_subtask(&self) -> bool {
        !self.parent_id.is_empty()
    }

    /// Retry counter; absent or malformed values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(meta::RETRY_COUNT)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Fields accepted by [`TaskStore::create`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub subject: String,
    pub description: String,
    /// Defaults to pending.
    pub status: Option<TaskStatus>,
    pub priority: i64,
    pub source: String,
    pub assignee: String,
    pub parent_id: String,
    pub blocked_by: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl NewTask {
    pub fn new(subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = assignee.into();
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub priority: Option<i64>,
    pub blocked_by: Option<Vec<String>>,
    /// Replaces the whole metadata object.
    pub metadata: Option<Map<String, Value>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Task persistence contract.
pub trait TaskStore: Send + Sync {
    fn create(&self, task: NewTask) -> BoxFuture<'_, StoreResult<Task>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Task>>>;

    /// Subtasks in creation order.
    fn by_parent<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Task>>>;

    /// Highest priority first, then oldest first. `None` lists every status.
    fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<Task>>>;

    fn count(&self) -> BoxFuture<'_, StoreResult<u64>>;

    fn pending_count(&self) -> BoxFuture<'_, StoreResult<u64>>;

    /// Apply a partial update and return the post-image.
    fn update<'a>(&'a self, id: &'a str, update: TaskUpdate)
    -> BoxFuture<'a, StoreResult<Task>>;

    fn complete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Task>>;
}
