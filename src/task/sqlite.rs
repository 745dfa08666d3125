use super::{NewTask, StoreResult, Task, TaskStatus, TaskStore, TaskUpdate};
use crate::error::StorageError;
use crate::util::{BoxFuture, format_timestamp, parse_timestamp};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, subject, description, status, priority, source, assignee, \
     parent_id, blocked_by, metadata, created_at, updated_at, completed_at";

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new store with an existing pool and ensure its schema.
    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                 id           TEXT PRIMARY KEY,
                 subject      TEXT NOT NULL,
                 description  TEXT NOT NULL DEFAULT '',
                 status       TEXT NOT NULL DEFAULT 'pending',
                 priority     INTEGER NOT NULL DEFAULT 0,
                 source       TEXT NOT NULL DEFAULT '',
                 assignee     TEXT NOT NULL DEFAULT '',
                 parent_id    TEXT NOT NULL DEFAULT '',
                 blocked_by   TEXT NOT NULL DEFAULT '[]',
                 metadata     TEXT NOT NULL DEFAULT '{}',
                 created_at   TEXT NOT NULL,
                 updated_at   TEXT NOT NULL,
                 completed_at TEXT
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id) WHERE parent_id <> ''",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn count_where(&self, status: Option<TaskStatus>) -> StoreResult<u64> {
        let (n,): (i64,) = match status {
            Some(status) => {
                sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM tasks")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

fn map_task_row(row: &SqliteRow) -> StoreResult<Task> {
    let status_raw: String = row.try_get("status")?;
    let blocked_by_raw: String = row.try_get("blocked_by")?;
    let metadata_raw: String = row.try_get("metadata")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;
    let completed_raw: Option<String> = row.try_get("completed_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        description: row.try_get("description")?,
        status: status_raw.parse()?,
        priority: row.try_get("priority")?,
        source: row.try_get("source")?,
        assignee: row.try_get("assignee")?,
        parent_id: row.try_get("parent_id")?,
        blocked_by: serde_json::from_str(&blocked_by_raw)?,
        // Metadata that is not an object is treated as empty.
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        created_at: parse_timestamp(&created_raw)?,
        updated_at: parse_timestamp(&updated_raw)?,
        completed_at: completed_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, task: NewTask) -> BoxFuture<'_, StoreResult<Task>> {
        Box::pin(async move {
            let id = Uuid::now_v7().to_string();
            let now = format_timestamp(Utc::now());
            let status = task.status.unwrap_or(TaskStatus::Pending);
            let completed_at = (status == TaskStatus::Completed).then(|| now.clone());

            sqlx::query(
                "INSERT INTO tasks (id, subject, description, status, priority, source, assignee,
                                    parent_id, blocked_by, metadata, created_at, updated_at, completed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, $12)",
            )
            .bind(&id)
            .bind(&task.subject)
            .bind(&task.description)
            .bind(status.as_str())
            .bind(task.priority)
            .bind(&task.source)
            .bind(&task.assignee)
            .bind(&task.parent_id)
            .bind(serde_json::to_string(&task.blocked_by)?)
            .bind(serde_json::to_string(&task.metadata)?)
            .bind(&now)
            .bind(completed_at)
            .execute(&self.pool)
            .await?;

            self.get(&id)
                .await?
                .ok_or_else(|| StorageError::not_found("task", id))
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Task>>> {
        Box::pin(async move {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| map_task_row(&r)).transpose()
        })
    }

    fn by_parent<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Task>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = $1
                 ORDER BY created_at ASC, id ASC"
            );
            let rows = sqlx::query(&sql)
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(map_task_row).collect()
        })
    }

    fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<Task>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE $1 IS NULL OR status = $1
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT $2"
            );
            let rows = sqlx::query(&sql)
                .bind(status.map(TaskStatus::as_str))
                .bind(sql_limit(limit))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(map_task_row).collect()
        })
    }

    fn count(&self) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(self.count_where(None))
    }

    fn pending_count(&self) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(self.count_where(Some(TaskStatus::Pending)))
    }

    fn update<'a>(
        &'a self,
        id: &'a str,
        update: TaskUpdate,
    ) -> BoxFuture<'a, StoreResult<Task>> {
        Box::pin(async move {
            let now = format_timestamp(Utc::now());
            let blocked_by = update
                .blocked_by
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata = update
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            // completed_at follows the resulting status.
            let sql = format!(
                "UPDATE tasks SET
                     status       = COALESCE($1, status),
                     subject      = COALESCE($2, subject),
                     description  = COALESCE($3, description),
                     assignee     = COALESCE($4, assignee),
                     priority     = COALESCE($5, priority),
                     blocked_by   = COALESCE($6, blocked_by),
                     metadata     = COALESCE($7, metadata),
                     updated_at   = $8,
                     completed_at = CASE
                         WHEN COALESCE($1, status) = 'completed' THEN COALESCE(completed_at, $8)
                         ELSE NULL
                     END
                 WHERE id = $9
                 RETURNING {TASK_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(update.status.map(TaskStatus::as_str))
                .bind(update.subject)
                .bind(update.description)
                .bind(update.assignee)
                .bind(update.priority)
                .bind(blocked_by)
                .bind(metadata)
                .bind(&now)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => map_task_row(&row),
                None => Err(StorageError::not_found("task", id)),
            }
        })
    }

    fn complete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Task>> {
        Box::pin(async move {
            let now = format_timestamp(Utc::now());
            let sql = format!(
                "UPDATE tasks SET status = 'completed', updated_at = $1, completed_at = $1
                 WHERE id = $2
                 RETURNING {TASK_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(&now)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => map_task_row(&row),
                None => Err(StorageError::not_found("task", id)),
            }
        })
    }
}
