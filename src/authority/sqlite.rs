use super::{AuthorityRequest, AuthorityStore, Level, Policy, RequestStatus, StoreResult};
use crate::error::StorageError;
use crate::util::{BoxFuture, format_timestamp, parse_timestamp};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

const REQUEST_COLUMNS: &str =
    "id, action, description, level, source, status, created_at, resolved_at";
const POLICY_COLUMNS: &str = "id, action, approver_id, level, created_at";

/// SQLite-backed approval requests and policies.
#[derive(Clone)]
pub struct SqliteAuthorityStore {
    pool: SqlitePool,
}

impl SqliteAuthorityStore {
    /// Create a new store with an existing pool and ensure its schema.
    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS approval_requests (
                 id          TEXT PRIMARY KEY,
                 action      TEXT NOT NULL,
                 description TEXT NOT NULL DEFAULT '',
                 level       TEXT NOT NULL,
                 source      TEXT NOT NULL DEFAULT '',
                 status      TEXT NOT NULL DEFAULT 'pending',
                 created_at  TEXT NOT NULL,
                 resolved_at TEXT
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_approval_status
                 ON approval_requests(status, created_at)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS authority_policies (
                 id          TEXT PRIMARY KEY,
                 action      TEXT NOT NULL,
                 approver_id TEXT NOT NULL,
                 level       TEXT NOT NULL,
                 created_at  TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_policy_action ON authority_policies(action)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn policy_for(&self, action: &str) -> StoreResult<Option<Policy>> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM authority_policies WHERE action = $1");
        let row = sqlx::query(&sql)
            .bind(action)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_policy_row(&r)).transpose()
    }
}

fn map_request_row(row: &SqliteRow) -> StoreResult<AuthorityRequest> {
    let level_raw: String = row.try_get("level")?;
    let status_raw: String = row.try_get("status")?;
    let created_raw: String = row.try_get("created_at")?;
    let resolved_raw: Option<String> = row.try_get("resolved_at")?;

    Ok(AuthorityRequest {
        id: row.try_get("id")?,
        action: row.try_get("action")?,
        description: row.try_get("description")?,
        level: level_raw.parse()?,
        source: row.try_get("source")?,
        status: status_raw.parse()?,
        created_at: parse_timestamp(&created_raw)?,
        resolved_at: resolved_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn map_policy_row(row: &SqliteRow) -> StoreResult<Policy> {
    let level_raw: String = row.try_get("level")?;
    let created_raw: String = row.try_get("created_at")?;

    Ok(Policy {
        id: row.try_get("id")?,
        action: row.try_get("action")?,
        approver_id: row.try_get("approver_id")?,
        level: level_raw.parse()?,
        created_at: parse_timestamp(&created_raw)?,
    })
}

impl AuthorityStore for SqliteAuthorityStore {
    fn create<'a>(
        &'a self,
        action: &'a str,
        description: &'a str,
        source: &'a str,
        level: Level,
    ) -> BoxFuture<'a, StoreResult<AuthorityRequest>> {
        Box::pin(async move {
            let id = Uuid::now_v7().to_string();
            let now = format_timestamp(Utc::now());
            let (status, resolved_at) = if level == Level::Notification {
                (RequestStatus::Approved, Some(now.clone()))
            } else {
                (RequestStatus::Pending, None)
            };

            let sql = format!(
                "INSERT INTO approval_requests ({REQUEST_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING {REQUEST_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(&id)
                .bind(action)
                .bind(description)
                .bind(level.as_str())
                .bind(source)
                .bind(status.as_str())
                .bind(&now)
                .bind(resolved_at)
                .fetch_one(&self.pool)
                .await?;
            map_request_row(&row)
        })
    }

    fn resolve<'a>(
        &'a self,
        id: &'a str,
        approved: bool,
    ) -> BoxFuture<'a, StoreResult<AuthorityRequest>> {
        Box::pin(async move {
            let status = if approved {
                RequestStatus::Approved
            } else {
                RequestStatus::Rejected
            };
            let sql = format!(
                "UPDATE approval_requests SET status = $1, resolved_at = $2
                 WHERE id = $3 AND status = 'pending'
                 RETURNING {REQUEST_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(format_timestamp(Utc::now()))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => map_request_row(&row),
                None if self.get(id).await?.is_some() => {
                    Err(StorageError::AlreadyResolved(id.to_string()))
                }
                None => Err(StorageError::not_found("authority request", id)),
            }
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<AuthorityRequest>>> {
        Box::pin(async move {
            let sql = format!("SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| map_request_row(&r)).transpose()
        })
    }

    fn pending(&self) -> BoxFuture<'_, StoreResult<Vec<AuthorityRequest>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM approval_requests
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC"
            );
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            rows.iter().map(map_request_row).collect()
        })
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<AuthorityRequest>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM approval_requests
                 ORDER BY created_at DESC, id DESC
                 LIMIT $1"
            );
            let rows = sqlx::query(&sql)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(map_request_row).collect()
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            let (n,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM approval_requests WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
    }

    fn create_policy<'a>(
        &'a self,
        action: &'a str,
        approver_id: &'a str,
        level: Level,
    ) -> BoxFuture<'a, StoreResult<Policy>> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO authority_policies ({POLICY_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT(action) DO UPDATE SET
                     approver_id = excluded.approver_id,
                     level = excluded.level
                 RETURNING {POLICY_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(Uuid::now_v7().to_string())
                .bind(action)
                .bind(approver_id)
                .bind(level.as_str())
                .bind(format_timestamp(Utc::now()))
                .fetch_one(&self.pool)
                .await?;
            map_policy_row(&row)
        })
    }

    fn match_policy<'a>(&'a self, action: &'a str) -> BoxFuture<'a, StoreResult<Policy>> {
        Box::pin(async move {
            if let Some(policy) = self.policy_for(action).await? {
                return Ok(policy);
            }
            self.policy_for("*")
                .await?
                .ok_or_else(|| StorageError::NoPolicy(action.to_string()))
        })
    }

    fn list_policies(&self) -> BoxFuture<'_, StoreResult<Vec<Policy>>> {
        Box::pin(async move {
            let sql = format!("SELECT {POLICY_COLUMNS} FROM authority_policies ORDER BY action");
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            rows.iter().map(map_policy_row).collect()
        })
    }
}
