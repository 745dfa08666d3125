use super::hash::{HashInput, canonical_json, compute_hash};
use super::{Event, EventStore, NewEvent, StoreResult, dedup_causes};
use crate::error::StorageError;
use crate::util::BoxFuture;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const EVENT_COLUMNS: &str =
    "id, event_type, ts_nanos, source, content, causes, conversation_id, hash, prev_hash";

/// SQLite-backed event log.
///
/// Appends are serialised by an async mutex held across a transaction that
/// reads the tail and inserts the new row; the unique `prev_hash` index turns
/// any write that slips past the mutex (another process) into a constraint
/// error instead of a fork.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    append_lock: Arc<Mutex<()>>,
}

impl SqliteEventStore {
    /// Create a new store with an existing pool and ensure its schema.
    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                 id              TEXT PRIMARY KEY,
                 event_type      TEXT NOT NULL,
                 ts_nanos        INTEGER NOT NULL,
                 source          TEXT NOT NULL,
                 content         TEXT NOT NULL,
                 causes          TEXT NOT NULL DEFAULT '[]',
                 conversation_id TEXT NOT NULL DEFAULT '',
                 hash            TEXT NOT NULL,
                 prev_hash       TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_causes (
                 event_id TEXT NOT NULL,
                 cause_id TEXT NOT NULL,
                 PRIMARY KEY (event_id, cause_id)
             )",
        )
        .execute(&pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
            "CREATE INDEX IF NOT EXISTS idx_events_source ON events(source)",
            "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_nanos, id)",
            "CREATE INDEX IF NOT EXISTS idx_events_conversation
                 ON events(conversation_id) WHERE conversation_id <> ''",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_prev_hash ON events(prev_hash)",
            "CREATE INDEX IF NOT EXISTS idx_event_causes_cause ON event_causes(cause_id)",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ordered, limited listing. `filter` is a condition on `$1` plus the
    /// value bound to it; without one every event qualifies.
    async fn fetch_where(
        &self,
        filter: Option<(&str, &str)>,
        order: &str,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let rows = match filter {
            Some((condition, value)) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE {condition} ORDER BY {order} LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(value)
                    .bind(sql_limit(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY {order} LIMIT $1");
                sqlx::query(&sql)
                    .bind(sql_limit(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(map_event_row).collect()
    }

    async fn children_of(&self, id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT event_id FROM event_causes WHERE cause_id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_id").map_err(StorageError::from))
            .collect()
    }

    async fn require(&self, id: &str) -> StoreResult<Event> {
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::not_found("event", id))
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_event_row(row: &SqliteRow) -> StoreResult<Event> {
    let content_raw: String = row.try_get("content")?;
    let causes_raw: String = row.try_get("causes")?;
    let ts_nanos: i64 = row.try_get("ts_nanos")?;

    Ok(Event {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        timestamp: DateTime::from_timestamp_nanos(ts_nanos),
        source: row.try_get("source")?,
        content: serde_json::from_str(&content_raw)?,
        causes: serde_json::from_str(&causes_raw)?,
        conversation_id: row.try_get("conversation_id")?,
        hash: row.try_get("hash")?,
        prev_hash: row.try_get("prev_hash")?,
    })
}

/// Escape LIKE wildcards so user queries match literally.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn sort_chronological(events: &mut [Event]) {
    events.sort_by(|a, b| (a.ts_nanos(), &a.id).cmp(&(b.ts_nanos(), &b.id)));
}

impl EventStore for SqliteEventStore {
    fn append(&self, event: NewEvent) -> BoxFuture<'_, StoreResult<Event>> {
        Box::pin(async move {
            if !event.content.is_object() {
                return Err(StorageError::InvalidContent(format!(
                    "{} content must be a JSON object",
                    event.event_type
                )));
            }
            let canonical = canonical_json(&event.content);
            let causes = dedup_causes(event.causes);
            let causes_json = serde_json::to_string(&causes)?;

            let _guard = self.append_lock.lock().await;
            let mut tx = self.pool.begin().await?;

            let tail = sqlx::query(
                "SELECT hash, ts_nanos FROM events ORDER BY ts_nanos DESC, id DESC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await?;
            let (prev_hash, last_ts) = match tail {
                Some(row) => (row.try_get::<String, _>("hash")?, row.try_get::<i64, _>("ts_nanos")?),
                None => (String::new(), i64::MIN),
            };

            // Strictly increasing timestamps keep (ts, id) order equal to chain order.
            let now = Utc::now().timestamp_nanos_opt().ok_or_else(|| {
                StorageError::InvalidContent("clock outside representable range".into())
            })?;
            let ts_nanos = if now > last_ts { now } else { last_ts.saturating_add(1) };
            let id = Uuid::now_v7().to_string();

            let hash = compute_hash(&HashInput {
                prev_hash: &prev_hash,
                id: &id,
                event_type: &event.event_type,
                source: &event.source,
                conversation_id: &event.conversation_id,
                ts_nanos,
                canonical_content: &canonical,
            });

            sqlx::query(
                "INSERT INTO events
                     (id, event_type, ts_nanos, source, content, causes, conversation_id, hash, prev_hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&id)
            .bind(&event.event_type)
            .bind(ts_nanos)
            .bind(&event.source)
            .bind(&canonical)
            .bind(&causes_json)
            .bind(&event.conversation_id)
            .bind(&hash)
            .bind(&prev_hash)
            .execute(&mut *tx)
            .await?;

            for cause in &causes {
                sqlx::query("INSERT INTO event_causes (event_id, cause_id) VALUES ($1, $2)")
                    .bind(&id)
                    .bind(cause)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;

            Ok(Event {
                id,
                event_type: event.event_type,
                timestamp: DateTime::from_timestamp_nanos(ts_nanos),
                source: event.source,
                content: event.content,
                causes,
                conversation_id: event.conversation_id,
                hash,
                prev_hash,
            })
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Event>>> {
        Box::pin(async move {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| map_event_row(&r)).transpose()
        })
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            self.fetch_where(None, "ts_nanos DESC, id DESC", limit)
                .await
        })
    }

    fn by_type<'a>(
        &'a self,
        event_type: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            self.fetch_where(
                Some(("event_type = $1", event_type)),
                "ts_nanos DESC, id DESC",
                limit,
            )
            .await
        })
    }

    fn by_source<'a>(
        &'a self,
        source: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            self.fetch_where(Some(("source = $1", source)), "ts_nanos DESC, id DESC", limit)
                .await
        })
    }

    fn by_conversation<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            self.fetch_where(
                Some(("conversation_id = $1", conversation_id)),
                "ts_nanos ASC, id ASC",
                limit,
            )
            .await
        })
    }

    fn since<'a>(
        &'a self,
        after_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            if after_id.is_empty() {
                return self
                    .fetch_where(None, "ts_nanos ASC, id ASC", limit)
                    .await;
            }
            let anchor = self.require(after_id).await?;
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE ts_nanos > $1 OR (ts_nanos = $1 AND id > $2)
                 ORDER BY ts_nanos ASC, id ASC
                 LIMIT $3"
            );
            let rows = sqlx::query(&sql)
                .bind(anchor.ts_nanos())
                .bind(&anchor.id)
                .bind(sql_limit(limit))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(map_event_row).collect()
        })
    }

    fn ancestors<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            let start = self.require(id).await?;
            let mut visited: HashSet<String> = HashSet::from([start.id.clone()]);
            let mut queue: VecDeque<(String, usize)> =
                start.causes.iter().map(|c| (c.clone(), 1)).collect();
            let mut found = Vec::new();

            while let Some((current, depth)) = queue.pop_front() {
                if depth > max_depth || !visited.insert(current.clone()) {
                    continue;
                }
                // Causes may name events that were never stored.
                let Some(event) = self.get(&current).await? else {
                    continue;
                };
                queue.extend(event.causes.iter().map(|c| (c.clone(), depth + 1)));
                found.push(event);
            }

            sort_chronological(&mut found);
            Ok(found)
        })
    }

    fn descendants<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            let start = self.require(id).await?;
            let mut visited: HashSet<String> = HashSet::from([start.id.clone()]);
            let mut queue: VecDeque<(String, usize)> = self
                .children_of(&start.id)
                .await?
                .into_iter()
                .map(|c| (c, 1))
                .collect();
            let mut found = Vec::new();

            while let Some((current, depth)) = queue.pop_front() {
                if depth > max_depth || !visited.insert(current.clone()) {
                    continue;
                }
                let Some(event) = self.get(&current).await? else {
                    continue;
                };
                queue.extend(
                    self.children_of(&event.id)
                        .await?
                        .into_iter()
                        .map(|c| (c, depth + 1)),
                );
                found.push(event);
            }

            sort_chronological(&mut found);
            Ok(found)
        })
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            let pattern = like_pattern(query);
            self.fetch_where(
                Some((
                    "lower(event_type) LIKE $1 ESCAPE '\\'
                        OR lower(source) LIKE $1 ESCAPE '\\'
                        OR lower(content) LIKE $1 ESCAPE '\\'",
                    &pattern,
                )),
                "ts_nanos DESC, id DESC",
                limit,
            )
            .await
        })
    }

    fn verify_chain(&self) -> BoxFuture<'_, StoreResult<usize>> {
        Box::pin(async move {
            let sql =
                format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY ts_nanos ASC, id ASC");
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

            let mut running = String::new();
            for (position, row) in rows.iter().enumerate() {
                let raw_content: String = row.try_get("content")?;
                let event = map_event_row(row)?;

                if event.prev_hash != running {
                    return Err(StorageError::ChainBroken {
                        position,
                        event_id: event.id,
                        detail: format!(
                            "prev_hash {:?} does not match preceding hash {running:?}",
                            event.prev_hash
                        ),
                    });
                }

                let recanonical = canonical_json(&event.content);
                let matches = [recanonical.as_str(), raw_content.as_str()]
                    .into_iter()
                    .any(|content| {
                        compute_hash(&HashInput {
                            prev_hash: &running,
                            id: &event.id,
                            event_type: &event.event_type,
                            source: &event.source,
                            conversation_id: &event.conversation_id,
                            ts_nanos: event.ts_nanos(),
                            canonical_content: content,
                        }) == event.hash
                    });
                if !matches {
                    return Err(StorageError::ChainBroken {
                        position,
                        event_id: event.id,
                        detail: "stored hash does not match recomputed hash".into(),
                    });
                }

                running = event.hash;
            }

            Ok(rows.len())
        })
    }

    fn count(&self) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
                .fetch_one(&self.pool)
                .await?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
    }

    fn distinct_types(&self) -> BoxFuture<'_, StoreResult<Vec<String>>> {
        Box::pin(async move {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT event_type FROM events ORDER BY event_type")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(t,)| t).collect())
        })
    }

    fn distinct_sources(&self) -> BoxFuture<'_, StoreResult<Vec<String>>> {
        Box::pin(async move {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT source FROM events ORDER BY source")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(s,)| s).collect())
        })
    }
}
