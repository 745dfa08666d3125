use crate::actor::SqliteActorRegistry;
use crate::authority::SqliteAuthorityStore;
use crate::config::DatabaseConfig;
use crate::eventgraph::SqliteEventStore;
use crate::health::{self, Component};
use crate::task::SqliteTaskStore;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::time::Duration;

/// Open the engine database, retrying while the file system or another
/// process holding the lock settles.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let attempts = config.connect_retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                health::mark_ok(Component::Database);
                return Ok(pool);
            }
            Err(error) => {
                tracing::warn!(attempt, attempts, %error, "database not ready");
                health::mark_error(Component::Database, &error);
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                }
            }
        }
    }

    match last_error {
        Some(error) => Err(error).with_context(|| {
            format!(
                "Failed to open database {} after {attempts} attempts",
                config.path.display()
            )
        }),
        None => anyhow::bail!("database connection was never attempted"),
    }
}

/// Single-connection in-memory pool; every store shares the same database.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// All durable stores over one pool, each with its schema ensured.
#[derive(Clone)]
pub struct Stores {
    pub events: SqliteEventStore,
    pub tasks: SqliteTaskStore,
    pub authority: SqliteAuthorityStore,
    pub actors: SqliteActorRegistry,
}

impl Stores {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let events = SqliteEventStore::new(pool.clone())
            .await
            .context("Failed to prepare events table")?;
        let tasks = SqliteTaskStore::new(pool.clone())
            .await
            .context("Failed to prepare tasks table")?;
        let authority = SqliteAuthorityStore::new(pool.clone())
            .await
            .context("Failed to prepare authority tables")?;
        let actors = SqliteActorRegistry::new(pool)
            .await
            .context("Failed to prepare actors table")?;
        Ok(Self {
            events,
            tasks,
            authority,
            actors,
        })
    }
}
