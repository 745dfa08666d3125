use super::{Actor, ActorRegistry, ActorType, StoreResult};
use crate::error::StorageError;
use crate::util::{BoxFuture, format_timestamp, parse_timestamp};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

const ACTOR_COLUMNS: &str = "id, actor_type, name, email, created_at";

#[derive(Clone)]
pub struct SqliteActorRegistry {
    pool: SqlitePool,
}

impl SqliteActorRegistry {
    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS actors (
                 id         TEXT PRIMARY KEY,
                 actor_type TEXT NOT NULL,
                 name       TEXT NOT NULL,
                 email      TEXT,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        for ddl in [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_type_name ON actors(actor_type, name)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_email ON actors(email) WHERE email IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_actors_name ON actors(name)",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_one(&self, clause: &str, binds: &[&str]) -> StoreResult<Option<Actor>> {
        let sql = format!(
            "SELECT {ACTOR_COLUMNS} FROM actors WHERE {clause} ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| map_actor_row(&r)).transpose()
    }
}

fn map_actor_row(row: &SqliteRow) -> StoreResult<Actor> {
    let type_raw: String = row.try_get("actor_type")?;
    let created_raw: String = row.try_get("created_at")?;

    Ok(Actor {
        id: row.try_get("id")?,
        actor_type: type_raw.parse()?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        created_at: parse_timestamp(&created_raw)?,
    })
}

impl ActorRegistry for SqliteActorRegistry {
    fn register<'a>(
        &'a self,
        actor_type: ActorType,
        name: &'a str,
        email: &'a str,
    ) -> BoxFuture<'a, StoreResult<Actor>> {
        Box::pin(async move {
            if !email.is_empty()
                && let Some(existing) = self.find_one("email = $1", &[email]).await?
            {
                return Ok(existing);
            }
            if let Some(existing) = self
                .find_one("actor_type = $1 AND name = $2", &[actor_type.as_str(), name])
                .await?
            {
                return Ok(existing);
            }

            // A concurrent registration may win the race; re-read below.
            sqlx::query(
                "INSERT INTO actors (id, actor_type, name, email, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT DO NOTHING",
            )
            .bind(Uuid::now_v7().to_string())
            .bind(actor_type.as_str())
            .bind(name)
            .bind((!email.is_empty()).then_some(email))
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await?;

            self.find_one("actor_type = $1 AND name = $2", &[actor_type.as_str(), name])
                .await?
                .ok_or_else(|| StorageError::not_found("actor", name))
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Actor>>> {
        Box::pin(async move { self.find_one("id = $1", &[id]).await })
    }

    fn by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<Option<Actor>>> {
        Box::pin(async move { self.find_one("name = $1", &[name]).await })
    }

    fn list(&self) -> BoxFuture<'_, StoreResult<Vec<Actor>>> {
        Box::pin(async move {
            let sql = format!("SELECT {ACTOR_COLUMNS} FROM actors ORDER BY created_at ASC, id ASC");
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            rows.iter().map(map_actor_row).collect()
        })
    }
}
