//! Identity records for humans, agents and system components.

pub mod sqlite;

pub use sqlite::SqliteActorRegistry;

use crate::error::StorageError;
use crate::util::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type StoreResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Human,
    Agent,
    System,
}

impl ActorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(StorageError::Corrupt(format!("unknown actor type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub actor_type: ActorType,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub trait ActorRegistry: Send + Sync {
    /// Return the existing actor matching `email` (when non-empty) or
    /// `(actor_type, name)`, creating it otherwise.
    fn register<'a>(
        &'a self,
        actor_type: ActorType,
        name: &'a str,
        email: &'a str,
    ) -> BoxFuture<'a, StoreResult<Actor>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Actor>>>;

    /// Oldest actor with that name, whatever its type.
    fn by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<Option<Actor>>>;

    fn list(&self) -> BoxFuture<'_, StoreResult<Vec<Actor>>>;
}
