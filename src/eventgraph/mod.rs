//! Hash-chained, append-only causal event log.
//!
//! Every decision the engine takes lands here as an [`Event`]. Events are
//! linked by `prev_hash` into a single chain (tamper evident through
//! [`EventStore::verify_chain`]) and by `causes` into a DAG that the
//! recoverer walks to rebuild failure context.

pub mod bus;
pub mod hash;
pub mod recorder;
pub mod sqlite;

pub use bus::{EventBus, EventSubscription};
pub use hash::{HashInput, canonical_json, compute_hash};
pub use recorder::Recorder;
pub use sqlite::SqliteEventStore;

use crate::error::StorageError;
use crate::util::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type StoreResult<T> = Result<T, StorageError>;

/// A single immutable node of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// UUIDv7, time ordered.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Always a JSON object.
    pub content: Value,
    pub causes: Vec<String>,
    pub conversation_id: String,
    pub hash: String,
    pub prev_hash: String,
}

impl Event {
    pub fn ts_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// String field of the content object, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// An event before the log assigns id, timestamp and hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub source: String,
    pub content: Value,
    pub causes: Vec<String>,
    pub conversation_id: String,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            content,
            causes: Vec::new(),
            conversation_id: String::new(),
        }
    }

    pub fn caused_by(mut self, causes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.causes = causes.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }
}

/// Event persistence contract.
///
/// Listing queries return newest first except `by_conversation`, `since`,
/// `ancestors` and `descendants`, which are chronological.
pub trait EventStore: Send + Sync {
    fn append(&self, event: NewEvent) -> BoxFuture<'_, StoreResult<Event>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Event>>>;

    fn recent(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<Event>>>;

    fn by_type<'a>(
        &'a self,
        event_type: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    fn by_source<'a>(&'a self, source: &'a str, limit: usize)
    -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    fn by_conversation<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    /// Events strictly after `after_id`; an empty id starts at the beginning.
    fn since<'a>(&'a self, after_id: &'a str, limit: usize)
    -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    fn ancestors<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    fn descendants<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    fn search<'a>(&'a self, query: &'a str, limit: usize)
    -> BoxFuture<'a, StoreResult<Vec<Event>>>;

    /// Walk the chain; returns the number of verified events.
    fn verify_chain(&self) -> BoxFuture<'_, StoreResult<usize>>;

    fn count(&self) -> BoxFuture<'_, StoreResult<u64>>;

    fn distinct_types(&self) -> BoxFuture<'_, StoreResult<Vec<String>>>;

    fn distinct_sources(&self) -> BoxFuture<'_, StoreResult<Vec<String>>>;
}

/// Drop repeated ids, keeping the first occurrence.
pub(crate) fn dedup_causes(causes: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    causes
        .into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
