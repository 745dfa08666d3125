//! Approval requests and the policies that route them.

pub mod sqlite;

pub use sqlite::SqliteAuthorityStore;

use crate::error::StorageError;
use crate::util::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StorageError>;

/// How long a recommended request waits before the engine approves it.
pub const RECOMMENDED_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Waits for an explicit decision.
    Required,
    /// Approved automatically after [`RECOMMENDED_TIMEOUT`].
    Recommended,
    /// Approved on creation.
    Notification,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Recommended => "recommended",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "required" => Ok(Self::Required),
            "recommended" => Ok(Self::Recommended),
            "notification" => Ok(Self::Notification),
            other => Err(StorageError::Corrupt(format!("unknown authority level: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(StorageError::Corrupt(format!("unknown request status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRequest {
    pub id: String,
    pub action: String,
    pub description: String,
    pub level: Level,
    pub source: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AuthorityRequest {
    /// Time since creation, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    /// Exact action name or `*`.
    pub action: String,
    pub approver_id: String,
    pub level: Level,
    pub created_at: DateTime<Utc>,
}

/// Authority persistence contract.
pub trait AuthorityStore: Send + Sync {
    fn create<'a>(
        &'a self,
        action: &'a str,
        description: &'a str,
        source: &'a str,
        level: Level,
    ) -> BoxFuture<'a, StoreResult<AuthorityRequest>>;

    /// Move a pending request to approved or rejected, exactly once.
    fn resolve<'a>(
        &'a self,
        id: &'a str,
        approved: bool,
    ) -> BoxFuture<'a, StoreResult<AuthorityRequest>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<AuthorityRequest>>>;

    /// Oldest first.
    fn pending(&self) -> BoxFuture<'_, StoreResult<Vec<AuthorityRequest>>>;

    /// Newest first.
    fn recent(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<AuthorityRequest>>>;

    fn pending_count(&self) -> BoxFuture<'_, StoreResult<u64>>;

    /// Insert or replace the policy for `action`.
    fn create_policy<'a>(
        &'a self,
        action: &'a str,
        approver_id: &'a str,
        level: Level,
    ) -> BoxFuture<'a, StoreResult<Policy>>;

    /// Exact action first, then `*`; [`StorageError::NoPolicy`] otherwise.
    fn match_policy<'a>(&'a self, action: &'a str) -> BoxFuture<'a, StoreResult<Policy>>;

    fn list_policies(&self) -> BoxFuture<'_, StoreResult<Vec<Policy>>>;
}
