//! Process-wide component health, written into the heartbeat file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{LazyLock, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Engine,
    Database,
    EventLog,
    Tool,
    Repo,
}

impl Component {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Database => "database",
            Self::EventLog => "event_log",
            Self::Tool => "tool",
            Self::Repo => "repo",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Ok,
    Error,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Ok => "ok",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub state: ComponentState,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Panics caught at the tick boundary.
    pub panics: u64,
}

impl ComponentHealth {
    fn starting(now: DateTime<Utc>) -> Self {
        Self {
            state: ComponentState::Starting,
            updated_at: now,
            last_ok: None,
            last_error: None,
            panics: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub written_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.components
            .values()
            .all(|c| c.state != ComponentState::Error)
    }

    /// Parses a heartbeat file. An empty or foreign file yields `None`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

pub struct HealthRegistry {
    started_at: Instant,
    components: RwLock<BTreeMap<Component, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: RwLock::new(BTreeMap::new()),
        }
    }

    fn update(&self, component: Component, apply: impl FnOnce(&mut ComponentHealth, DateTime<Utc>)) {
        // A poisoned lock only means a writer panicked mid-update; the map is
        // still usable.
        let mut map = self
            .components
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let entry = map
            .entry(component)
            .or_insert_with(|| ComponentHealth::starting(now));
        apply(entry, now);
        entry.updated_at = now;
    }

    pub fn mark_ok(&self, component: Component) {
        self.update(component, |entry, now| {
            entry.state = ComponentState::Ok;
            entry.last_ok = Some(now);
            entry.last_error = None;
        });
    }

    pub fn mark_error(&self, component: Component, error: &dyn fmt::Display) {
        let message = error.to_string();
        self.update(component, move |entry, _| {
            entry.state = ComponentState::Error;
            entry.last_error = Some(message);
        });
    }

    pub fn record_panic(&self, component: Component) {
        self.update(component, |entry, _| {
            entry.panics = entry.panics.saturating_add(1);
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components = self
            .components
            .read()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |map| map.clone());
        HealthSnapshot {
            pid: std::process::id(),
            written_at: Utc::now(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            components,
        }
    }
}

static REGISTRY: LazyLock<HealthRegistry> = LazyLock::new(HealthRegistry::new);

pub fn mark_ok(component: Component) {
    REGISTRY.mark_ok(component);
}

pub fn mark_error(component: Component, error: &dyn fmt::Display) {
    REGISTRY.mark_error(component, error);
}

pub fn record_panic(component: Component) {
    REGISTRY.record_panic(component);
}

pub fn snapshot() -> HealthSnapshot {
    REGISTRY.snapshot()
}

/// Pretty JSON snapshot for the heartbeat file.
pub fn heartbeat_bytes() -> Vec<u8> {
    serde_json::to_vec_pretty(&snapshot()).unwrap_or_else(|_| b"{}".to_vec())
}
