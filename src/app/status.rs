use crate::authority::AuthorityStore;
use crate::config::Config;
use crate::db::Stores;
use crate::eventgraph::EventStore;
use crate::health::HealthSnapshot;
use crate::task::{TaskStatus, TaskStore};
use crate::util::format_timestamp;
use anyhow::{Context, Result};
use std::fmt::Write as _;

/// Per-status task counts come from a bounded sample.
const STATUS_SAMPLE: usize = 1000;

pub async fn render_status(config: &Config, stores: &Stores) -> Result<String> {
    let mut lines = vec![
        "◆ mindloop status".to_string(),
        String::new(),
        format!("Version     {}", env!("CARGO_PKG_VERSION")),
        format!("Config      {}", config.config_path.display()),
        format!("Repository  {}", config.repo_dir.display()),
        format!("Database    {}", config.database.path.display()),
        format!(
            "Engine      {} (actor {})",
            if config.engine.enabled {
                "enabled"
            } else {
                "disabled"
            },
            config.engine.actor_name
        ),
        String::new(),
        "Tasks".to_string(),
    ];

    let total = stores.tasks.count().await.context("Failed to count tasks")?;
    lines.push(format!("  total        {total}"));
    for status in TaskStatus::ALL {
        let count = stores
            .tasks
            .list(Some(status), STATUS_SAMPLE)
            .await
            .with_context(|| format!("Failed to list {status} tasks"))?
            .len();
        lines.push(format!("  {:<12} {count}", status.as_str()));
    }

    lines.push(String::new());
    let pending = stores
        .authority
        .pending()
        .await
        .context("Failed to list pending approvals")?;
    lines.push(format!("Pending approvals  {}", pending.len()));
    for request in &pending {
        lines.push(format!(
            "  {} {} [{}] from {}",
            request.id, request.action, request.level, request.source
        ));
    }

    lines.push(String::new());
    let events = stores
        .events
        .count()
        .await
        .context("Failed to count events")?;
    lines.push(format!("Events      {events}"));
    let head = stores
        .events
        .recent(1)
        .await
        .context("Failed to read chain head")?;
    match head.first() {
        Some(event) => lines.push(format!(
            "Chain head  {} {} ({})",
            event.hash, event.event_type, event.id
        )),
        None => lines.push("Chain head  (empty)".to_string()),
    }

    lines.push(String::new());
    lines.extend(heartbeat_lines(config));
    Ok(lines.join("\n"))
}

fn heartbeat_lines(config: &Config) -> Vec<String> {
    let path = &config.engine.heartbeat_path;
    let Ok(raw) = std::fs::read(path) else {
        return vec![format!("Heartbeat   none at {}", path.display())];
    };
    match HealthSnapshot::parse(&raw) {
        Some(snapshot) => render_snapshot(&snapshot),
        None => vec![format!("Heartbeat   unreadable at {}", path.display())],
    }
}

fn render_snapshot(snapshot: &HealthSnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "Heartbeat   {} (pid {}, up {}s, {})",
        format_timestamp(snapshot.written_at),
        snapshot.pid,
        snapshot.uptime_secs,
        if snapshot.is_healthy() {
            "healthy"
        } else {
            "degraded"
        }
    )];
    for (component, health) in &snapshot.components {
        let mut line = format!("  {:<10} {}", component.as_str(), health.state);
        if health.panics > 0 {
            let _ = write!(line, " panics={}", health.panics);
        }
        if let Some(error) = &health.last_error {
            let _ = write!(line, " last_error={error}");
        }
        lines.push(line);
    }
    lines
}
