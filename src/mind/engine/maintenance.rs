use super::{Engine, chain};
use crate::error::{TickContext, TickError};
use crate::task::{TaskStatus, TaskUpdate, meta};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tokio::time::Instant;

const BLOCKED_WINDOW: usize = 20;
const STALE_WINDOW: usize = 50;

pub const STALE_REASON: &str = "stale in_progress, recovered automatically";

/// Wait before retry number `retries + 1`: the base doubled per earlier retry.
pub(super) fn retry_backoff(base_mins: u64, retries: u32) -> Duration {
    let base = i64::try_from(base_mins).unwrap_or(i64::MAX);
    if retries >= 62 {
        return Duration::MAX;
    }
    let factor = 1_i64 << retries;
    Duration::try_minutes(base.saturating_mul(factor)).unwrap_or(Duration::MAX)
}

impl Engine {
    /// Requeues our blocked tasks once their backoff has elapsed.
    pub(super) async fn retry_blocked(&self) -> Result<(), TickError> {
        let blocked = self
            .tasks
            .list(Some(TaskStatus::Blocked), BLOCKED_WINDOW)
            .await
            .during("list_blocked")?;
        let now = Utc::now();

        for task in blocked {
            if task.assignee != self.config.actor_name {
                continue;
            }
            let retries = task.retry_count();
            if retries >= self.config.max_retries {
                continue;
            }
            let backoff = retry_backoff(self.config.retry_base_mins, retries);
            if now.signed_duration_since(task.updated_at) < backoff {
                continue;
            }

            let mut metadata = task.metadata.clone();
            if let Some(reason) = task.meta_str(meta::BLOCKED_REASON)
                && !reason.is_empty()
            {
                metadata.insert(meta::PREV_FAILURE_REASON.into(), Value::from(reason));
            }
            metadata.insert(meta::RETRY_COUNT.into(), Value::from(retries + 1));
            metadata.remove(meta::RECOVERY_ATTEMPTED);

            self.tasks
                .update(
                    &task.id,
                    TaskUpdate::status(TaskStatus::Pending)
                        .with_assignee("")
                        .with_metadata(metadata),
                )
                .await
                .during("retry_blocked")?;
            tracing::info!(task_id = %task.id, retry = retries + 1, "retrying blocked task");
            self.emit(
                "task.retried",
                json!({"task_id": task.id, "subject": task.subject, "retry_count": retries + 1}),
                &[],
            )
            .await;
        }
        Ok(())
    }

    /// Resets our in-progress tasks that stopped moving, which means the
    /// process died or was cancelled mid-task.
    pub(super) async fn recover_stale(&self) -> Result<(), TickError> {
        let running = self
            .tasks
            .list(Some(TaskStatus::InProgress), STALE_WINDOW)
            .await
            .during("list_in_progress")?;
        let now = Utc::now();
        let stale_after = Duration::try_minutes(
            i64::try_from(self.config.stale_after_mins).unwrap_or(i64::MAX),
        )
        .unwrap_or(Duration::MAX);

        for task in running {
            if task.assignee != self.config.actor_name {
                continue;
            }
            let idle = now.signed_duration_since(task.updated_at);
            if idle < stale_after {
                continue;
            }

            let mut metadata = task.metadata.clone();
            metadata.insert(meta::PREV_FAILURE_REASON.into(), Value::from(STALE_REASON));
            self.tasks
                .update(
                    &task.id,
                    TaskUpdate::status(TaskStatus::Pending)
                        .with_assignee("")
                        .with_metadata(metadata),
                )
                .await
                .during("recover_stale")?;
            tracing::warn!(task_id = %task.id, idle_mins = idle.num_minutes(), "recovered stale task");
            self.emit(
                "task.stale.recovered",
                json!({
                    "task_id": task.id,
                    "subject": task.subject,
                    "stale_for_mins": idle.num_minutes(),
                }),
                &[],
            )
            .await;
        }
        Ok(())
    }

    /// Runs the assessor when the interval has elapsed. Returns whether it ran.
    pub(super) async fn maybe_assess(&mut self) -> Result<bool, TickError> {
        let interval = std::time::Duration::from_secs(self.config.assess_interval_secs);
        if self
            .last_assessment
            .is_some_and(|last| last.elapsed() < interval)
        {
            return Ok(false);
        }
        self.last_assessment = Some(Instant::now());
        tracing::info!("idle, running self-assessment");

        let started = self.emit("mind.assess.started", json!({}), &[]).await;
        let causes = chain(started, &[]);

        match self.assessor.assess().await {
            Err(error) => {
                tracing::warn!(%error, "assessment failed");
                self.emit(
                    "mind.assess.failed",
                    json!({"error": error.to_string()}),
                    &causes,
                )
                .await;
            }
            Ok(None) => {
                self.emit("mind.assess.completed", json!({"result": "ok"}), &causes)
                    .await;
            }
            Ok(Some(proposal)) => {
                self.emit(
                    "mind.assess.completed",
                    json!({"result": "proposal", "subject": proposal.subject}),
                    &causes,
                )
                .await;
                self.submit_proposal(&proposal, &causes).await?;
            }
        }
        Ok(true)
    }
}
