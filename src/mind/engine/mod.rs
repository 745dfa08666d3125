//! The tick loop.
//!
//! Each tick runs a fixed pipeline and stops at the first stage that has
//! work: heartbeat, preflight, the restart slot, the proposal slot, retry of
//! blocked tasks, recovery of stale ones, one claimed task, and finally an
//! idle self-assessment.

mod approval;
mod cycle;
mod maintenance;
mod subtask;

use super::Workspace;
use super::assessor::Assessor;
use super::planner::Planner;
use super::recoverer::Recoverer;
use super::reviewer::Reviewer;
use crate::authority::AuthorityStore;
use crate::config::EngineConfig;
use crate::db::Stores;
use crate::error::{TickContext, TickError};
use crate::health::{self, Component};
use crate::eventgraph::{EventStore, Recorder};
use crate::task::{TaskStatus, TaskStore, TaskUpdate};
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pending tasks considered per tick.
const CLAIM_WINDOW: usize = 10;

/// What a single tick ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    PreflightFailed,
    RestartChecked,
    ProposalChecked,
    RanTask(String),
    Assessed,
    Idle,
}

/// Store handles the engine works against.
#[derive(Clone)]
pub struct EngineStores {
    pub events: Arc<dyn EventStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub authority: Arc<dyn AuthorityStore>,
}

impl From<Stores> for EngineStores {
    fn from(stores: Stores) -> Self {
        Self {
            events: Arc::new(stores.events),
            tasks: Arc::new(stores.tasks),
            authority: Arc::new(stores.authority),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    /// Registered actor id, compared against policy approvers.
    actor_id: String,
    recorder: Recorder,
    workspace: Workspace,
    tasks: Arc<dyn TaskStore>,
    authority: Arc<dyn AuthorityStore>,
    planner: Planner,
    reviewer: Reviewer,
    recoverer: Recoverer,
    assessor: Assessor,
    pending_restart: Option<String>,
    pending_proposal: Option<String>,
    last_assessment: Option<Instant>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        actor_id: impl Into<String>,
        workspace: Workspace,
        stores: EngineStores,
    ) -> Self {
        let recorder = Recorder::new(Arc::clone(&stores.events), config.actor_name.as_str());
        Self {
            planner: Planner::new(workspace.clone()),
            reviewer: Reviewer::new(workspace.clone()),
            recoverer: Recoverer::new(
                workspace.clone(),
                Arc::clone(&stores.tasks),
                recorder.clone(),
            ),
            assessor: Assessor::new(
                workspace.clone(),
                Arc::clone(&stores.tasks),
                Arc::clone(&stores.events),
            ),
            config,
            actor_id: actor_id.into(),
            recorder,
            workspace,
            tasks: stores.tasks,
            authority: stores.authority,
            pending_restart: None,
            pending_proposal: None,
            last_assessment: None,
        }
    }

    pub fn actor_name(&self) -> &str {
        &self.config.actor_name
    }

    /// Restart request awaiting resolution.
    pub fn pending_restart(&self) -> Option<&str> {
        self.pending_restart.as_deref()
    }

    /// Self-improvement request awaiting resolution.
    pub fn pending_proposal(&self) -> Option<&str> {
        self.pending_proposal.as_deref()
    }

    /// Commits crash leftovers and rehydrates the authority slots.
    pub async fn startup(&mut self) {
        match self.workspace.repo.clean_working_tree().await {
            Ok(files) if files.is_empty() => {}
            Ok(files) => {
                tracing::warn!(count = files.len(), "committed orphaned files from crash recovery");
                self.emit(
                    "mind.recovery.dirty_tree_cleaned",
                    json!({"file_count": files.len(), "files": files}),
                    &[],
                )
                .await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to clean working tree");
                self.emit(
                    "mind.recovery.dirty_tree_failed",
                    json!({"error": error.to_string(), "files": error.orphaned_files()}),
                    &[],
                )
                .await;
            }
        }

        let pending = match self.authority.pending().await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "failed to list pending authority requests");
                self.emit(
                    "mind.error",
                    json!({"operation": "recover_state", "error": error.to_string()}),
                    &[],
                )
                .await;
                return;
            }
        };

        let mut recovered = Vec::new();
        for request in pending {
            if request.source != self.config.actor_name {
                continue;
            }
            match request.action.as_str() {
                approval::RESTART_ACTION => self.pending_restart = Some(request.id.clone()),
                approval::SELF_IMPROVE_ACTION => self.pending_proposal = Some(request.id.clone()),
                _ => continue,
            }
            tracing::info!(authority_id = %request.id, action = %request.action, "recovered pending request");
            recovered.push(request.id);
        }
        if !recovered.is_empty() {
            self.emit("mind.state.recovered", json!({"recovered_ids": recovered}), &[])
                .await;
        }
    }

    /// Run one pass of the pipeline. A store failure is recorded as
    /// `mind.error` and ends the tick.
    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        let outcome = self.run_stages().await;
        match &outcome {
            Ok(_) => health::mark_ok(Component::Engine),
            Err(error) => {
                tracing::error!(operation = error.operation, error = %error.source, "store failure, ending tick");
                health::mark_error(Component::Engine, error);
                self.emit(
                    "mind.error",
                    json!({"operation": error.operation, "error": error.source.to_string()}),
                    &[],
                )
                .await;
            }
        }
        outcome
    }

    async fn run_stages(&mut self) -> Result<TickOutcome, TickError> {
        if let Err(error) = self.workspace.repo.write_heartbeat().await {
            tracing::warn!(%error, "failed to write heartbeat");
        }

        let missing = missing_binaries(&self.config.required_binaries);
        if !missing.is_empty() {
            let error = format!("missing required binaries: {}", missing.join(", "));
            tracing::error!(%error, "preflight failed");
            self.emit(
                "mind.preflight.failed",
                json!({"error": error, "missing": missing}),
                &[],
            )
            .await;
            return Ok(TickOutcome::PreflightFailed);
        }

        if self.pending_restart.is_some() {
            self.check_restart().await?;
            return Ok(TickOutcome::RestartChecked);
        }
        if self.pending_proposal.is_some() {
            self.check_proposal().await?;
            return Ok(TickOutcome::ProposalChecked);
        }

        self.retry_blocked().await?;
        self.recover_stale().await?;

        if let Some(task_id) = self.claim_next().await? {
            return Ok(TickOutcome::RanTask(task_id));
        }
        if self.maybe_assess().await? {
            return Ok(TickOutcome::Assessed);
        }
        Ok(TickOutcome::Idle)
    }

    /// Claims the first pending task that is unassigned or already ours and
    /// runs it to the end of its cycle.
    async fn claim_next(&mut self) -> Result<Option<String>, TickError> {
        let pending = self
            .tasks
            .list(Some(TaskStatus::Pending), CLAIM_WINDOW)
            .await
            .during("list_pending")?;
        let Some(candidate) = pending
            .into_iter()
            .find(|t| t.assignee.is_empty() || t.assignee == self.config.actor_name)
        else {
            return Ok(None);
        };

        let task = self
            .tasks
            .update(
                &candidate.id,
                TaskUpdate::status(TaskStatus::InProgress)
                    .with_assignee(self.config.actor_name.as_str()),
            )
            .await
            .during("claim_task")?;
        tracing::info!(task_id = %task.id, subject = %task.subject, "claimed task");
        let claimed = self
            .emit(
                "task.claimed",
                json!({"task_id": task.id, "subject": task.subject}),
                &[],
            )
            .await;
        let causes = chain(claimed, &[]);

        if task.is_subtask() {
            self.execute_subtask(&task, &causes).await?;
        } else {
            self.execute_task(&task, &causes).await?;
        }
        Ok(Some(task.id))
    }

    /// Ticks until `cancel` fires. Panics inside a tick are recorded and the
    /// loop continues; cancellation drops the in-flight tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(actor = %self.config.actor_name, "engine running");
        health::mark_ok(Component::Engine);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = self.startup() => {}
        }

        let period = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = AssertUnwindSafe(self.tick()).catch_unwind() => Some(result),
            };
            match result {
                None => break,
                Some(Ok(Ok(outcome))) => tracing::debug!(?outcome, "tick finished"),
                Some(Ok(Err(_))) => {}
                Some(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(%message, "panic inside tick");
                    health::record_panic(Component::Engine);
                    self.emit("mind.panic", json!({"error": message}), &[]).await;
                }
            }
        }
        tracing::info!("engine shutting down");
    }

    async fn emit(&self, event_type: &str, content: Value, causes: &[String]) -> Option<String> {
        self.recorder.emit(event_type, content, causes).await
    }
}

/// Causes for the next event: the one just recorded, or the previous set
/// when recording failed.
fn chain(recorded: Option<String>, fallback: &[String]) -> Vec<String> {
    recorded.map_or_else(|| fallback.to_vec(), |id| vec![id])
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Required binaries not resolvable on `PATH`.
pub fn missing_binaries(required: &[String]) -> Vec<String> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let dirs: Vec<_> = std::env::split_paths(&path).collect();
    required
        .iter()
        .filter(|bin| {
            let candidate = Path::new(bin.as_str());
            if candidate.components().count() > 1 {
                return !is_executable(candidate);
            }
            !dirs.iter().any(|dir| is_executable(&dir.join(candidate)))
        })
        .cloned()
        .collect()
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}
