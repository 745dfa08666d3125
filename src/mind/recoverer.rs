use super::model::ModelTier;
use super::{OUTPUT_EXCERPT, Workspace};
use crate::eventgraph::Recorder;
use crate::task::{Task, TaskStore, TaskUpdate, meta};
use crate::util::truncate;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Ancestors walked per cause when rebuilding failure context.
const CAUSAL_DEPTH: usize = 10;

/// Diagnoses a failed task and tries to fix the root cause once per
/// failure cycle.
pub struct Recoverer {
    workspace: Workspace,
    tasks: Arc<dyn TaskStore>,
    recorder: Recorder,
}

impl Recoverer {
    pub fn new(workspace: Workspace, tasks: Arc<dyn TaskStore>, recorder: Recorder) -> Self {
        Self {
            workspace,
            tasks,
            recorder,
        }
    }

    /// True when the tool made a change after which build and tests pass.
    pub async fn attempt(
        &self,
        task: &Task,
        error_type: &str,
        reason: &str,
        causes: &[String],
    ) -> bool {
        if task.meta_flag(meta::RECOVERY_ATTEMPTED) {
            tracing::info!(task_id = %task.id, "recovery already attempted this cycle");
            return false;
        }

        let mut metadata = task.metadata.clone();
        metadata.insert(meta::RECOVERY_ATTEMPTED.into(), Value::Bool(true));
        if let Err(error) = self
            .tasks
            .update(&task.id, TaskUpdate::default().with_metadata(metadata))
            .await
        {
            tracing::warn!(task_id = %task.id, %error, "failed to set recovery guard");
        }

        let started = self
            .recorder
            .emit(
                "mind.recovery.started",
                json!({
                    "task_id": task.id,
                    "error_type": error_type,
                    "reason": truncate(reason, OUTPUT_EXCERPT),
                }),
                causes,
            )
            .await;
        let recovery_causes = started.map_or_else(|| causes.to_vec(), |id| vec![id]);

        tracing::info!(task_id = %task.id, error_type, "attempting recovery");
        let prompt = self.prompt(task, error_type, reason, causes).await;

        let outcome = match self
            .workspace
            .tool
            .invoke(&self.workspace.repo_dir, &prompt, Some(ModelTier::Sonnet))
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                self.failed(
                    json!({"task_id": task.id, "stage": "invocation", "error": error.to_string()}),
                    &recovery_causes,
                )
                .await;
                return false;
            }
        };

        if !outcome.succeeded() {
            self.failed(
                json!({
                    "task_id": task.id,
                    "stage": "claude_exit",
                    "exit_code": outcome.exit_code,
                    "result": truncate(&outcome.result, OUTPUT_EXCERPT),
                }),
                &recovery_causes,
            )
            .await;
            return false;
        }

        if let Err(error) = self.workspace.repo.build_and_test().await {
            self.failed(
                json!({
                    "task_id": task.id,
                    "stage": "build_test",
                    "error": truncate(&error.to_string(), OUTPUT_EXCERPT),
                }),
                &recovery_causes,
            )
            .await;
            return false;
        }

        tracing::info!(task_id = %task.id, "recovery succeeded");
        self.recorder
            .emit(
                "mind.recovery.succeeded",
                json!({
                    "task_id": task.id,
                    "error_type": error_type,
                    "result": truncate(&outcome.result, OUTPUT_EXCERPT),
                }),
                &recovery_causes,
            )
            .await;
        true
    }

    async fn failed(&self, content: Value, causes: &[String]) {
        tracing::warn!(
            task_id = content["task_id"].as_str().unwrap_or_default(),
            stage = content["stage"].as_str().unwrap_or_default(),
            "recovery failed"
        );
        self.recorder
            .emit("mind.recovery.failed", content, causes)
            .await;
    }

    async fn prompt(&self, task: &Task, error_type: &str, reason: &str, causes: &[String]) -> String {
        let causal = self.causal_context(causes).await;
        let git = self.git_context().await;
        format!(
            "You are the error recovery system of an autonomous maintenance engine. A task just failed. \
Diagnose the root cause and fix it.

## Failed Task
Subject: {subject}
Description: {description}

## Error
Type: {error_type}
Reason: {reason}

## Causal Chain (what led to this failure)
{causal}
## Recent Git Changes
{git}
## Rules
1. Fix the ROOT CAUSE, not a workaround.
2. Do NOT weaken tests to make them pass.
3. Do NOT remove error checking or validation.
4. If the error is environmental (network down, auth expired, external service unavailable), report what is wrong but do NOT change code.
5. If you cannot identify the root cause, make NO changes. Just explain what you found.
6. After making changes, verify with: {verify}
7. Do NOT commit. Just fix and verify.",
            subject = task.subject,
            description = task.description,
            verify = self.workspace.verify_hint,
        )
    }

    /// Ancestors of every cause, de-duplicated, oldest first per cause.
    pub async fn causal_context(&self, causes: &[String]) -> String {
        if causes.is_empty() {
            return "(no causal chain available)\n".into();
        }

        let mut seen = HashSet::new();
        let mut context = String::new();
        let store = self.recorder.store();
        for cause in causes {
            let mut chain = match store.ancestors(cause, CAUSAL_DEPTH).await {
                Ok(ancestors) => ancestors,
                Err(error) => {
                    tracing::warn!(cause = %cause, %error, "failed to walk causal chain");
                    continue;
                }
            };
            if let Ok(Some(event)) = store.get(cause).await {
                chain.push(event);
            }
            for event in chain {
                if !seen.insert(event.id.clone()) {
                    continue;
                }
                let _ = writeln!(
                    context,
                    "- [{}] {} (source={}): {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.event_type,
                    event.source,
                    event.content
                );
            }
        }

        if context.is_empty() {
            "(causal chain empty)\n".into()
        } else {
            context
        }
    }

    async fn git_context(&self) -> String {
        let mut context = String::new();
        if let Ok(log) = self.workspace.repo.recent_log(5).await {
            let _ = writeln!(context, "Recent commits:\n{log}");
        }
        if let Ok(stat) = self.workspace.repo.diff_stat().await
            && !stat.trim().is_empty()
        {
            let _ = writeln!(context, "Uncommitted changes:\n{stat}");
        }
        context
    }
}
