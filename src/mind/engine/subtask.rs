use super::{Engine, chain};
use crate::error::{TickContext, TickError};
use crate::mind::model::ModelTier;
use crate::mind::repo::PushOutcome;
use crate::mind::tool::ToolOutcome;
use crate::mind::{OUTPUT_EXCERPT, with_failure_context};
use crate::task::{Task, TaskStatus, TaskUpdate, meta};
use crate::util::truncate;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::fmt::Write as _;

const REASON_EXCERPT: usize = 200;
const RESULT_EXCERPT: usize = 1000;

impl Engine {
    /// One tool call for one subtask, verified, pushed and completed.
    /// Failures go through recovery and leave the task pending or blocked.
    pub(super) async fn execute_subtask(
        &mut self,
        task: &Task,
        causes: &[String],
    ) -> Result<(), TickError> {
        tracing::info!(task_id = %task.id, parent_id = %task.parent_id, subject = %task.subject, "executing subtask");
        let started = self
            .emit(
                "mind.subtask.started",
                json!({"task_id": task.id, "parent_id": task.parent_id, "subject": task.subject}),
                causes,
            )
            .await;
        let causes = chain(started, causes);

        let model = task
            .meta_str(meta::MODEL)
            .and_then(ModelTier::from_known)
            .unwrap_or_default();
        let prompt = with_failure_context(task, self.subtask_prompt(task));

        let Some(mut outcome) = self
            .invoke_for(task, &prompt, model, "subtask", &causes)
            .await?
        else {
            return Ok(());
        };
        let mut last_causes = chain(
            self.record_completion(task, &outcome, &causes).await,
            &causes,
        );

        if !outcome.succeeded() {
            tracing::warn!(task_id = %task.id, exit_code = outcome.exit_code, "subtask attempt failed, retrying once");
            let retried = self
                .emit(
                    "mind.claude.retry",
                    json!({"task_id": task.id, "exit_code": outcome.exit_code}),
                    &last_causes,
                )
                .await;
            let retry_causes = chain(retried, &last_causes);
            let retry_prompt = retry_prompt(&prompt, &outcome);

            let Some(retry) = self
                .invoke_for(task, &retry_prompt, model, "retry", &retry_causes)
                .await?
            else {
                return Ok(());
            };
            last_causes = chain(
                self.record_completion(task, &retry, &retry_causes).await,
                &retry_causes,
            );
            outcome = retry;

            if !outcome.succeeded() {
                return self
                    .handle_failure(
                        &task.id,
                        "mind.claude.failed",
                        &format!("claude failed (exit {})", outcome.exit_code),
                        &last_causes,
                    )
                    .await;
            }
        }

        if !self.verify_build(task, &last_causes).await? {
            return Ok(());
        }

        let message = format!("mind: {}", task.subject);
        match self.workspace.repo.commit_and_push(&message).await {
            Ok(PushOutcome::Pushed) => {
                self.emit(
                    "code.committed",
                    json!({"task_id": task.id, "message": message}),
                    &last_causes,
                )
                .await;
            }
            Ok(PushOutcome::NothingToPush) => {
                tracing::info!(task_id = %task.id, "subtask left nothing to push");
            }
            Err(error) => return self.push_failed(task, &error.to_string(), &last_causes).await,
        }

        self.tasks
            .complete(&task.id)
            .await
            .during("complete_subtask")?;
        tracing::info!(task_id = %task.id, "subtask completed");
        self.emit(
            "mind.subtask.completed",
            json!({"task_id": task.id, "parent_id": task.parent_id, "subject": task.subject}),
            &last_causes,
        )
        .await;
        Ok(())
    }

    fn subtask_prompt(&self, task: &Task) -> String {
        let mut prompt = format!(
            "You are working in {}. Make ONLY the change described below, nothing else.\n\nSubject: {}\n",
            self.workspace.repo_dir.display(),
            task.subject
        );
        if !task.description.is_empty() {
            let _ = write!(prompt, "\nDescription: {}\n", task.description);
        }
        let _ = write!(
            prompt,
            "\nAfter making the change, verify with: {}\nDo NOT commit. Just make the code change and verify it builds.\n",
            self.workspace.verify_hint
        );
        prompt
    }

    /// Records the invocation and calls the tool. `None` means the call never
    /// produced an outcome and failure handling already ran.
    async fn invoke_for(
        &mut self,
        task: &Task,
        prompt: &str,
        model: ModelTier,
        mode: &str,
        causes: &[String],
    ) -> Result<Option<ToolOutcome>, TickError> {
        let invoked = self
            .emit(
                "mind.claude.invoked",
                json!({
                    "task_id": task.id,
                    "mode": mode,
                    "model": model.as_str(),
                    "prompt": truncate(prompt, OUTPUT_EXCERPT),
                }),
                causes,
            )
            .await;
        let causes = chain(invoked, causes);

        match self
            .workspace
            .tool
            .invoke(&self.workspace.repo_dir, prompt, Some(model))
            .await
        {
            Ok(outcome) => Ok(Some(outcome)),
            Err(error) => {
                tracing::error!(task_id = %task.id, %error, "claude invocation failed");
                self.emit(
                    "mind.claude.failed",
                    json!({"task_id": task.id, "error": error.to_string()}),
                    &causes,
                )
                .await;
                self.handle_failure(
                    &task.id,
                    "mind.claude.failed",
                    &format!("claude invocation failed: {error}"),
                    &causes,
                )
                .await?;
                Ok(None)
            }
        }
    }

    pub(super) async fn record_completion(
        &self,
        task: &Task,
        outcome: &ToolOutcome,
        causes: &[String],
    ) -> Option<String> {
        let duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(task_id = %task.id, exit_code = outcome.exit_code, duration_ms, "claude finished");
        self.emit(
            "mind.claude.completed",
            json!({
                "task_id": task.id,
                "exit_code": outcome.exit_code,
                "duration_ms": duration_ms,
                "result": truncate(&outcome.result, RESULT_EXCERPT),
            }),
            causes,
        )
        .await
    }

    /// `false` when build or tests failed and failure handling ran.
    pub(super) async fn verify_build(
        &mut self,
        task: &Task,
        causes: &[String],
    ) -> Result<bool, TickError> {
        let Err(error) = self.workspace.repo.build_and_test().await else {
            return Ok(true);
        };
        let detail = error.to_string();
        tracing::warn!(task_id = %task.id, error = %truncate(&detail, REASON_EXCERPT), "build/test failed");
        let failed = self
            .emit(
                "build.failed",
                json!({"task_id": task.id, "error": truncate(&detail, OUTPUT_EXCERPT)}),
                causes,
            )
            .await;
        self.handle_failure(
            &task.id,
            "build.failed",
            &format!("build/test failed: {}", truncate(&detail, REASON_EXCERPT)),
            &chain(failed, causes),
        )
        .await?;
        Ok(false)
    }

    pub(super) async fn push_failed(
        &mut self,
        task: &Task,
        error: &str,
        causes: &[String],
    ) -> Result<(), TickError> {
        tracing::error!(task_id = %task.id, %error, "commit/push failed");
        let failed = self
            .emit(
                "git.commit_push.failed",
                json!({"task_id": task.id, "error": truncate(error, OUTPUT_EXCERPT)}),
                causes,
            )
            .await;
        self.handle_failure(
            &task.id,
            "git.commit_push.failed",
            &format!(
                "git push failed, unpushed work at risk: {}",
                truncate(error, REASON_EXCERPT)
            ),
            &chain(failed, causes),
        )
        .await
    }

    /// Gives the recoverer one shot, then requeues or blocks the task.
    pub(super) async fn handle_failure(
        &mut self,
        task_id: &str,
        error_type: &str,
        reason: &str,
        causes: &[String],
    ) -> Result<(), TickError> {
        let Some(task) = self.tasks.get(task_id).await.during("get_failed_task")? else {
            tracing::warn!(task_id, "failed task vanished");
            return Ok(());
        };

        if self
            .recoverer
            .attempt(&task, error_type, reason, causes)
            .await
        {
            self.requeue_after_recovery(task_id, causes).await
        } else {
            self.mark_blocked(task_id, reason, causes).await
        }
    }

    async fn requeue_after_recovery(
        &self,
        task_id: &str,
        causes: &[String],
    ) -> Result<(), TickError> {
        let Some(task) = self.tasks.get(task_id).await.during("get_recovered_task")? else {
            return Ok(());
        };
        let mut metadata = task.metadata.clone();
        metadata.remove(meta::RECOVERY_ATTEMPTED);
        metadata.insert(meta::RECOVERED.into(), Value::Bool(true));
        metadata.insert(
            meta::RECOVERED_AT.into(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        self.tasks
            .update(
                task_id,
                TaskUpdate::status(TaskStatus::Pending)
                    .with_assignee("")
                    .with_metadata(metadata),
            )
            .await
            .during("requeue_recovered")?;
        tracing::info!(task_id, subject = %task.subject, "recovered, requeued");
        self.emit(
            "task.recovered",
            json!({"task_id": task_id, "subject": task.subject}),
            causes,
        )
        .await;
        Ok(())
    }

    pub(super) async fn mark_blocked(
        &self,
        task_id: &str,
        reason: &str,
        causes: &[String],
    ) -> Result<(), TickError> {
        let Some(task) = self.tasks.get(task_id).await.during("get_blocked_task")? else {
            return Ok(());
        };
        let mut metadata = task.metadata.clone();
        metadata.insert(meta::BLOCKED_REASON.into(), Value::from(reason));
        metadata
            .entry(meta::RETRY_COUNT)
            .or_insert_with(|| Value::from(0));
        self.tasks
            .update(
                task_id,
                TaskUpdate::status(TaskStatus::Blocked).with_metadata(metadata),
            )
            .await
            .during("mark_blocked")?;
        tracing::warn!(task_id, reason, "task blocked");
        self.emit(
            "task.blocked",
            json!({"task_id": task_id, "reason": reason}),
            causes,
        )
        .await;
        Ok(())
    }
}

/// The original prompt with the failed attempt's output in front of it.
fn retry_prompt(prompt: &str, failed: &ToolOutcome) -> String {
    let output = if failed.stderr.trim().is_empty() {
        &failed.result
    } else {
        &failed.stderr
    };
    format!(
        "Your previous attempt exited with code {}. Its output was:\n{}\n\nFix what went wrong and try again.\n\n{prompt}",
        failed.exit_code,
        truncate(output.trim(), OUTPUT_EXCERPT)
    )
}
