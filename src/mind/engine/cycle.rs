use super::{Engine, chain};
use crate::error::{TickContext, TickError};
use crate::mind::model::ModelTier;
use crate::mind::parse::SubtaskSpec;
use crate::mind::planner::PlanOutcome;
use crate::mind::repo::PushOutcome;
use crate::mind::{OUTPUT_EXCERPT, with_failure_context};
use crate::task::{NewTask, Task, TaskStatus, TaskUpdate, meta};
use crate::util::truncate;
use serde_json::{Value, json};
use std::fmt::Write as _;

/// Reviewed range start when the current commit cannot be read.
const FALLBACK_START: &str = "HEAD~20";

/// How a run over a parent's subtasks ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SubtaskRun {
    Done,
    /// The parent is blocked.
    Blocked,
    /// A subtask was requeued after recovery; the parent was requeued with it.
    Requeued,
}

impl Engine {
    /// Plan, implement, review and finish a top-level task.
    pub(super) async fn execute_task(
        &mut self,
        task: &Task,
        causes: &[String],
    ) -> Result<(), TickError> {
        let (task, start_commit) = self.start_commit(task).await?;
        let existing = self
            .tasks
            .by_parent(&task.id)
            .await
            .during("list_subtasks")?;

        let (subtask_ids, plan_causes) = if existing.is_empty() {
            self.emit(
                "mind.plan.started",
                json!({"task_id": task.id, "subject": task.subject}),
                causes,
            )
            .await;

            match self.planner.plan(&task).await {
                Ok(PlanOutcome::AlreadyDone) => return self.already_done(&task, causes).await,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "plan failed, executing directly");
                    self.emit(
                        "mind.plan.failed",
                        json!({"task_id": task.id, "error": error.to_string()}),
                        causes,
                    )
                    .await;
                    return self.execute_directly(&task, causes).await;
                }
                Ok(PlanOutcome::Subtasks(specs)) => {
                    let planned = self
                        .emit(
                            "mind.plan.completed",
                            json!({"task_id": task.id, "subtask_count": specs.len()}),
                            causes,
                        )
                        .await;
                    let ids = self.create_subtasks(&task.id, &specs).await?;
                    (ids, chain(planned, causes))
                }
            }
        } else {
            let remaining = existing
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .count();
            tracing::info!(task_id = %task.id, remaining, "resuming planned task");
            let resumed = self
                .emit(
                    "mind.plan.resumed",
                    json!({
                        "task_id": task.id,
                        "subtask_count": existing.len(),
                        "remaining": remaining,
                    }),
                    causes,
                )
                .await;
            let ids = existing.into_iter().map(|t| t.id).collect();
            (ids, chain(resumed, causes))
        };

        if self
            .implement_subtasks(&task, &subtask_ids, &plan_causes)
            .await?
            != SubtaskRun::Done
        {
            return Ok(());
        }

        let mut review_causes = plan_causes;
        for round in 1..=self.config.review_rounds {
            self.emit(
                "mind.review.started",
                json!({"task_id": task.id, "round": round}),
                &review_causes,
            )
            .await;

            let issues = match self.reviewer.review(&task, &start_commit).await {
                Ok(issues) => issues,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "review failed, finishing anyway");
                    self.emit(
                        "mind.review.failed",
                        json!({"task_id": task.id, "round": round, "error": error.to_string()}),
                        &review_causes,
                    )
                    .await;
                    break;
                }
            };

            let reviewed = self
                .emit(
                    "mind.review.completed",
                    json!({
                        "task_id": task.id,
                        "round": round,
                        "issue_count": issues.len(),
                        "clean": issues.is_empty(),
                    }),
                    &review_causes,
                )
                .await;
            if issues.is_empty() {
                break;
            }
            review_causes = chain(reviewed, &review_causes);

            let fix_ids = self.create_subtasks(&task.id, &issues).await?;
            if self
                .implement_subtasks(&task, &fix_ids, &review_causes)
                .await?
                != SubtaskRun::Done
            {
                return Ok(());
            }
        }

        self.finish_task(&task, &review_causes).await
    }

    /// The recorded start commit, or the current one stored for later resumes.
    async fn start_commit(&self, task: &Task) -> Result<(Task, String), TickError> {
        if let Some(commit) = task.meta_str(meta::START_COMMIT)
            && !commit.is_empty()
        {
            return Ok((task.clone(), commit.to_string()));
        }

        let commit = match self.workspace.repo.current_commit().await {
            Ok(commit) => commit,
            Err(error) => {
                tracing::warn!(task_id = %task.id, %error, "cannot read start commit");
                FALLBACK_START.to_string()
            }
        };
        let mut metadata = task.metadata.clone();
        metadata.insert(meta::START_COMMIT.into(), Value::from(commit.as_str()));
        let task = self
            .tasks
            .update(&task.id, TaskUpdate::default().with_metadata(metadata))
            .await
            .during("record_start_commit")?;
        Ok((task, commit))
    }

    async fn already_done(&mut self, task: &Task, causes: &[String]) -> Result<(), TickError> {
        tracing::info!(task_id = %task.id, "plan reports task already done");
        self.tasks
            .complete(&task.id)
            .await
            .during("complete_task")?;
        let done = self
            .emit(
                "mind.plan.already_done",
                json!({"task_id": task.id, "subject": task.subject}),
                causes,
            )
            .await;
        let causes = chain(done, causes);
        let completed = self
            .emit(
                "task.completed",
                json!({"task_id": task.id, "subject": task.subject}),
                &causes,
            )
            .await;
        self.request_restart(task, &chain(completed, &causes))
            .await
    }

    async fn create_subtasks(
        &self,
        parent_id: &str,
        specs: &[SubtaskSpec],
    ) -> Result<Vec<String>, TickError> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let created = self
                .tasks
                .create(
                    NewTask::new(spec.subject.as_str(), spec.description.as_str())
                        .source(self.config.actor_name.as_str())
                        .parent(parent_id)
                        .meta(meta::MODEL, spec.model.as_str()),
                )
                .await
                .during("create_subtask")?;
            tracing::info!(
                task_id = %created.id,
                parent_id,
                model = %spec.model,
                subject = %spec.subject,
                "created subtask"
            );
            ids.push(created.id);
        }
        Ok(ids)
    }

    /// Runs each not-yet-completed subtask in order, stopping at the first
    /// that does not complete.
    async fn implement_subtasks(
        &mut self,
        parent: &Task,
        subtask_ids: &[String],
        causes: &[String],
    ) -> Result<SubtaskRun, TickError> {
        for id in subtask_ids {
            let Some(subtask) = self.tasks.get(id).await.during("get_subtask")? else {
                self.mark_blocked(&parent.id, &format!("subtask {id} not found"), causes)
                    .await?;
                return Ok(SubtaskRun::Blocked);
            };
            match subtask.status {
                TaskStatus::Completed => continue,
                // Left for the retry pass; claiming it here would skip pending.
                TaskStatus::Blocked => {
                    let reason = format!("subtask {id} still blocked: {}", subtask.subject);
                    self.mark_blocked(&parent.id, &reason, causes).await?;
                    return Ok(SubtaskRun::Blocked);
                }
                TaskStatus::Pending | TaskStatus::InProgress => {}
            }

            let subtask = self
                .tasks
                .update(
                    id,
                    TaskUpdate::status(TaskStatus::InProgress)
                        .with_assignee(self.config.actor_name.as_str()),
                )
                .await
                .during("claim_subtask")?;
            let claimed = self
                .emit(
                    "task.claimed",
                    json!({"task_id": subtask.id, "subject": subtask.subject}),
                    causes,
                )
                .await;
            self.execute_subtask(&subtask, &chain(claimed, causes))
                .await?;

            let status = self
                .tasks
                .get(id)
                .await
                .during("get_subtask")?
                .map_or(TaskStatus::Blocked, |t| t.status);
            match status {
                TaskStatus::Blocked => {
                    let reason = format!("subtask {id} blocked: {}", subtask.subject);
                    self.mark_blocked(&parent.id, &reason, causes).await?;
                    return Ok(SubtaskRun::Blocked);
                }
                TaskStatus::Pending => {
                    self.requeue_parent(parent, &subtask, causes).await?;
                    return Ok(SubtaskRun::Requeued);
                }
                TaskStatus::InProgress | TaskStatus::Completed => {}
            }
        }
        Ok(SubtaskRun::Done)
    }

    /// Puts the parent back in the queue so the next tick resumes it.
    async fn requeue_parent(
        &self,
        parent: &Task,
        subtask: &Task,
        causes: &[String],
    ) -> Result<(), TickError> {
        self.tasks
            .update(
                &parent.id,
                TaskUpdate::status(TaskStatus::Pending).with_assignee(""),
            )
            .await
            .during("requeue_parent")?;
        tracing::info!(task_id = %parent.id, subtask_id = %subtask.id, "parent requeued behind recovered subtask");
        self.emit(
            "task.requeued",
            json!({"task_id": parent.id, "subtask_id": subtask.id}),
            causes,
        )
        .await;
        Ok(())
    }

    /// Single-shot fallback when planning failed.
    async fn execute_directly(&mut self, task: &Task, causes: &[String]) -> Result<(), TickError> {
        let mut prompt = format!(
            "You are working in {}. Complete this task:\n\nSubject: {}\n",
            self.workspace.repo_dir.display(),
            task.subject
        );
        if !task.description.is_empty() {
            let _ = write!(prompt, "\nDescription: {}\n", task.description);
        }
        let _ = write!(
            prompt,
            "\nAfter making changes, verify with: {}\nDo NOT commit. Just make the code changes and verify they build.\n",
            self.workspace.verify_hint
        );
        let prompt = with_failure_context(task, prompt);
        let model = task.meta_str(meta::MODEL).and_then(ModelTier::from_known);

        let invoked = self
            .emit(
                "mind.claude.invoked",
                json!({
                    "task_id": task.id,
                    "mode": "direct",
                    "model": model.map(ModelTier::as_str),
                    "prompt": truncate(&prompt, OUTPUT_EXCERPT),
                }),
                causes,
            )
            .await;
        let invoke_causes = chain(invoked, causes);

        let outcome = match self
            .workspace
            .tool
            .invoke(&self.workspace.repo_dir, &prompt, model)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                self.emit(
                    "mind.claude.failed",
                    json!({"task_id": task.id, "error": error.to_string()}),
                    &invoke_causes,
                )
                .await;
                return self
                    .handle_failure(
                        &task.id,
                        "mind.claude.failed",
                        &format!("claude invocation failed: {error}"),
                        &invoke_causes,
                    )
                    .await;
            }
        };

        let completed = self.record_completion(task, &outcome, &invoke_causes).await;
        let completed_causes = chain(completed, &invoke_causes);
        if !outcome.succeeded() {
            return self
                .handle_failure(
                    &task.id,
                    "mind.claude.failed",
                    &format!("claude failed (exit {})", outcome.exit_code),
                    &completed_causes,
                )
                .await;
        }

        if !self.verify_build(task, &completed_causes).await? {
            return Ok(());
        }
        self.finish_task(task, &completed_causes).await
    }

    /// Ship the work: push, complete, build, then ask to restart.
    async fn finish_task(&mut self, task: &Task, causes: &[String]) -> Result<(), TickError> {
        let message = format!("mind: {}", task.subject);
        match self.workspace.repo.commit_and_push(&message).await {
            Ok(PushOutcome::Pushed) => {
                self.emit(
                    "code.committed",
                    json!({"task_id": task.id, "message": message}),
                    causes,
                )
                .await;
            }
            Ok(PushOutcome::NothingToPush) => {
                tracing::info!(task_id = %task.id, "nothing to push, tree already clean");
            }
            Err(error) => {
                // Unpushed work would be lost on restart: never complete here.
                return self.push_failed(task, &error.to_string(), causes).await;
            }
        }

        self.tasks
            .complete(&task.id)
            .await
            .during("complete_task")?;
        tracing::info!(task_id = %task.id, subject = %task.subject, "task completed");
        self.emit(
            "task.completed",
            json!({"task_id": task.id, "subject": task.subject}),
            causes,
        )
        .await;

        if let Err(error) = self.workspace.repo.build().await {
            tracing::error!(task_id = %task.id, %error, "deployment build failed");
            self.emit(
                "build.deploy.failed",
                json!({"task_id": task.id, "error": truncate(&error.to_string(), OUTPUT_EXCERPT)}),
                causes,
            )
            .await;
            return Ok(());
        }
        let built = self
            .emit("build.completed", json!({"task_id": task.id}), causes)
            .await;
        self.request_restart(task, &chain(built, causes)).await
    }
}
