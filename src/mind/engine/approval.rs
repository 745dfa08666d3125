use super::{Engine, chain};
use crate::authority::{Level, RECOMMENDED_TIMEOUT, RequestStatus};
use crate::error::{StorageError, TickContext, TickError};
use crate::mind::assessor::Proposal;
use crate::task::{NewTask, Task, meta};
use chrono::Utc;
use serde_json::json;

pub(super) const RESTART_ACTION: &str = "restart";
pub(super) const SELF_IMPROVE_ACTION: &str = "self-improve";

impl Engine {
    /// Asks to restart onto freshly built binaries. A policy naming this
    /// engine as approver resolves the request on the spot.
    pub(super) async fn request_restart(
        &mut self,
        task: &Task,
        causes: &[String],
    ) -> Result<(), TickError> {
        let description = format!("Task completed: {}. New binaries built.", task.subject);
        let request = self
            .authority
            .create(
                RESTART_ACTION,
                &description,
                &self.config.actor_name,
                Level::Required,
            )
            .await
            .during("request_restart")?;
        let requested = self
            .emit(
                "authority.requested",
                json!({"task_id": task.id, "authority_id": request.id, "action": RESTART_ACTION}),
                causes,
            )
            .await;
        let causes = chain(requested, causes);

        let policy = match self.authority.match_policy(RESTART_ACTION).await {
            Ok(policy) => policy,
            Err(StorageError::NoPolicy(_)) => {
                tracing::info!(authority_id = %request.id, "no restart policy, waiting for a human");
                self.pending_restart = Some(request.id);
                return Ok(());
            }
            Err(source) => {
                self.pending_restart = Some(request.id);
                return Err(TickError {
                    operation: "match_policy",
                    source,
                });
            }
        };

        if policy.approver_id != self.actor_id {
            tracing::info!(
                authority_id = %request.id,
                approver = %policy.approver_id,
                "restart awaits its approver"
            );
            self.pending_restart = Some(request.id);
            return Ok(());
        }

        self.authority
            .resolve(&request.id, true)
            .await
            .during("self_approve_restart")?;
        tracing::info!(authority_id = %request.id, policy = %policy.action, "self-approved restart");
        self.emit(
            "authority.self_approved",
            json!({"authority_id": request.id, "policy_id": policy.id, "action": RESTART_ACTION}),
            &causes,
        )
        .await;
        self.do_restart(&request.id, &causes).await;
        Ok(())
    }

    /// Only returns when the restart failed.
    pub(super) async fn do_restart(&self, authority_id: &str, causes: &[String]) {
        self.emit(
            "deploy.started",
            json!({"authority_id": authority_id}),
            causes,
        )
        .await;
        if let Err(error) = self.workspace.repo.restart_self().await {
            tracing::error!(%error, "restart failed");
            self.emit(
                "deploy.failed",
                json!({"authority_id": authority_id, "error": error.to_string()}),
                causes,
            )
            .await;
        }
    }

    pub(super) async fn check_restart(&mut self) -> Result<(), TickError> {
        let Some(id) = self.pending_restart.take() else {
            return Ok(());
        };
        let lookup = self.authority.get(&id).await;
        if lookup.is_err() {
            self.pending_restart = Some(id.clone());
        }
        let request = match lookup.during("check_restart")? {
            Some(request) => request,
            None => {
                self.emit(
                    "mind.error",
                    json!({
                        "operation": "check_restart",
                        "authority_id": id,
                        "error": "authority request not found",
                    }),
                    &[],
                )
                .await;
                return Ok(());
            }
        };

        match request.status {
            RequestStatus::Pending => self.pending_restart = Some(id),
            RequestStatus::Approved => {
                tracing::info!(authority_id = %id, "restart approved, deploying");
                self.do_restart(&id, &[]).await;
            }
            RequestStatus::Rejected => tracing::info!(authority_id = %id, "restart rejected"),
        }
        Ok(())
    }

    pub(super) async fn check_proposal(&mut self) -> Result<(), TickError> {
        let Some(id) = self.pending_proposal.take() else {
            return Ok(());
        };
        let lookup = self.authority.get(&id).await;
        if lookup.is_err() {
            self.pending_proposal = Some(id.clone());
        }
        let Some(request) = lookup.during("check_proposal")? else {
            self.emit(
                "mind.error",
                json!({
                    "operation": "check_proposal",
                    "authority_id": id,
                    "error": "authority request not found",
                }),
                &[],
            )
            .await;
            return Ok(());
        };

        let mut status = request.status;
        if status == RequestStatus::Pending {
            if request.level != Level::Recommended || request.age(Utc::now()) < RECOMMENDED_TIMEOUT
            {
                self.pending_proposal = Some(id);
                return Ok(());
            }
            // Keep the slot so a failed resolve is retried next tick.
            self.pending_proposal = Some(id.clone());
            self.authority
                .resolve(&id, true)
                .await
                .during("auto_approve_proposal")?;
            self.pending_proposal = None;
            tracing::info!(authority_id = %id, "auto-approved proposal");
            self.emit(
                "authority.auto_approved",
                json!({
                    "authority_id": id,
                    "action": SELF_IMPROVE_ACTION,
                    "timeout_secs": RECOMMENDED_TIMEOUT.as_secs(),
                }),
                &[],
            )
            .await;
            status = RequestStatus::Approved;
        }

        if status == RequestStatus::Rejected {
            tracing::info!(authority_id = %id, "proposal rejected");
            self.emit("self-improve.rejected", json!({"authority_id": id}), &[])
                .await;
            return Ok(());
        }

        let proposal: Proposal = match serde_json::from_str(&request.description) {
            Ok(proposal) => proposal,
            Err(error) => {
                self.emit(
                    "mind.error",
                    json!({
                        "operation": "check_proposal.parse",
                        "authority_id": id,
                        "error": error.to_string(),
                    }),
                    &[],
                )
                .await;
                return Ok(());
            }
        };

        let task = self
            .tasks
            .create(
                NewTask::new(proposal.subject.as_str(), proposal.description.as_str())
                    .source(self.config.actor_name.as_str())
                    .meta(meta::MODEL, proposal.model.as_str())
                    .meta(meta::SELF_IMPROVE, true)
                    .meta(meta::AUTHORITY_ID, id.as_str()),
            )
            .await
            .during("check_proposal.create_task")?;
        tracing::info!(task_id = %task.id, subject = %task.subject, "created improvement task");
        self.emit(
            "self-improve.task.created",
            json!({"task_id": task.id, "authority_id": id, "subject": task.subject}),
            &[],
        )
        .await;
        Ok(())
    }

    /// Files an assessor proposal for approval and holds it in the slot.
    pub(super) async fn submit_proposal(
        &mut self,
        proposal: &Proposal,
        causes: &[String],
    ) -> Result<(), TickError> {
        let description = serde_json::to_string(proposal).map_err(|e| TickError {
            operation: "submit_proposal.encode",
            source: e.into(),
        })?;
        let request = self
            .authority
            .create(
                SELF_IMPROVE_ACTION,
                &description,
                &self.config.actor_name,
                Level::Recommended,
            )
            .await
            .during("submit_proposal")?;
        self.emit(
            "authority.requested",
            json!({
                "authority_id": request.id,
                "action": SELF_IMPROVE_ACTION,
                "subject": proposal.subject,
            }),
            causes,
        )
        .await;
        tracing::info!(authority_id = %request.id, subject = %proposal.subject, "improvement proposal submitted");
        self.pending_proposal = Some(request.id);
        Ok(())
    }
}
