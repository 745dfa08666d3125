use super::model::ModelTier;
use super::parse::{AssessResponse, SubtaskSpec, parse_assessment};
use super::{OUTPUT_EXCERPT, Workspace};
use crate::error::PhaseError;
use crate::eventgraph::EventStore;
use crate::task::{TaskStatus, TaskStore, meta};
use crate::util::truncate;
use chrono::{Duration, Utc};
use std::fmt::Write as _;
use std::sync::Arc;

/// A self-improvement proposal, stored as JSON in the authority request.
pub type Proposal = SubtaskSpec;

/// Event types counted in the error-pattern section.
pub const FAILURE_EVENT_TYPES: &[&str] = &[
    "build.failed",
    "git.commit_push.failed",
    "mind.claude.failed",
    "mind.plan.failed",
    "mind.review.failed",
    "mind.assess.failed",
    "deploy.failed",
    "build.deploy.failed",
    "mind.recovery.failed",
    "mind.recovery.succeeded",
    "mind.error",
];

const STATUS_SAMPLE: usize = 100;
const RECENT_EVENTS: usize = 30;
const ABANDONED_AFTER_RETRIES: u32 = 3;

const ASSESS_RULES: &str = "You are the mind of an autonomous software-maintenance engine assessing your own operational health.

Below are diagnostics showing your current state: git health, task anomalies, error patterns and recent history.
Your code is in the working directory. Read its README and the engine sources to see which checks exist today.

YOUR CORE QUESTION: For every problem you see, ask:
1. What role or check SHOULD have caught this before it became a problem?
2. Does that check exist in the codebase?
3. If it does not exist, propose building it. That is your highest-priority improvement.

PRIORITY ORDER:
1. BROKEN OPERATIONS: things failing right now (push broken, tasks stuck, errors repeating).
2. MISSING WATCHERS: failure modes nothing monitors. A failure with no detector will recur silently.
3. MISSING FIXERS: problems that are detected but have no automated response.
4. CODE IMPROVEMENTS: only after operational coverage is solid.

Propose the SINGLE most impactful improvement. Not the easiest, the most impactful.

Output format, exactly one tag:
[IMPROVE:subject|description|model]

Where:
- subject = concise task title (include file paths if relevant)
- description = what to change and why (2-3 sentences)
- model = \"haiku\" for trivial, \"sonnet\" for moderate, \"opus\" for complex

If the system is healthy, every failure mode has a watcher and no improvement is needed, output:
[OK]

Output ONLY the [IMPROVE:...] or [OK] tag, nothing else.";

/// Looks at the engine's own history and proposes one improvement.
pub struct Assessor {
    workspace: Workspace,
    tasks: Arc<dyn TaskStore>,
    events: Arc<dyn EventStore>,
}

impl Assessor {
    pub fn new(
        workspace: Workspace,
        tasks: Arc<dyn TaskStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            workspace,
            tasks,
            events,
        }
    }

    /// `None` when the system reports healthy or the answer carries no tag.
    pub async fn assess(&self) -> Result<Option<Proposal>, PhaseError> {
        let prompt = format!(
            "{ASSESS_RULES}\n\n---\n\n{}\nNow read the codebase, analyze, and propose.",
            self.gather_context().await
        );
        let response = self
            .workspace
            .invoke_phase("assess", &prompt, ModelTier::Opus)
            .await?;

        match parse_assessment(&response) {
            AssessResponse::Healthy => Ok(None),
            AssessResponse::Improve(proposal) => Ok(Some(proposal)),
            AssessResponse::Unparseable => {
                tracing::warn!(
                    len = response.len(),
                    excerpt = %truncate(&response, 200),
                    "assessment output unparseable"
                );
                Ok(None)
            }
        }
    }

    /// Diagnostics and history handed to the tool.
    pub async fn gather_context(&self) -> String {
        let mut out = String::from("## Operational Diagnostics\n\n");
        self.git_health(&mut out).await;
        self.task_health(&mut out).await;
        self.error_patterns(&mut out).await;

        match self.events.recent(RECENT_EVENTS).await {
            Ok(events) if !events.is_empty() => {
                out.push_str("## Recent Event Activity\n\n");
                for event in events {
                    let _ = writeln!(
                        out,
                        "- [{}] {} (source={}) {}",
                        event.timestamp.format("%Y-%m-%d %H:%M"),
                        event.event_type,
                        event.source,
                        event.content
                    );
                }
                out.push('\n');
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "assessment could not read recent events"),
        }

        match self.tasks.list(Some(TaskStatus::Completed), 10).await {
            Ok(tasks) if !tasks.is_empty() => {
                out.push_str("## Recently Completed Tasks\n\n");
                for task in tasks {
                    let _ = writeln!(
                        out,
                        "- {} (source={}, assignee={})",
                        task.subject, task.source, task.assignee
                    );
                }
                out.push('\n');
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "assessment could not list completed tasks"),
        }

        match self.tasks.list(Some(TaskStatus::Blocked), 10).await {
            Ok(tasks) if !tasks.is_empty() => {
                out.push_str("## Blocked Tasks\n\n");
                for task in tasks {
                    let _ = write!(
                        out,
                        "- {} (source={}, assignee={})",
                        task.subject, task.source, task.assignee
                    );
                    match task.meta_str(meta::BLOCKED_REASON) {
                        Some(reason) if !reason.is_empty() => {
                            let _ = writeln!(out, " REASON: {reason}");
                        }
                        _ => out.push('\n'),
                    }
                }
                out.push('\n');
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "assessment could not list blocked tasks"),
        }

        out
    }

    async fn git_health(&self, out: &mut String) {
        let repo = &self.workspace.repo;
        out.push_str("### Git Health\n");

        match repo.push_dry_run().await {
            Ok(_) => out.push_str("- Push: OK\n"),
            Err(error) => {
                let _ = writeln!(
                    out,
                    "- **PUSH BROKEN**: git push --dry-run failed: {}",
                    truncate(error.to_string().trim(), OUTPUT_EXCERPT)
                );
            }
        }

        match repo.unpushed_count().await {
            Ok(0) => out.push_str("- Unpushed commits: 0\n"),
            Ok(count) => {
                let _ = writeln!(out, "- **Unpushed commits: {count}**");
            }
            Err(error) => {
                let _ = writeln!(out, "- Unpushed commits: unknown ({error})");
            }
        }

        if let Ok(count) = repo.uncommitted_count().await
            && count > 0
        {
            let _ = writeln!(out, "- Uncommitted changes: {count} files");
        }
        out.push('\n');
    }

    async fn task_health(&self, out: &mut String) {
        out.push_str("### Task Health\n");
        let now = Utc::now();

        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
        ] {
            let tasks = match self.tasks.list(Some(status), STATUS_SAMPLE).await {
                Ok(tasks) => tasks,
                Err(error) => {
                    let _ = writeln!(out, "- {status}: error ({error})");
                    continue;
                }
            };
            let _ = writeln!(out, "- {status}: {}", tasks.len());

            match status {
                TaskStatus::InProgress => {
                    for task in &tasks {
                        let age = now - task.updated_at;
                        if age > Duration::hours(1) {
                            let _ = writeln!(
                                out,
                                "  - **STALE**: {:?} (in_progress for {}m, assignee={})",
                                task.subject,
                                age.num_minutes(),
                                task.assignee
                            );
                        }
                        if task.is_subtask()
                            && let Ok(Some(parent)) = self.tasks.get(&task.parent_id).await
                            && parent.status == TaskStatus::Completed
                        {
                            let _ = writeln!(
                                out,
                                "  - **ORPHANED**: {:?}: parent task already completed",
                                task.subject
                            );
                        }
                    }
                }
                TaskStatus::Blocked => {
                    for task in &tasks {
                        if task.retry_count() >= ABANDONED_AFTER_RETRIES {
                            let _ = writeln!(
                                out,
                                "  - **ABANDONED**: {:?} (retries exhausted, reason: {})",
                                task.subject,
                                task.meta_str(meta::BLOCKED_REASON).unwrap_or_default()
                            );
                        }
                    }
                }
                TaskStatus::Pending | TaskStatus::Completed => {}
            }
        }
        out.push('\n');
    }

    async fn error_patterns(&self, out: &mut String) {
        out.push_str("### Error Patterns (recent events)\n");
        let hour_ago = Utc::now() - Duration::hours(1);
        let mut found = false;

        let sampled = FAILURE_EVENT_TYPES
            .iter()
            .map(|t| (*t, 10))
            .chain(std::iter::once(("task.blocked", 20)));
        for (event_type, limit) in sampled {
            let Ok(events) = self.events.by_type(event_type, limit).await else {
                continue;
            };
            if events.is_empty() {
                continue;
            }
            found = true;
            let recent = events.iter().filter(|e| e.timestamp > hour_ago).count();
            let _ = writeln!(
                out,
                "- {event_type}: {} total, {recent} in last hour",
                events.len()
            );
        }

        if !found {
            out.push_str("- No failure events found\n");
        }
        out.push('\n');
    }
}
