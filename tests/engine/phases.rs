use super::engine_harness::{ACTOR, Harness};
use chrono::{Duration, Utc};
use mindloop::error::PhaseError;
use mindloop::eventgraph::{EventStore, NewEvent, Recorder};
use mindloop::mind::{Assessor, ModelTier, PlanOutcome, Planner, Recoverer, Reviewer};
use mindloop::task::{NewTask, TaskStore, meta};
use serde_json::json;
use std::sync::Arc;

fn recoverer(h: &Harness) -> Recoverer {
    let events: Arc<dyn EventStore> = Arc::new(h.stores.events.clone());
    Recoverer::new(
        h.workspace(),
        Arc::new(h.stores.tasks.clone()),
        Recorder::new(events, ACTOR),
    )
}

fn assessor(h: &Harness) -> Assessor {
    Assessor::new(
        h.workspace(),
        Arc::new(h.stores.tasks.clone()),
        Arc::new(h.stores.events.clone()),
    )
}

// ── Planner ──────────────────────────────────────────────────────

#[tokio::test]
async fn planner_prompt_names_the_task_and_uses_opus() {
    let h = Harness::new().await;
    h.tool.reply("[TASK:Edit src/a.rs|Change a|haiku]");
    let task = h.seed_task("Add X", "Make X configurable").await;

    let outcome = Planner::new(h.workspace()).plan(&task).await.unwrap();

    assert!(matches!(outcome, PlanOutcome::Subtasks(ref s) if s.len() == 1));
    let (prompt, model) = h.tool.calls().remove(0);
    assert_eq!(model, Some(ModelTier::Opus));
    assert!(prompt.contains("Subject: Add X"));
    assert!(prompt.contains("Description:\nMake X configurable"));
    assert!(prompt.contains("Working directory: /work/repo"));
}

#[tokio::test]
async fn planner_reads_prose_as_already_done() {
    let h = Harness::new().await;
    h.tool.reply("I checked: this is already implemented in src/x.rs.");
    let task = h.seed_task("Add X", "").await;

    let outcome = Planner::new(h.workspace()).plan(&task).await.unwrap();

    assert_eq!(outcome, PlanOutcome::AlreadyDone);
}

#[tokio::test]
async fn planner_errors_on_untagged_output_and_failed_exit() {
    let h = Harness::new().await;
    h.tool.reply("Let me think about it.").fail(3, "quota");
    let task = h.seed_task("Add X", "").await;
    let planner = Planner::new(h.workspace());

    assert!(matches!(
        planner.plan(&task).await,
        Err(PhaseError::Unparseable { phase: "plan", .. })
    ));
    assert!(matches!(
        planner.plan(&task).await,
        Err(PhaseError::ToolExit { phase: "plan", code: 3, .. })
    ));
}

// ── Reviewer ─────────────────────────────────────────────────────

#[tokio::test]
async fn reviewer_skips_an_empty_diff() {
    let h = Harness::new().await;
    h.repo.set_diff("  \n");
    let task = h.seed_task("Add X", "").await;

    let issues = Reviewer::new(h.workspace())
        .review(&task, "abc123")
        .await
        .unwrap();

    assert!(issues.is_empty());
    assert_eq!(h.tool.call_count(), 0);
    assert_eq!(h.repo.count("diff abc123"), 1);
}

#[tokio::test]
async fn reviewer_truncates_long_diffs() {
    let h = Harness::new().await;
    let diff = format!("HEAD_MARKER{}TAIL_MARKER", "+".repeat(9000));
    h.repo.set_diff(&diff);
    h.tool.reply("[OK]");
    let task = h.seed_task("Add X", "").await;

    let issues = Reviewer::new(h.workspace())
        .review(&task, "abc123")
        .await
        .unwrap();

    assert!(issues.is_empty());
    let prompt = h.tool.prompts().remove(0);
    assert!(prompt.contains("HEAD_MARKER"));
    assert!(!prompt.contains("TAIL_MARKER"));
    assert!(prompt.contains("Review this diff for task: Add X"));
}

#[tokio::test]
async fn reviewer_returns_each_issue() {
    let h = Harness::new().await;
    h.repo.set_diff("+ x\n");
    h.tool
        .reply("[ISSUE:Fix a in src/a.rs|a is wrong|haiku]\n[ISSUE:Fix b|b is wrong|gpt-9]");
    let task = h.seed_task("Add X", "").await;

    let issues = Reviewer::new(h.workspace())
        .review(&task, "abc123")
        .await
        .unwrap();

    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0].model, ModelTier::Haiku);
    assert_eq!(issues[1].subject, "Fix b");
    assert_eq!(issues[1].model, ModelTier::Sonnet);
}

#[tokio::test]
async fn reviewer_rejects_untagged_output() {
    let h = Harness::new().await;
    h.repo.set_diff("+ x\n");
    h.tool.reply("Seems fine.");
    let task = h.seed_task("Add X", "").await;

    let result = Reviewer::new(h.workspace()).review(&task, "abc123").await;

    assert!(matches!(
        result,
        Err(PhaseError::Unparseable { phase: "review", .. })
    ));
}

// ── Recoverer ────────────────────────────────────────────────────

#[tokio::test]
async fn recovery_sets_the_guard_and_reports_success() {
    let h = Harness::new().await;
    h.tool.reply("Fixed the missing import.");
    let task = h.seed_task("Add X", "wire it up").await;

    let recovered = recoverer(&h)
        .attempt(&task, "build.failed", "error[E0432]: unresolved import", &[])
        .await;

    assert!(recovered);
    assert!(h.task(&task.id).await.meta_flag(meta::RECOVERY_ATTEMPTED));
    assert_eq!(h.events_of("mind.recovery.started").await.len(), 1);
    assert_eq!(h.events_of("mind.recovery.succeeded").await.len(), 1);

    let (prompt, model) = h.tool.calls().remove(0);
    assert_eq!(model, Some(ModelTier::Sonnet));
    assert!(prompt.contains("Subject: Add X"));
    assert!(prompt.contains("Type: build.failed"));
    assert!(prompt.contains("Reason: error[E0432]: unresolved import"));
    assert!(prompt.contains("0123abcd mind: previous change"));
    assert!(prompt.contains("(no causal chain available)"));
    assert!(prompt.contains("cargo check && cargo test"));
}

#[tokio::test]
async fn recovery_is_skipped_once_attempted() {
    let h = Harness::new().await;
    let task = h
        .stores
        .tasks
        .create(NewTask::new("Add X", "").meta(meta::RECOVERY_ATTEMPTED, true))
        .await
        .unwrap();

    let recovered = recoverer(&h).attempt(&task, "build.failed", "boom", &[]).await;

    assert!(!recovered);
    assert_eq!(h.tool.call_count(), 0);
    assert!(h.events().await.is_empty());
}

#[tokio::test]
async fn recovery_fails_when_the_build_still_breaks() {
    let h = Harness::new().await;
    h.tool.reply("Tried something.");
    h.repo.fail_build_and_test("error[E0308]");
    let task = h.seed_task("Add X", "").await;

    let recovered = recoverer(&h).attempt(&task, "build.failed", "boom", &[]).await;

    assert!(!recovered);
    let failed = h.events_of("mind.recovery.failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].content["stage"], json!("build_test"));
    assert!(h.events_of("mind.recovery.succeeded").await.is_empty());
}

#[tokio::test]
async fn causal_context_walks_ancestors_and_the_cause_itself() {
    let h = Harness::new().await;
    let events = &h.stores.events;
    let claimed = events
        .append(NewEvent::new("task.claimed", ACTOR, json!({"task_id": "t1"})))
        .await
        .unwrap();
    let failed = events
        .append(
            NewEvent::new("build.failed", ACTOR, json!({"task_id": "t1"}))
                .caused_by([claimed.id.clone()]),
        )
        .await
        .unwrap();

    let context = recoverer(&h).causal_context(&[failed.id.clone()]).await;

    let claimed_at = context.find("task.claimed").unwrap();
    let failed_at = context.find("build.failed").unwrap();
    assert!(claimed_at < failed_at);
    assert_eq!(context.lines().count(), 2);
}

// ── Assessor ─────────────────────────────────────────────────────

#[tokio::test]
async fn assessor_context_flags_anomalies() {
    let h = Harness::new().await;
    let stuck = h.seed_task("Stuck import", "").await;
    h.set_task_row(
        &stuck.id,
        "in_progress",
        ACTOR,
        &json!({}),
        Utc::now() - Duration::hours(2),
    )
    .await;
    let hopeless = h.seed_task("Hopeless migration", "").await;
    h.set_task_row(
        &hopeless.id,
        "blocked",
        ACTOR,
        &json!({"retry_count": 3, "blocked_reason": "schema drift"}),
        Utc::now(),
    )
    .await;
    h.stores
        .events
        .append(NewEvent::new("build.failed", ACTOR, json!({"error": "E0308"})))
        .await
        .unwrap();

    let context = assessor(&h).gather_context().await;

    assert!(context.contains("- Push: OK"));
    assert!(context.contains("**STALE**: \"Stuck import\""));
    assert!(context.contains("**ABANDONED**: \"Hopeless migration\""));
    assert!(context.contains("- build.failed: 1 total, 1 in last hour"));
    assert!(context.contains("REASON: schema drift"));
    assert!(context.contains("## Recent Event Activity"));
}

#[tokio::test]
async fn assessor_context_on_a_quiet_system() {
    let h = Harness::new().await;

    let context = assessor(&h).gather_context().await;

    assert!(context.contains("- No failure events found"));
    assert!(context.contains("- pending: 0"));
    assert!(!context.contains("## Blocked Tasks"));
}

#[tokio::test]
async fn assessor_returns_a_proposal_or_nothing() {
    let h = Harness::new().await;
    h.tool
        .reply("[IMPROVE:Watch pushes in src/mind/repo.rs|Alert on repeated push failures|opus]")
        .reply("[OK]")
        .reply("no idea");
    let assessor = assessor(&h);

    let proposal = assessor.assess().await.unwrap().unwrap();
    assert_eq!(proposal.subject, "Watch pushes in src/mind/repo.rs");
    assert_eq!(proposal.model, ModelTier::Opus);

    assert!(assessor.assess().await.unwrap().is_none());
    assert!(assessor.assess().await.unwrap().is_none());
    assert_eq!(h.tool.calls()[0].1, Some(ModelTier::Opus));
}
