use super::engine_harness::{ACTOR, Harness};
use chrono::{Duration, Utc};
use mindloop::mind::{ModelTier, TickOutcome};
use mindloop::task::{NewTask, TaskStatus, TaskStore, meta};
use serde_json::json;

#[tokio::test]
async fn subtask_exit_failure_retries_once_with_error_context() {
    let mut h = Harness::new().await;
    h.tool
        .reply("[TASK:a|A|haiku]")
        .fail(1, "error[E0308]: mismatched types")
        .reply("");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    let subtask = h.subtasks(&task.id).await.remove(0);
    assert_eq!(subtask.status, TaskStatus::Completed);
    assert_eq!(h.events_of("mind.claude.retry").await.len(), 1);

    let calls = h.tool.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].1, Some(ModelTier::Haiku));
    assert_eq!(calls[2].1, Some(ModelTier::Haiku));
    assert!(calls[2].0.contains("exited with code 1"));
    assert!(calls[2].0.contains("error[E0308]"));
    assert!(calls[2].0.ends_with(&calls[1].0));
}

#[tokio::test]
async fn subtask_failing_twice_blocks_subtask_and_parent() {
    let mut h = Harness::new().await;
    h.tool
        .reply("[TASK:a|A|haiku]")
        .fail(1, "first")
        .fail(1, "second")
        .fail(1, "recovery gave up");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    let subtask = h.subtasks(&task.id).await.remove(0);
    assert_eq!(subtask.status, TaskStatus::Blocked);
    assert_eq!(
        subtask.meta_str(meta::BLOCKED_REASON),
        Some("claude failed (exit 1)")
    );
    assert!(subtask.meta_flag(meta::RECOVERY_ATTEMPTED));

    let parent = h.task(&task.id).await;
    assert_eq!(parent.status, TaskStatus::Blocked);
    assert_eq!(
        parent.meta_str(meta::BLOCKED_REASON),
        Some(format!("subtask {} blocked: a", subtask.id).as_str())
    );

    let recovery_calls = h
        .tool
        .calls()
        .iter()
        .filter(|(_, model)| *model == Some(ModelTier::Sonnet))
        .count();
    assert_eq!(recovery_calls, 1);
    assert!(h.events_of("mind.review.started").await.is_empty());
    assert_eq!(h.repo.count("commit_and_push mind: Add X"), 0);
}

#[tokio::test]
async fn resumed_parent_reblocks_behind_a_still_blocked_subtask() {
    let mut h = Harness::new().await;
    let parent = h.seed_task("Add X", "").await;
    let subtask = h
        .stores
        .tasks
        .create(NewTask::new("a", "A").parent(&parent.id))
        .await
        .unwrap();
    h.set_task_row(
        &subtask.id,
        "blocked",
        ACTOR,
        &json!({"retry_count": 3, "blocked_reason": "claude failed (exit 1)"}),
        Utc::now() - Duration::days(7),
    )
    .await;

    let outcome = h.engine.tick().await.unwrap();

    assert_eq!(outcome, TickOutcome::RanTask(parent.id.clone()));
    assert_eq!(h.events_of("mind.plan.resumed").await.len(), 1);
    let claimed = h.events_of("task.claimed").await;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].content["task_id"], json!(parent.id));

    let still_blocked = h.task(&subtask.id).await;
    assert_eq!(still_blocked.status, TaskStatus::Blocked);
    assert_eq!(still_blocked.retry_count(), 3);

    let parent = h.task(&parent.id).await;
    assert_eq!(parent.status, TaskStatus::Blocked);
    assert_eq!(
        parent.meta_str(meta::BLOCKED_REASON),
        Some(format!("subtask {} still blocked: a", subtask.id).as_str())
    );
    assert_eq!(h.tool.call_count(), 0);
}

#[tokio::test]
async fn unparseable_plan_falls_back_to_direct_execution() {
    let mut h = Harness::new().await;
    h.tool.reply("I think we should refactor everything.").reply("done");
    let task = h.seed_task("Tidy logging", "use tracing fields").await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.events_of("mind.plan.failed").await.len(), 1);
    let invoked = h.events_of("mind.claude.invoked").await;
    assert_eq!(invoked.len(), 1);
    assert_eq!(invoked[0].content["mode"], json!("direct"));
    assert!(h.tool.prompts()[1].contains("Subject: Tidy logging"));
    assert!(h.tool.prompts()[1].contains("Description: use tracing fields"));

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert!(h.subtasks(&task.id).await.is_empty());
    assert_eq!(h.repo.count("commit_and_push mind: Tidy logging"), 1);
}

#[tokio::test]
async fn review_issues_become_fix_subtasks() {
    let mut h = Harness::new().await;
    h.repo.set_diff("+ let x = y.unwrap();\n");
    h.tool
        .reply("[TASK:a|A|haiku]")
        .reply("")
        .reply("[ISSUE:Handle missing y|Replace the unwrap with ? in src/x.rs|sonnet]")
        .reply("")
        .reply("[OK]");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    let subtasks = h.subtasks(&task.id).await;
    assert_eq!(subtasks.len(), 2);
    assert_eq!(subtasks[1].subject, "Handle missing y");
    assert_eq!(subtasks[1].meta_str(meta::MODEL), Some("sonnet"));
    assert!(subtasks.iter().all(|t| t.status == TaskStatus::Completed));

    let reviews = h.events_of("mind.review.completed").await;
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0].content["issue_count"], json!(1));
    assert_eq!(reviews[0].content["clean"], json!(false));
    assert_eq!(reviews[1].content["round"], json!(2));
    assert_eq!(reviews[1].content["clean"], json!(true));
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert_eq!(h.repo.count("diff 0123abcd"), 2);
}

#[tokio::test]
async fn unparseable_review_still_finishes() {
    let mut h = Harness::new().await;
    h.repo.set_diff("+ change\n");
    h.tool
        .reply("[TASK:a|A|haiku]")
        .reply("")
        .reply("Looks fine to me overall.");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.events_of("mind.review.failed").await.len(), 1);
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn recovery_runs_at_most_once_per_failure_cycle() {
    let mut h = Harness::new().await;
    h.tool.reply("not a plan").fail(2, "panicked at src/main.rs");
    let task = h
        .stores
        .tasks
        .create(NewTask::new("Retry me", "").meta(meta::RECOVERY_ATTEMPTED, true))
        .await
        .unwrap();

    h.engine.tick().await.unwrap();

    assert_eq!(h.tool.call_count(), 2);
    assert!(h.events_of("mind.recovery.started").await.is_empty());
    let task = h.task(&task.id).await;
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(
        task.meta_str(meta::BLOCKED_REASON),
        Some("claude failed (exit 2)")
    );
}

#[tokio::test]
async fn spawn_errors_block_after_failed_recovery() {
    let mut h = Harness::new().await;
    h.tool.reply("not a plan").spawn_error().spawn_error();
    let task = h.seed_task("Needs claude", "").await;

    h.engine.tick().await.unwrap();

    let failed = h.events_of("mind.recovery.failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].content["stage"], json!("invocation"));
    let task = h.task(&task.id).await;
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(
        task.meta_str(meta::BLOCKED_REASON)
            .unwrap()
            .starts_with("claude invocation failed")
    );
}

#[tokio::test]
async fn failing_deploy_build_completes_but_never_restarts() {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    h.tool.reply("not a plan").reply("");
    h.repo.fail_build("linker error");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert_eq!(h.events_of("build.deploy.failed").await.len(), 1);
    assert!(h.events_of("build.completed").await.is_empty());
    assert!(h.events_of("authority.requested").await.is_empty());
    assert_eq!(h.repo.count("restart_self"), 0);
}

#[tokio::test]
async fn unreadable_start_commit_reviews_recent_history() {
    let mut h = Harness::new().await;
    h.repo.fail_current_commit("fatal: not a git repository");
    h.repo.set_diff("+ change\n");
    h.tool.reply("[TASK:a|A|haiku]").reply("").reply("[OK]");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.task(&task.id).await.meta_str(meta::START_COMMIT), Some("HEAD~20"));
    assert_eq!(h.repo.count("diff HEAD~20"), 1);
}

#[tokio::test]
async fn exhausted_retries_stay_blocked() {
    let mut h = Harness::new().await;
    let task = h.seed_task("Hopeless", "").await;
    h.set_task_row(
        &task.id,
        "blocked",
        ACTOR,
        &json!({"retry_count": 3, "blocked_reason": "still broken"}),
        Utc::now() - Duration::days(30),
    )
    .await;

    let outcome = h.engine.tick().await.unwrap();

    assert_eq!(outcome, TickOutcome::Assessed);
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Blocked);
    assert!(h.events_of("task.retried").await.is_empty());
}

#[tokio::test]
async fn blocked_tasks_of_other_actors_are_not_retried() {
    let mut h = Harness::new().await;
    let task = h.seed_task("Someone else's", "").await;
    h.set_task_row(
        &task.id,
        "blocked",
        "human-operator",
        &json!({"retry_count": 0}),
        Utc::now() - Duration::days(1),
    )
    .await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Blocked);
}

#[tokio::test]
async fn pending_tasks_assigned_elsewhere_are_skipped() {
    let mut h = Harness::new().await;
    h.stores
        .tasks
        .create(NewTask::new("Theirs", "").assignee("human-operator"))
        .await
        .unwrap();

    let outcome = h.engine.tick().await.unwrap();

    assert_eq!(outcome, TickOutcome::Assessed);
    assert!(h.events_of("task.claimed").await.is_empty());
}

#[tokio::test]
async fn previous_failure_reason_reaches_the_prompt() {
    let mut h = Harness::new().await;
    h.tool.reply("not a plan").reply("");
    h.stores
        .tasks
        .create(
            NewTask::new("Try again", "")
                .meta(meta::PREV_FAILURE_REASON, "build/test failed: E0599"),
        )
        .await
        .unwrap();

    h.engine.tick().await.unwrap();

    assert!(h.tool.prompts()[1].starts_with(
        "IMPORTANT: Previous attempt failed with: build/test failed: E0599."
    ));
}
