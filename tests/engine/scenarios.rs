use super::engine_harness::{ACTOR, Harness, contains_in_order};
use chrono::{Duration, Utc};
use mindloop::mind::{ModelTier, PushOutcome, TickOutcome};
use mindloop::task::{NewTask, Task, TaskStatus, TaskStore, meta};
use serde_json::json;

/// A higher-priority task that keeps the claim stage busy so a requeued task
/// stays observable as pending after the tick.
async fn seed_decoy(h: &Harness, priority: i64) -> Task {
    h.stores
        .tasks
        .create(NewTask::new("decoy", "keeps the queue busy").priority(priority))
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_path_plans_implements_reviews_and_deploys() {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    h.repo.set_diff("diff --git a/src/x.rs b/src/x.rs\n+pub fn x() {}\n");
    h.tool
        .reply("[TASK:a|A|haiku][TASK:b|B|sonnet]")
        .reply("")
        .reply("")
        .reply("[OK]");
    let task = h.seed_task("Add X", "").await;

    let outcome = h.engine.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::RanTask(task.id.clone()));

    let subtasks = h.subtasks(&task.id).await;
    assert_eq!(subtasks.len(), 2);
    assert_eq!(subtasks[0].subject, "a");
    assert_eq!(subtasks[1].subject, "b");
    assert!(subtasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(subtasks[0].meta_str(meta::MODEL), Some("haiku"));
    assert_eq!(subtasks[1].meta_str(meta::MODEL), Some("sonnet"));

    let parent = h.task(&task.id).await;
    assert_eq!(parent.status, TaskStatus::Completed);
    assert!(parent.completed_at.is_some());
    assert_eq!(parent.meta_str(meta::START_COMMIT), Some("0123abcd"));

    let types = h.event_types().await;
    assert!(
        contains_in_order(
            &types,
            &[
                "task.claimed",
                "mind.plan.completed",
                "task.claimed",
                "mind.subtask.completed",
                "task.claimed",
                "mind.subtask.completed",
                "mind.review.completed",
                "code.committed",
                "task.completed",
                "build.completed",
                "authority.requested",
                "authority.self_approved",
                "deploy.started",
            ]
        ),
        "unexpected event order: {types:?}"
    );

    let review = h.events_of("mind.review.completed").await;
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].content["clean"], json!(true));

    let models: Vec<_> = h.tool.calls().into_iter().map(|(_, m)| m).collect();
    assert_eq!(
        models,
        vec![
            Some(ModelTier::Opus),
            Some(ModelTier::Haiku),
            Some(ModelTier::Sonnet),
            Some(ModelTier::Opus),
        ]
    );
    assert_eq!(h.repo.count("restart_self"), 1);
    assert!(h.engine.pending_restart().is_none());
}

#[tokio::test]
async fn planner_already_done_completes_without_subtasks() {
    let mut h = Harness::new().await;
    h.tool.reply("Looked around. [ALREADY_DONE]");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert!(h.subtasks(&task.id).await.is_empty());
    assert_eq!(h.events_of("mind.plan.already_done").await.len(), 1);
    assert_eq!(h.events_of("task.completed").await.len(), 1);

    let requests = h.events_of("authority.requested").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].content["action"], json!("restart"));
    assert!(h.engine.pending_restart().is_some());
    assert_eq!(h.tool.call_count(), 1);
}

#[tokio::test]
async fn recovered_subtask_requeues_and_next_tick_finishes() {
    let mut h = Harness::new().await;
    h.tool.reply("[TASK:a|A|haiku]").reply("").reply("fixed the import");
    h.repo.fail_build_and_test("error[E0432]: unresolved import");
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    let types = h.event_types().await;
    assert!(
        contains_in_order(
            &types,
            &[
                "build.failed",
                "mind.recovery.started",
                "mind.recovery.succeeded",
                "task.recovered",
                "task.requeued",
            ]
        ),
        "unexpected event order: {types:?}"
    );

    let subtask = h.subtasks(&task.id).await.remove(0);
    assert_eq!(subtask.status, TaskStatus::Pending);
    assert!(subtask.assignee.is_empty());
    assert!(subtask.meta_flag(meta::RECOVERED));
    assert!(subtask.meta_str(meta::RECOVERED_AT).is_some());
    assert!(!subtask.meta_flag(meta::RECOVERY_ATTEMPTED));
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Pending);

    let recovery_model = h.tool.calls()[2].1;
    assert_eq!(recovery_model, Some(ModelTier::Sonnet));

    let outcome = h.engine.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::RanTask(task.id.clone()));
    assert_eq!(h.events_of("mind.plan.resumed").await.len(), 1);
    assert_eq!(h.events_of("mind.plan.started").await.len(), 1);
    assert_eq!(h.subtasks(&task.id).await[0].status, TaskStatus::Completed);
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Completed);
    assert_eq!(h.tool.call_count(), 4);
}

#[tokio::test]
async fn push_failure_at_finish_blocks_without_completing() {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    h.tool
        .reply("[TASK:a|A|haiku]")
        .reply("")
        .fail(1, "could not diagnose");
    h.repo.push_result(Ok(PushOutcome::NothingToPush));
    h.repo.push_result(Err("! [remote rejected] main -> main (pre-receive hook declined)"));
    let task = h.seed_task("Add X", "").await;

    h.engine.tick().await.unwrap();

    let parent = h.task(&task.id).await;
    assert_eq!(parent.status, TaskStatus::Blocked);
    assert!(parent.completed_at.is_none());
    assert!(
        parent
            .meta_str(meta::BLOCKED_REASON)
            .unwrap()
            .starts_with("git push failed")
    );
    assert_eq!(parent.retry_count(), 0);

    let types = h.event_types().await;
    assert!(types.iter().any(|t| t == "git.commit_push.failed"));
    assert!(types.iter().any(|t| t == "mind.recovery.failed"));
    assert!(!types.iter().any(|t| t == "task.completed"));
    assert!(!types.iter().any(|t| t == "authority.requested"));
    assert_eq!(h.repo.count("build"), 0);
    assert_eq!(h.repo.count("restart_self"), 0);
}

#[tokio::test]
async fn stale_in_progress_task_returns_to_queue() {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    let stale = h.seed_task("Stuck", "").await;
    h.set_task_row(
        &stale.id,
        "in_progress",
        ACTOR,
        &json!({"key": "val"}),
        Utc::now() - Duration::minutes(45),
    )
    .await;
    let decoy = seed_decoy(&h, 10).await;

    let outcome = h.engine.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::RanTask(decoy.id));

    let task = h.task(&stale.id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assignee.is_empty());
    assert!(
        !task
            .meta_str(meta::PREV_FAILURE_REASON)
            .unwrap_or_default()
            .is_empty()
    );
    assert_eq!(task.meta_str("key"), Some("val"));

    let recovered = h.events_of("task.stale.recovered").await;
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].content["task_id"], json!(stale.id));
}

#[tokio::test]
async fn fresh_in_progress_task_is_left_alone() {
    let mut h = Harness::new().await;
    let busy = h.seed_task("Busy", "").await;
    h.set_task_row(
        &busy.id,
        "in_progress",
        ACTOR,
        &json!({}),
        Utc::now() - Duration::minutes(10),
    )
    .await;

    h.engine.tick().await.unwrap();

    assert_eq!(h.task(&busy.id).await.status, TaskStatus::InProgress);
    assert!(h.events_of("task.stale.recovered").await.is_empty());
}

#[tokio::test]
async fn blocked_task_waits_for_backoff_then_retries() {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    let blocked = h.seed_task("Flaky", "").await;
    h.set_task_row(
        &blocked.id,
        "blocked",
        ACTOR,
        &json!({
            "retry_count": 1,
            "blocked_reason": "build/test failed: boom",
            "recovery_attempted": true,
        }),
        Utc::now() - Duration::minutes(20),
    )
    .await;
    seed_decoy(&h, 10).await;
    seed_decoy(&h, 9).await;

    h.engine.tick().await.unwrap();
    assert_eq!(h.task(&blocked.id).await.status, TaskStatus::Blocked);
    assert!(h.events_of("task.retried").await.is_empty());

    h.backdate_task(&blocked.id, Utc::now() - Duration::minutes(35))
        .await;
    h.engine.tick().await.unwrap();

    let task = h.task(&blocked.id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assignee.is_empty());
    assert_eq!(task.retry_count(), 2);
    assert_eq!(
        task.meta_str(meta::PREV_FAILURE_REASON),
        Some("build/test failed: boom")
    );
    assert!(!task.meta_flag(meta::RECOVERY_ATTEMPTED));
    assert_eq!(h.events_of("task.retried").await.len(), 1);
}
