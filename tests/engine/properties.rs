//! Invariants that hold across whole engine runs rather than single stages.

use super::engine_harness::{ACTOR, Harness};
use mindloop::error::StorageError;
use mindloop::eventgraph::EventStore;
use mindloop::task::{TaskStatus, TaskStore};
use std::collections::HashSet;

/// Runs a mixed workload: one task that ships, one whose subtask blocks.
async fn busy_harness() -> (Harness, String, String) {
    let mut h = Harness::new().await;
    h.self_approve_restarts().await;
    h.repo.set_diff("+ change\n");
    h.tool
        .reply("[TASK:a|A|haiku][TASK:b|B|haiku]")
        .reply("")
        .reply("")
        .reply("[OK]");
    let shipped = h.seed_task("Ship it", "").await;
    h.engine.tick().await.unwrap();

    h.tool
        .reply("[TASK:c|C|sonnet]")
        .fail(1, "first")
        .fail(1, "second")
        .fail(1, "recovery gave up");
    let stuck = h.seed_task("Stuck", "").await;
    h.engine.tick().await.unwrap();

    (h, shipped.id, stuck.id)
}

#[tokio::test]
async fn engine_history_forms_an_intact_chain() {
    let (h, _, _) = busy_harness().await;

    let count = h.stores.events.count().await.unwrap();
    let verified = h.stores.events.verify_chain().await.unwrap();
    assert_eq!(verified as u64, count);
    assert!(count > 20);
}

#[tokio::test]
async fn tampering_with_history_is_detected() {
    let (h, _, _) = busy_harness().await;
    let victim = h.events_of("task.completed").await.remove(0);

    sqlx::query("UPDATE events SET content = $1 WHERE id = $2")
        .bind(r#"{"task_id":"forged"}"#)
        .bind(&victim.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let error = h.stores.events.verify_chain().await.unwrap_err();
    assert!(matches!(error, StorageError::ChainBroken { ref event_id, .. } if *event_id == victim.id));
}

#[tokio::test]
async fn every_cause_names_an_earlier_event() {
    let (h, _, _) = busy_harness().await;

    let mut seen = HashSet::new();
    for event in h.events().await {
        assert_eq!(event.source, ACTOR);
        for cause in &event.causes {
            assert!(
                seen.contains(cause),
                "{} cites {cause} before it exists",
                event.event_type
            );
        }
        seen.insert(event.id);
    }
}

#[tokio::test]
async fn completions_trace_back_to_their_claim() {
    let (h, shipped, _) = busy_harness().await;

    let completed = h
        .events_of("task.completed")
        .await
        .into_iter()
        .find(|e| e.content_str("task_id") == Some(shipped.as_str()))
        .unwrap();
    let ancestors = h.stores.events.ancestors(&completed.id, 50).await.unwrap();

    assert!(ancestors.iter().any(|e| {
        e.event_type == "task.claimed" && e.content_str("task_id") == Some(shipped.as_str())
    }));
}

#[tokio::test]
async fn completed_at_tracks_completed_status() {
    let (h, shipped, stuck) = busy_harness().await;

    let all = h.stores.tasks.list(None, 100).await.unwrap();
    assert_eq!(all.len(), 5);
    for task in &all {
        assert_eq!(
            task.completed_at.is_some(),
            task.status == TaskStatus::Completed,
            "task {} ({})",
            task.subject,
            task.status
        );
    }
    assert_eq!(h.task(&shipped).await.status, TaskStatus::Completed);
    assert_eq!(h.task(&stuck).await.status, TaskStatus::Blocked);
}

#[tokio::test]
async fn engine_never_holds_more_than_one_task_in_progress() {
    let (h, _, _) = busy_harness().await;

    let running = h
        .stores
        .tasks
        .list(Some(TaskStatus::InProgress), 100)
        .await
        .unwrap();
    assert!(running.is_empty());
}
