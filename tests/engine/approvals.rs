use super::engine_harness::{ACTOR, Harness};
use chrono::{Duration, Utc};
use mindloop::authority::{AuthorityStore, Level, RequestStatus};
use mindloop::mind::{Proposal, TickOutcome};
use mindloop::task::{TaskStatus, TaskStore, meta};
use serde_json::json;

/// Finishes one task through the already-done path, leaving a restart request.
async fn finish_one_task(h: &mut Harness) {
    h.tool.reply("[ALREADY_DONE]");
    h.seed_task("Bump version", "").await;
    h.engine.tick().await.unwrap();
}

#[tokio::test]
async fn restart_waits_for_human_approval() {
    let mut h = Harness::new().await;
    finish_one_task(&mut h).await;
    let request_id = h.engine.pending_restart().unwrap().to_string();

    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::RestartChecked);
    assert_eq!(h.engine.pending_restart(), Some(request_id.as_str()));
    assert_eq!(h.repo.count("restart_self"), 0);

    h.stores.authority.resolve(&request_id, true).await.unwrap();
    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::RestartChecked);

    assert!(h.engine.pending_restart().is_none());
    assert_eq!(h.repo.count("restart_self"), 1);
    let deploys = h.events_of("deploy.started").await;
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].content["authority_id"], json!(request_id));
}

#[tokio::test]
async fn rejected_restart_clears_the_slot() {
    let mut h = Harness::new().await;
    finish_one_task(&mut h).await;
    let request_id = h.engine.pending_restart().unwrap().to_string();

    h.stores.authority.resolve(&request_id, false).await.unwrap();
    h.engine.tick().await.unwrap();

    assert!(h.engine.pending_restart().is_none());
    assert_eq!(h.repo.count("restart_self"), 0);
}

#[tokio::test]
async fn policy_for_another_actor_holds_the_request() {
    let mut h = Harness::new().await;
    h.stores
        .authority
        .create_policy("restart", "operator-1", Level::Required)
        .await
        .unwrap();
    finish_one_task(&mut h).await;

    assert!(h.engine.pending_restart().is_some());
    assert!(h.events_of("authority.self_approved").await.is_empty());
    let pending = h.stores.authority.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, RequestStatus::Pending);
}

#[tokio::test]
async fn wildcard_self_policy_approves_restart() {
    let mut h = Harness::new().await;
    h.stores
        .authority
        .create_policy("*", &h.actor_id, Level::Required)
        .await
        .unwrap();
    finish_one_task(&mut h).await;

    assert!(h.engine.pending_restart().is_none());
    assert_eq!(h.events_of("authority.self_approved").await.len(), 1);
    assert_eq!(h.repo.count("restart_self"), 1);
    assert!(h.stores.authority.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn vanished_restart_request_is_reported_and_dropped() {
    let mut h = Harness::new().await;
    h.stores
        .authority
        .create("restart", "left over", ACTOR, Level::Required)
        .await
        .unwrap();
    h.engine.startup().await;
    assert!(h.engine.pending_restart().is_some());

    sqlx::query("DELETE FROM approval_requests")
        .execute(&h.pool)
        .await
        .unwrap();
    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::RestartChecked);

    assert!(h.engine.pending_restart().is_none());
    let errors = h.events_of("mind.error").await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].content["operation"], json!("check_restart"));
}

#[tokio::test]
async fn idle_proposal_auto_approves_after_timeout() {
    let mut h = Harness::new().await;
    h.tool
        .reply("[IMPROVE:Add push watcher|Alert when git push fails twice in a row|sonnet]");

    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::Assessed);
    let request_id = h.engine.pending_proposal().unwrap().to_string();
    let request = h.stores.authority.get(&request_id).await.unwrap().unwrap();
    assert_eq!(request.level, Level::Recommended);
    assert_eq!(request.action, "self-improve");
    let proposal: Proposal = serde_json::from_str(&request.description).unwrap();
    assert_eq!(proposal.subject, "Add push watcher");

    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::ProposalChecked);
    assert_eq!(h.engine.pending_proposal(), Some(request_id.as_str()));
    assert!(h.stores.tasks.list(None, 10).await.unwrap().is_empty());

    h.backdate_request(&request_id, Utc::now() - Duration::minutes(16))
        .await;
    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::ProposalChecked);

    assert!(h.engine.pending_proposal().is_none());
    assert_eq!(h.events_of("authority.auto_approved").await.len(), 1);
    let tasks = h.stores.tasks.list(None, 10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.subject, "Add push watcher");
    assert_eq!(task.source, ACTOR);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.meta_flag(meta::SELF_IMPROVE));
    assert_eq!(task.meta_str(meta::AUTHORITY_ID), Some(request_id.as_str()));
    assert_eq!(task.meta_str(meta::MODEL), Some("sonnet"));
    assert_eq!(h.events_of("self-improve.task.created").await.len(), 1);
}

#[tokio::test]
async fn rejected_proposal_creates_no_task() {
    let mut h = Harness::new().await;
    h.tool.reply("[IMPROVE:Rewrite everything|Start over|opus]");
    h.engine.tick().await.unwrap();
    let request_id = h.engine.pending_proposal().unwrap().to_string();

    h.stores.authority.resolve(&request_id, false).await.unwrap();
    h.engine.tick().await.unwrap();

    assert!(h.engine.pending_proposal().is_none());
    assert_eq!(h.events_of("self-improve.rejected").await.len(), 1);
    assert!(h.stores.tasks.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn healthy_assessment_files_nothing() {
    let mut h = Harness::new().await;
    h.tool.reply("[OK]");

    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::Assessed);
    assert!(h.engine.pending_proposal().is_none());
    let completed = h.events_of("mind.assess.completed").await;
    assert_eq!(completed[0].content["result"], json!("ok"));

    // Inside the interval the idle tick does nothing.
    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(h.tool.call_count(), 1);
}

#[tokio::test]
async fn failed_assessment_is_recorded() {
    let mut h = Harness::new().await;
    h.tool.fail(1, "rate limited");

    h.engine.tick().await.unwrap();

    assert_eq!(h.events_of("mind.assess.failed").await.len(), 1);
    assert!(h.engine.pending_proposal().is_none());
}

#[tokio::test]
async fn unreadable_restart_slot_is_kept_for_the_next_tick() {
    let mut h = Harness::new().await;
    finish_one_task(&mut h).await;
    let request_id = h.engine.pending_restart().unwrap().to_string();

    sqlx::query("DROP TABLE approval_requests")
        .execute(&h.pool)
        .await
        .unwrap();
    let error = h.engine.tick().await.unwrap_err();

    assert_eq!(error.operation, "check_restart");
    assert_eq!(h.engine.pending_restart(), Some(request_id.as_str()));
    let errors = h.events_of("mind.error").await;
    assert_eq!(errors[0].content["operation"], json!("check_restart"));
}
