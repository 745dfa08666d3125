use super::engine_harness::{ACTOR, Harness, engine_config};
use mindloop::authority::{AuthorityStore, Level};
use mindloop::eventgraph::EventStore;
use mindloop::mind::TickOutcome;
use mindloop::task::TaskStatus;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn startup_commits_orphaned_files() {
    let mut h = Harness::new().await;
    h.repo.set_dirty_files(&["src/a.rs", "src/b.rs"]);

    h.engine.startup().await;

    let cleaned = h.events_of("mind.recovery.dirty_tree_cleaned").await;
    assert_eq!(cleaned.len(), 1);
    assert_eq!(cleaned[0].content["file_count"], json!(2));
    assert_eq!(cleaned[0].source, ACTOR);
}

#[tokio::test]
async fn clean_startup_records_nothing() {
    let mut h = Harness::new().await;

    h.engine.startup().await;

    assert!(h.events().await.is_empty());
    assert_eq!(h.repo.count("clean_working_tree"), 1);
}

#[tokio::test]
async fn startup_rehydrates_own_pending_requests() {
    let mut h = Harness::new().await;
    let authority = &h.stores.authority;
    let restart = authority
        .create("restart", "Task completed", ACTOR, Level::Required)
        .await
        .unwrap();
    let proposal = authority
        .create(
            "self-improve",
            r#"{"subject":"s","description":"d","model":"haiku"}"#,
            ACTOR,
            Level::Recommended,
        )
        .await
        .unwrap();
    authority
        .create("restart", "someone else's", "operator", Level::Required)
        .await
        .unwrap();

    h.engine.startup().await;

    assert_eq!(h.engine.pending_restart(), Some(restart.id.as_str()));
    assert_eq!(h.engine.pending_proposal(), Some(proposal.id.as_str()));
    let recovered = h.events_of("mind.state.recovered").await;
    assert_eq!(recovered.len(), 1);
    assert_eq!(
        recovered[0].content["recovered_ids"].as_array().unwrap().len(),
        2
    );
}

#[tokio::test]
async fn missing_binaries_stop_the_tick_before_any_work() {
    let mut config = engine_config();
    config.required_binaries = vec!["no-such-binary-xyz".into()];
    let mut h = Harness::with_config(config).await;
    let task = h.seed_task("Add X", "").await;

    assert_eq!(h.engine.tick().await.unwrap(), TickOutcome::PreflightFailed);

    let failed = h.events_of("mind.preflight.failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].content["missing"], json!(["no-such-binary-xyz"]));
    assert_eq!(h.task(&task.id).await.status, TaskStatus::Pending);
    assert_eq!(h.tool.call_count(), 0);
    assert_eq!(h.repo.count("write_heartbeat"), 1);
}

#[tokio::test]
async fn heartbeat_is_written_every_tick() {
    let mut h = Harness::new().await;

    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();

    assert_eq!(h.repo.count("write_heartbeat"), 3);
}

#[tokio::test]
async fn store_failure_ends_the_tick_with_an_error_event() {
    let mut h = Harness::new().await;
    sqlx::query("DROP TABLE tasks")
        .execute(&h.pool)
        .await
        .unwrap();

    let error = h.engine.tick().await.unwrap_err();

    assert_eq!(error.operation, "list_blocked");
    let errors = h.events_of("mind.error").await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].content["operation"], json!("list_blocked"));
    assert_eq!(h.tool.call_count(), 0);
}

#[tokio::test]
async fn run_survives_a_panicking_tick() {
    let mut config = engine_config();
    config.tick_interval_secs = 1;
    let h = Harness::with_config(config).await;
    h.tool.panic();
    let Harness {
        engine,
        stores,
        tool,
        ..
    } = h;

    let cancel = CancellationToken::new();
    let watcher = async {
        for _ in 0..100 {
            let panics = stores.events.by_type("mind.panic", 10).await.unwrap();
            if !panics.is_empty() {
                cancel.cancel();
                return panics;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        Vec::new()
    };

    let ((), panics) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(engine.run(cancel.clone()), watcher) },
    )
    .await
    .expect("engine stops after cancellation");

    assert_eq!(panics.len(), 1);
    assert_eq!(panics[0].content["error"], json!("scripted tool panic"));
    assert_eq!(tool.call_count(), 1);
}

#[tokio::test]
async fn cancelled_run_returns_promptly() {
    let mut config = engine_config();
    config.tick_interval_secs = 3600;
    let h = Harness::with_config(config).await;
    let Harness { engine, repo, .. } = h;

    let cancel = CancellationToken::new();
    let stopper = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(engine.run(cancel.clone()), stopper)
    })
    .await
    .expect("engine stops after cancellation");

    // The first tick fires immediately; the next one is an hour away.
    assert_eq!(repo.count("write_heartbeat"), 1);
    assert_eq!(repo.count("clean_working_tree"), 1);
}

#[tokio::test]
async fn run_cancelled_before_start_does_nothing() {
    let h = Harness::new().await;
    let Harness { engine, repo, .. } = h;
    let cancel = CancellationToken::new();
    cancel.cancel();

    engine.run(cancel).await;

    assert!(repo.calls().is_empty());
}
