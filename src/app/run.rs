use crate::actor::{Actor, ActorRegistry, ActorType};
use crate::config::Config;
use crate::db::{self, Stores};
use crate::eventgraph::{EventBus, EventSubscription};
use crate::mind::{ClaudeCli, Engine, EngineStores, GitRepo, Workspace};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const REGISTER_ATTEMPTS: u32 = 30;
const REGISTER_DELAY: Duration = Duration::from_secs(1);
const EVENT_FEED_CAPACITY: usize = 256;

/// Boot the engine and tick until SIGINT or SIGTERM.
pub async fn run_engine(config: Config) -> Result<()> {
    if !config.engine.enabled {
        tracing::info!("engine disabled, set ENGINE_ENABLED=true or engine.enabled to run it");
        return Ok(());
    }

    let pool = db::connect(&config.database).await?;
    let stores = Stores::open(pool).await?;
    let actor = register_engine_actor(&stores.actors, &config.engine.actor_name).await?;
    tracing::info!(actor_id = %actor.id, name = %actor.name, "engine actor registered");

    let repo = GitRepo::new(
        config.repo_dir.clone(),
        config.deploy.clone(),
        config.tool.toolchain_bin.clone(),
        config.engine.heartbeat_path.clone(),
    );
    let workspace = Workspace {
        tool: Arc::new(ClaudeCli::new(config.tool.clone())),
        repo: Arc::new(repo),
        repo_dir: config.repo_dir.clone(),
        verify_hint: config.deploy.verify_hint.clone(),
    };
    let bus = EventBus::new(Arc::new(stores.events), EVENT_FEED_CAPACITY);
    let engine_stores = EngineStores {
        events: Arc::new(bus.clone()),
        tasks: Arc::new(stores.tasks),
        authority: Arc::new(stores.authority),
    };
    let engine = Engine::new(config.engine.clone(), actor.id, workspace, engine_stores);

    let cancel = CancellationToken::new();
    spawn_signal_handlers(cancel.clone());
    let feed = tokio::spawn(trace_events(bus.subscribe(), cancel.clone()));
    engine.run(cancel).await;
    if let Err(error) = feed.await {
        tracing::warn!(%error, "event feed task failed");
    }
    Ok(())
}

/// Mirrors appended events into the log at debug level until cancelled.
async fn trace_events(mut feed: EventSubscription, cancel: CancellationToken) -> usize {
    let mut seen = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = feed.next() => {
                let Some(event) = next else { break };
                seen += 1;
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    causes = event.causes.len(),
                    "event appended"
                );
            }
        }
    }
    seen
}

/// The engine's own actor; the store may still be settling right after boot.
pub async fn register_engine_actor(actors: &dyn ActorRegistry, name: &str) -> Result<Actor> {
    let mut attempt = 1;
    loop {
        match actors.register(ActorType::Agent, name, "").await {
            Ok(actor) => return Ok(actor),
            Err(error) if attempt < REGISTER_ATTEMPTS => {
                tracing::warn!(attempt, %error, "actor registration failed, retrying");
                attempt += 1;
                tokio::time::sleep(REGISTER_DELAY).await;
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("Failed to register engine actor {name:?} after {REGISTER_ATTEMPTS} attempts")
                });
            }
        }
    }
}

fn spawn_signal_handlers(cancel: CancellationToken) {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received Ctrl+C, shutting down");
                on_interrupt.cancel();
            }
            Err(error) => tracing::warn!(%error, "failed to install Ctrl+C handler"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                tracing::info!("received SIGTERM, shutting down");
                cancel.cancel();
            }
        });
    }
}
