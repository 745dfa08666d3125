use crate::actor::{ActorRegistry, ActorType};
use crate::authority::{AuthorityStore, Level};
use crate::cli::commands::Decision;
use crate::cli::{ActorCommands, AuthorityCommands, Cli, Commands, EventCommands, TaskCommands};
use crate::config::Config;
use crate::db::{self, Stores};
use crate::eventgraph::{Event, EventStore, NewEvent};
use crate::mind::ModelTier;
use crate::task::{NewTask, Task, TaskStatus, TaskStore, meta};
use crate::util::{format_timestamp, truncate};
use anyhow::{Context, Result, bail};
use std::fmt::Write as _;

use super::run::{register_engine_actor, run_engine};
use super::status::render_status;

/// Source recorded on events written by CLI commands.
const CLI_SOURCE: &str = "cli";

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Status => {
            let stores = open_stores(&config).await?;
            println!("{}", render_status(&config, &stores).await?);
            Ok(())
        }
        Commands::Task { task_command } => {
            handle_task(task_command, &open_stores(&config).await?).await
        }
        Commands::Events { events_command } => {
            handle_events(events_command, &open_stores(&config).await?).await
        }
        Commands::Authority { authority_command } => {
            let stores = open_stores(&config).await?;
            handle_authority(authority_command, &config, &stores).await
        }
        Commands::Actor { actor_command } => {
            handle_actor(actor_command, &open_stores(&config).await?).await
        }
    }
}

async fn open_stores(config: &Config) -> Result<Stores> {
    let pool = db::connect(&config.database).await?;
    Stores::open(pool).await
}

async fn handle_task(command: TaskCommands, stores: &Stores) -> Result<()> {
    match command {
        TaskCommands::Add {
            subject,
            description,
            priority,
            model,
            source,
        } => {
            let mut new_task = NewTask::new(subject, description)
                .source(source.as_str())
                .priority(priority);
            if let Some(raw) = model {
                let tier = ModelTier::from_known(&raw)
                    .with_context(|| format!("unknown model tier {raw:?}"))?;
                new_task = new_task.meta(meta::MODEL, tier.as_str());
            }
            let task = stores.tasks.create(new_task).await?;
            let content = serde_json::json!({"task_id": task.id, "subject": task.subject});
            if let Err(error) = stores
                .events
                .append(NewEvent::new("task.created", source, content))
                .await
            {
                tracing::warn!(%error, "failed to record task.created");
            }
            println!("Created task {}", task.id);
        }
        TaskCommands::List { status, limit } => {
            let status = status
                .map(|s| s.parse::<TaskStatus>())
                .transpose()
                .context("invalid --status")?;
            let tasks = stores.tasks.list(status, limit).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                println!("{}", task_line(task));
            }
        }
        TaskCommands::Show { id } => {
            let Some(task) = stores.tasks.get(&id).await? else {
                bail!("task {id} not found");
            };
            println!("{}", task_line(&task));
            if !task.description.is_empty() {
                println!("\n{}\n", task.description);
            }
            println!("source    {}", task.source);
            println!("created   {}", format_timestamp(task.created_at));
            println!("updated   {}", format_timestamp(task.updated_at));
            if let Some(done) = task.completed_at {
                println!("completed {}", format_timestamp(done));
            }
            if task.is_subtask() {
                println!("parent    {}", task.parent_id);
            }
            if !task.metadata.is_empty() {
                println!(
                    "metadata  {}",
                    serde_json::to_string_pretty(&task.metadata)?
                );
            }
            let subtasks = stores.tasks.by_parent(&task.id).await?;
            if !subtasks.is_empty() {
                println!("subtasks:");
                for subtask in &subtasks {
                    println!("  {}", task_line(subtask));
                }
            }
        }
    }
    Ok(())
}

async fn handle_events(command: EventCommands, stores: &Stores) -> Result<()> {
    match command {
        EventCommands::Recent {
            limit,
            event_type,
            source,
        } => {
            let events = match (event_type, source) {
                (Some(event_type), _) => stores.events.by_type(&event_type, limit).await?,
                (None, Some(source)) => stores.events.by_source(&source, limit).await?,
                (None, None) => stores.events.recent(limit).await?,
            };
            print_events(&events);
        }
        EventCommands::Verify => {
            let verified = stores
                .events
                .verify_chain()
                .await
                .context("event chain verification failed")?;
            println!("Chain intact: {verified} events verified.");
        }
        EventCommands::Trace { id, depth } => {
            let Some(event) = stores.events.get(&id).await? else {
                bail!("event {id} not found");
            };
            let ancestors = stores.events.ancestors(&id, depth).await?;
            let descendants = stores.events.descendants(&id, depth).await?;
            println!("Caused by ({}):", ancestors.len());
            print_events(&ancestors);
            println!("\nEvent:");
            print_events(std::slice::from_ref(&event));
            println!("\nLed to ({}):", descendants.len());
            print_events(&descendants);
        }
        EventCommands::Search { query, limit } => {
            print_events(&stores.events.search(&query, limit).await?);
        }
        EventCommands::Types => {
            for event_type in stores.events.distinct_types().await? {
                println!("{event_type}");
            }
        }
    }
    Ok(())
}

async fn handle_authority(
    command: AuthorityCommands,
    config: &Config,
    stores: &Stores,
) -> Result<()> {
    match command {
        AuthorityCommands::Pending => {
            let pending = stores.authority.pending().await?;
            if pending.is_empty() {
                println!("No pending requests.");
            }
            for request in &pending {
                println!(
                    "{} {:<12} [{}] from {} at {}\n    {}",
                    request.id,
                    request.action,
                    request.level,
                    request.source,
                    format_timestamp(request.created_at),
                    truncate(&request.description, 200)
                );
            }
        }
        AuthorityCommands::Resolve { id, decision } => {
            let approved = decision == Decision::Approve;
            let request = stores.authority.resolve(&id, approved).await?;
            let content = serde_json::json!({
                "authority_id": request.id,
                "action": request.action,
                "approved": approved,
            });
            if let Err(error) = stores
                .events
                .append(NewEvent::new("authority.resolved", CLI_SOURCE, content))
                .await
            {
                tracing::warn!(%error, "failed to record authority.resolved");
            }
            println!("{} {} ({})", request.id, request.status, request.action);
        }
        AuthorityCommands::PolicySet {
            action,
            approver,
            level,
        } => {
            let level: Level = level.parse().context("invalid --level")?;
            let approver_id = if approver == "self" {
                register_engine_actor(&stores.actors, &config.engine.actor_name)
                    .await?
                    .id
            } else {
                approver
            };
            let policy = stores
                .authority
                .create_policy(&action, &approver_id, level)
                .await?;
            println!(
                "Policy {}: {} approved by {} [{}]",
                policy.id, policy.action, policy.approver_id, policy.level
            );
        }
        AuthorityCommands::Policies => {
            let policies = stores.authority.list_policies().await?;
            if policies.is_empty() {
                println!("No policies.");
            }
            for policy in &policies {
                println!(
                    "{} {:<12} approver={} [{}]",
                    policy.id, policy.action, policy.approver_id, policy.level
                );
            }
        }
    }
    Ok(())
}

async fn handle_actor(command: ActorCommands, stores: &Stores) -> Result<()> {
    match command {
        ActorCommands::Register {
            name,
            actor_type,
            email,
        } => {
            let actor_type: ActorType = actor_type.parse().context("invalid --type")?;
            let actor = stores.actors.register(actor_type, &name, &email).await?;
            println!("{} {} ({})", actor.id, actor.name, actor.actor_type);
        }
        ActorCommands::List => {
            for actor in stores.actors.list().await? {
                println!(
                    "{} {:<16} {:<7} {}",
                    actor.id,
                    actor.name,
                    actor.actor_type,
                    actor.email.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{} [{}] p{} {}",
        task.id, task.status, task.priority, task.subject
    );
    if !task.assignee.is_empty() {
        let _ = write!(line, " @{}", task.assignee);
    }
    if let Some(reason) = task.meta_str(meta::BLOCKED_REASON)
        && task.status == TaskStatus::Blocked
    {
        let _ = write!(line, " ({})", truncate(reason, 80));
    }
    line
}

fn print_events(events: &[Event]) {
    for event in events {
        println!(
            "{} {} {:<28} {:<8} {}",
            format_timestamp(event.timestamp),
            event.id,
            event.event_type,
            event.source,
            truncate(&event.content.to_string(), 160)
        );
    }
}
