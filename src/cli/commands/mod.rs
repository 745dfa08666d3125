use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod subcommands;

pub use subcommands::{ActorCommands, AuthorityCommands, Decision, EventCommands, TaskCommands};

/// `mindloop` - autonomous software-maintenance engine.
#[derive(Parser, Debug)]
#[command(name = "mindloop")]
#[command(version)]
#[command(about = "An autonomous engine that plans, implements, reviews and ships code changes.", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.mindloop/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine until interrupted
    Run,

    /// Show queue, approvals, event chain and heartbeat
    Status,

    /// Manage the task queue
    Task {
        #[command(subcommand)]
        task_command: TaskCommands,
    },

    /// Inspect the event graph
    Events {
        #[command(subcommand)]
        events_command: EventCommands,
    },

    /// Resolve requests and manage approval policies
    Authority {
        #[command(subcommand)]
        authority_command: AuthorityCommands,
    },

    /// Manage actors
    Actor {
        #[command(subcommand)]
        actor_command: ActorCommands,
    },
}
