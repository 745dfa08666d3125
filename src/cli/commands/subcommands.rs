use clap::{Subcommand, ValueEnum};

/// Task queue subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TaskCommands {
    /// Queue a new task for the engine
    Add {
        /// Short title
        subject: String,
        /// What to change and why
        #[arg(short, long, default_value = "")]
        description: String,
        /// Higher runs first
        #[arg(short, long, default_value_t = 0)]
        priority: i64,
        /// Model tier hint (haiku, sonnet, opus)
        #[arg(long)]
        model: Option<String>,
        /// Who filed the task
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// List tasks, highest priority first
    List {
        /// Only this status (pending, in_progress, completed, blocked)
        #[arg(long)]
        status: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task with its metadata and subtasks
    Show { id: String },
}

/// Event graph subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum EventCommands {
    /// Newest events first
    Recent {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        /// Only events of this type
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Only events from this source
        #[arg(long, conflicts_with = "event_type")]
        source: Option<String>,
    },
    /// Recompute every hash and check the chain links
    Verify,
    /// Show what led to an event and what followed from it
    Trace {
        id: String,
        #[arg(long, default_value_t = 10)]
        depth: usize,
    },
    /// Substring search over event content
    Search {
        query: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Every event type recorded so far
    Types,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// Authority subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityCommands {
    /// Requests awaiting a decision, oldest first
    Pending,
    /// Approve or reject a pending request
    Resolve { id: String, decision: Decision },
    /// Set who approves an action (`*` matches any action)
    PolicySet {
        action: String,
        /// Actor id, or `self` for the engine's own actor
        #[arg(long)]
        approver: String,
        /// required, recommended or notification
        #[arg(long, default_value = "required")]
        level: String,
    },
    /// List approval policies
    Policies,
}

/// Actor subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ActorCommands {
    /// Register an actor, or return the existing one
    Register {
        name: String,
        /// human, agent or system
        #[arg(long = "type", default_value = "human")]
        actor_type: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// List registered actors
    List,
}
