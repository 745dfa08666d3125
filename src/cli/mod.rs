pub mod commands;

pub use commands::{ActorCommands, AuthorityCommands, Cli, Commands, EventCommands, TaskCommands};
