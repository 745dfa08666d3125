#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod actor;
pub mod app;
pub mod authority;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod eventgraph;
pub mod health;
pub mod mind;
pub mod task;
#[doc(hidden)]
pub mod util;

pub use config::Config;
pub use error::MindError;
