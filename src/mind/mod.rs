//! The autonomous maintenance loop and the phases it drives.
//!
//! The [`engine::Engine`] claims tasks, asks the [`planner::Planner`] to split
//! them, runs each subtask through the coding tool, has the
//! [`reviewer::Reviewer`] check the diff and ships the result. Failures go
//! through the [`recoverer::Recoverer`] before a task is blocked; an idle
//! engine runs the [`assessor::Assessor`] to propose its own next task.

pub mod assessor;
pub mod engine;
pub mod model;
pub mod parse;
pub mod planner;
pub mod recoverer;
pub mod repo;
pub mod reviewer;
pub mod tool;

pub use assessor::{Assessor, Proposal};
pub use engine::{Engine, EngineStores, TickOutcome};
pub use model::ModelTier;
pub use parse::SubtaskSpec;
pub use planner::{PlanOutcome, Planner};
pub use recoverer::Recoverer;
pub use repo::{GitRepo, PushOutcome, RepoDriver};
pub use reviewer::Reviewer;
pub use tool::{ClaudeCli, CodingTool, ToolOutcome};

use crate::error::PhaseError;
use crate::task::{Task, meta};
use crate::util::truncate;
use std::path::PathBuf;
use std::sync::Arc;

/// Characters of tool output kept in errors and event payloads.
pub(crate) const OUTPUT_EXCERPT: usize = 500;

/// What every phase works through: the coding tool, the repository and the
/// command quoted to the tool for verification.
#[derive(Clone)]
pub struct Workspace {
    pub tool: Arc<dyn CodingTool>,
    pub repo: Arc<dyn RepoDriver>,
    pub repo_dir: PathBuf,
    pub verify_hint: String,
}

impl Workspace {
    /// Run one tool call for `phase`, treating a non-zero exit as an error.
    pub(crate) async fn invoke_phase(
        &self,
        phase: &'static str,
        prompt: &str,
        model: ModelTier,
    ) -> Result<String, PhaseError> {
        let outcome = self
            .tool
            .invoke(&self.repo_dir, prompt, Some(model))
            .await
            .map_err(|source| PhaseError::Invocation { phase, source })?;
        if !outcome.succeeded() {
            return Err(PhaseError::ToolExit {
                phase,
                code: outcome.exit_code,
                output: truncate(&outcome.result, OUTPUT_EXCERPT),
            });
        }
        Ok(outcome.result)
    }
}

/// Prepends the reason the previous attempt failed, when there was one.
pub(crate) fn with_failure_context(task: &Task, prompt: String) -> String {
    match task.meta_str(meta::PREV_FAILURE_REASON) {
        Some(reason) if !reason.is_empty() => format!(
            "IMPORTANT: Previous attempt failed with: {reason}. Avoid repeating this mistake.\n\n{prompt}"
        ),
        _ => prompt,
    }
}
