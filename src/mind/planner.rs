use super::Workspace;
use super::model::ModelTier;
use super::parse::{PlanResponse, SubtaskSpec, parse_plan};
use crate::error::PhaseError;
use crate::task::Task;
use crate::util::truncate;
use std::fmt::Write as _;

const PLANNING_RULES: &str = "You are a senior software architect decomposing a task into small, focused subtasks.

Rules:
1. Each subtask should be ONE specific change (usually one file).
2. Include the exact file path in the subject.
3. Order: types and storage first, then logic, then tests.
4. Maximum 8 subtasks. If the task needs more, it is too big, so split differently.
5. Assign a model based on complexity:
   - \"haiku\" for trivial changes (add a comment, rename, simple one-liner)
   - \"sonnet\" for moderate changes (new function, modify a handler, add a test)
   - \"opus\" for complex changes (new module, architectural refactor, tricky logic)

Output format, one tag per subtask, each on its own line:
[TASK:subject|description|model]

If the task is already complete and requires NO code changes, output exactly:
[ALREADY_DONE]

Example:
[TASK:Add validation to src/api/handler.rs|Validate required fields in the create endpoint and return 400 on invalid input|sonnet]
[TASK:Add validation tests in src/api/handler.rs|Test that invalid input returns 400 with an error message|sonnet]

Output ONLY the [TASK:...] tags or [ALREADY_DONE], nothing else.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Subtasks(Vec<SubtaskSpec>),
    AlreadyDone,
}

/// Splits a top-level task into subtasks with the most capable tier.
pub struct Planner {
    workspace: Workspace,
}

impl Planner {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn prompt(&self, task: &Task) -> String {
        let mut prompt = format!(
            "{PLANNING_RULES}\n\n---\n\nDecompose this task into focused subtasks.\n\nSubject: {}\n",
            task.subject
        );
        if !task.description.is_empty() {
            let _ = write!(prompt, "\nDescription:\n{}\n", task.description);
        }
        let _ = write!(
            prompt,
            "\nWorking directory: {}\n\nAnalyze the codebase to understand the current structure before decomposing.",
            self.workspace.repo_dir.display()
        );
        prompt
    }

    pub async fn plan(&self, task: &Task) -> Result<PlanOutcome, PhaseError> {
        let response = self
            .workspace
            .invoke_phase("plan", &self.prompt(task), ModelTier::Opus)
            .await?;

        match parse_plan(&response) {
            PlanResponse::Subtasks(subtasks) => {
                tracing::info!(task_id = %task.id, count = subtasks.len(), "plan produced subtasks");
                Ok(PlanOutcome::Subtasks(subtasks))
            }
            PlanResponse::AlreadyDone => Ok(PlanOutcome::AlreadyDone),
            PlanResponse::Unparseable => Err(PhaseError::Unparseable {
                phase: "plan",
                output: truncate(&response, super::OUTPUT_EXCERPT),
            }),
        }
    }
}
