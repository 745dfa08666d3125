use super::Workspace;
use super::model::ModelTier;
use super::parse::{ReviewResponse, SubtaskSpec, parse_review};
use crate::error::PhaseError;
use crate::task::Task;
use crate::util::truncate;

/// Longest diff excerpt handed to the reviewer.
pub const MAX_DIFF_CHARS: usize = 8000;

const REVIEW_RULES: &str = "You are a senior code reviewer examining a git diff.

Check for:
1. Correctness: does the code do what the task asked?
2. Bugs: panics, off-by-one errors, unhandled errors, race conditions.
3. Style: consistent with the patterns already in the codebase.
4. Security: no injection, no leaked secrets, proper input validation.

If the diff looks good, output exactly:
[OK]

If there are issues, output one tag per issue:
[ISSUE:subject|description|model]

Where:
- subject = short fix description (include the file path)
- description = what is wrong and how to fix it
- model = \"haiku\" for trivial, \"sonnet\" for moderate, \"opus\" for complex

Output ONLY [OK] or [ISSUE:...] tags, nothing else.";

/// Reviews the work done for a task since it started.
pub struct Reviewer {
    workspace: Workspace,
}

impl Reviewer {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Issues to fix, empty when the diff is clean or there is no diff.
    pub async fn review(
        &self,
        task: &Task,
        start_commit: &str,
    ) -> Result<Vec<SubtaskSpec>, PhaseError> {
        let diff = self
            .workspace
            .repo
            .diff(start_commit, "HEAD")
            .await
            .map_err(|source| PhaseError::Repo {
                phase: "review",
                source,
            })?;
        if diff.trim().is_empty() {
            tracing::debug!(task_id = %task.id, "nothing to review");
            return Ok(Vec::new());
        }

        let prompt = format!(
            "{REVIEW_RULES}\n\n---\n\nReview this diff for task: {}\n\n```diff\n{}\n```",
            task.subject,
            truncate(&diff, MAX_DIFF_CHARS)
        );
        let response = self
            .workspace
            .invoke_phase("review", &prompt, ModelTier::Opus)
            .await?;

        match parse_review(&response) {
            ReviewResponse::Clean => Ok(Vec::new()),
            ReviewResponse::Issues(issues) => Ok(issues),
            ReviewResponse::Unparseable => Err(PhaseError::Unparseable {
                phase: "review",
                output: truncate(&response, super::OUTPUT_EXCERPT),
            }),
        }
    }
}
