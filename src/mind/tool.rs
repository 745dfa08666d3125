use super::model::ModelTier;
use crate::config::ToolConfig;
use crate::error::ToolError;
use crate::health::{self, Component};
use crate::util::BoxFuture;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Returned as stderr when the deadline kills the child.
pub const TIMED_OUT: &str = "timed out";

/// Exit code reported for a killed or signalled child.
pub const KILLED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub result: String,
    pub stderr: String,
    pub duration: Duration,
    pub exit_code: i32,
}

impl ToolOutcome {
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// An external coding agent that edits files in a working directory.
///
/// A non-zero exit (including the deadline) is an outcome, not an error;
/// only failing to run the tool at all is.
pub trait CodingTool: Send + Sync {
    fn invoke<'a>(
        &'a self,
        work_dir: &'a Path,
        prompt: &'a str,
        model: Option<ModelTier>,
    ) -> BoxFuture<'a, Result<ToolOutcome, ToolError>>;
}

/// Runs the `claude` CLI in print mode.
pub struct ClaudeCli {
    config: ToolConfig,
    timeout: Duration,
}

#[derive(Deserialize)]
struct PrintEnvelope {
    result: String,
}

impl ClaudeCli {
    pub fn new(config: ToolConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self { config, timeout }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(
        &self,
        work_dir: &Path,
        prompt: &str,
        model: Option<ModelTier>,
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(prompt)
            .args(["--output-format", "json", "--allowedTools"])
            .arg(&self.config.allowed_tools);
        if let Some(model) = model {
            cmd.args(["--model", model.as_str()]);
        }

        for var in &self.config.strip_env {
            cmd.env_remove(var);
        }
        cmd.env(
            "PATH",
            child_path(std::env::var_os("PATH"), &self.config.toolchain_bin),
        );

        cmd.current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// `PATH` for the child: the inherited value with the toolchain directory
/// appended when missing, or a minimal default when unset.
pub(crate) fn child_path(current: Option<OsString>, toolchain_bin: &Path) -> OsString {
    let Some(current) = current else {
        let mut dirs = vec![toolchain_bin.to_path_buf()];
        dirs.extend(["/usr/local/bin", "/usr/bin", "/bin"].map(PathBuf::from));
        return std::env::join_paths(dirs).unwrap_or_default();
    };

    let mut dirs: Vec<PathBuf> = std::env::split_paths(&current).collect();
    if dirs.iter().any(|d| d == toolchain_bin) {
        return current;
    }
    dirs.push(toolchain_bin.to_path_buf());
    std::env::join_paths(dirs).unwrap_or(current)
}

fn extract_result(stdout: &[u8]) -> String {
    serde_json::from_slice::<PrintEnvelope>(stdout).map_or_else(
        |_| String::from_utf8_lossy(stdout).into_owned(),
        |envelope| envelope.result,
    )
}

impl CodingTool for ClaudeCli {
    fn invoke<'a>(
        &'a self,
        work_dir: &'a Path,
        prompt: &'a str,
        model: Option<ModelTier>,
    ) -> BoxFuture<'a, Result<ToolOutcome, ToolError>> {
        Box::pin(async move {
            let started = Instant::now();
            let child = self
                .command(work_dir, prompt, model)
                .spawn()
                .map_err(|source| {
                    health::mark_error(Component::Tool, &source);
                    ToolError::Spawn {
                        binary: self.config.binary.clone(),
                        source,
                    }
                })?;

            // On timeout the dropped child is killed.
            let Ok(output) = tokio::time::timeout(self.timeout, child.wait_with_output()).await
            else {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    model = model.map(ModelTier::as_str),
                    "coding tool deadline exceeded"
                );
                return Ok(ToolOutcome {
                    result: String::new(),
                    stderr: TIMED_OUT.to_string(),
                    duration: started.elapsed(),
                    exit_code: KILLED_EXIT_CODE,
                });
            };
            let output = output.map_err(|source| ToolError::Wait {
                binary: self.config.binary.clone(),
                source,
            })?;

            health::mark_ok(Component::Tool);
            let outcome = ToolOutcome {
                result: extract_result(&output.stdout),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: started.elapsed(),
                exit_code: output.status.code().unwrap_or(KILLED_EXIT_CODE),
            };
            tracing::debug!(
                exit_code = outcome.exit_code,
                duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
                "coding tool finished"
            );
            Ok(outcome)
        })
    }
}
