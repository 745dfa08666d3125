use super::tool::child_path;
use crate::config::{DeployConfig, DeployTarget};
use crate::error::RepoError;
use crate::health::{self, Component};
use crate::util::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;

pub const ORPHAN_COMMIT_MESSAGE: &str = "mind: orphaned changes from crash recovery";

const UP_TO_DATE: &str = "Everything up-to-date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Tree was clean and the remote already had every commit.
    NothingToPush,
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Version control, build and process control for the maintained repository.
pub trait RepoDriver: Send + Sync {
    fn current_commit(&self) -> BoxFuture<'_, RepoResult<String>>;

    fn diff<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, RepoResult<String>>;

    /// Commits and pushes changes left behind by a crash. Returns the dirty
    /// paths, empty when the tree was clean.
    fn clean_working_tree(&self) -> BoxFuture<'_, RepoResult<Vec<String>>>;

    fn commit_and_push<'a>(&'a self, message: &'a str) -> BoxFuture<'a, RepoResult<PushOutcome>>;

    /// Release build, then install every deployment binary.
    fn build(&self) -> BoxFuture<'_, RepoResult<()>>;

    fn build_and_test(&self) -> BoxFuture<'_, RepoResult<()>>;

    /// Replaces the running process. Only returns on failure.
    fn restart_self(&self) -> BoxFuture<'_, RepoResult<()>>;

    fn write_heartbeat(&self) -> BoxFuture<'_, RepoResult<()>>;

    fn recent_log(&self, count: usize) -> BoxFuture<'_, RepoResult<String>>;

    fn diff_stat(&self) -> BoxFuture<'_, RepoResult<String>>;

    fn push_dry_run(&self) -> BoxFuture<'_, RepoResult<String>>;

    fn unpushed_count(&self) -> BoxFuture<'_, RepoResult<usize>>;

    fn uncommitted_count(&self) -> BoxFuture<'_, RepoResult<usize>>;
}

/// Drives `git` and `cargo` in a working copy.
pub struct GitRepo {
    dir: PathBuf,
    deploy: DeployConfig,
    toolchain_bin: PathBuf,
    heartbeat_path: PathBuf,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

impl GitRepo {
    pub fn new(
        dir: impl Into<PathBuf>,
        deploy: DeployConfig,
        toolchain_bin: impl Into<PathBuf>,
        heartbeat_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dir: dir.into(),
            deploy,
            toolchain_bin: toolchain_bin.into(),
            heartbeat_path: heartbeat_path.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> RepoResult<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args.iter().map(AsRef::as_ref))
            .current_dir(&self.dir)
            .env(
                "PATH",
                child_path(std::env::var_os("PATH"), &self.toolchain_bin),
            )
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                health::mark_error(Component::Repo, &e);
                e
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            return Ok(result);
        }

        let err = RepoError::Command {
            program: program.to_string(),
            args: args
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(" "),
            status: output.status.to_string(),
            output: result.combined(),
        };
        health::mark_error(Component::Repo, &err);
        Err(err)
    }

    async fn git(&self, args: &[&str]) -> RepoResult<CommandOutput> {
        self.run("git", args).await
    }

    async fn cargo(&self, args: &[String]) -> RepoResult<CommandOutput> {
        self.run(&self.deploy.cargo, args).await
    }

    async fn dirty_files(&self) -> RepoResult<Vec<String>> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&status.stdout))
    }

    async fn push(&self) -> RepoResult<CommandOutput> {
        self.git(&["push", &self.deploy.remote, &self.deploy.branch])
            .await
    }

    async fn commit_all(&self, message: &str) -> RepoResult<()> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message]).await?;
        Ok(())
    }

    /// Copies through a sibling file and renames, so a running binary at
    /// `target.path` is replaced rather than written into.
    async fn install(&self, target: &DeployTarget) -> RepoResult<()> {
        let built = self.dir.join("target").join("release").join(&target.name);
        if let Some(parent) = target.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut staging = target.path.clone().into_os_string();
        staging.push(".new");
        let staging = PathBuf::from(staging);

        tokio::fs::copy(&built, &staging).await?;
        tokio::fs::rename(&staging, &target.path).await?;
        tracing::info!(
            binary = %target.name,
            path = %target.path.display(),
            "installed binary"
        );
        Ok(())
    }
}

fn parse_porcelain(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| line.get(2..))
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

fn backup_path(binary: &Path) -> PathBuf {
    let mut backup = binary.as_os_str().to_os_string();
    backup.push(".bak");
    PathBuf::from(backup)
}

impl RepoDriver for GitRepo {
    fn current_commit(&self) -> BoxFuture<'_, RepoResult<String>> {
        Box::pin(async move {
            let out = self.git(&["rev-parse", "HEAD"]).await?;
            Ok(out.stdout.trim().to_string())
        })
    }

    fn diff<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, RepoResult<String>> {
        Box::pin(async move {
            let range = format!("{from}..{to}");
            Ok(self.git(&["diff", &range]).await?.stdout)
        })
    }

    fn clean_working_tree(&self) -> BoxFuture<'_, RepoResult<Vec<String>>> {
        Box::pin(async move {
            let files = self.dirty_files().await?;
            if files.is_empty() {
                return Ok(files);
            }
            tracing::warn!(count = files.len(), "committing orphaned changes");

            let committed = async {
                self.commit_all(ORPHAN_COMMIT_MESSAGE).await?;
                self.push().await?;
                Ok(())
            }
            .await;
            match committed {
                Ok(()) => Ok(files),
                Err(source) => Err(RepoError::Orphans {
                    files,
                    source: Box::new(source),
                }),
            }
        })
    }

    fn commit_and_push<'a>(&'a self, message: &'a str) -> BoxFuture<'a, RepoResult<PushOutcome>> {
        Box::pin(async move {
            let tree_clean = self.dirty_files().await?.is_empty();
            if !tree_clean {
                self.commit_all(message).await?;
            }

            // Pushed even when clean: earlier commits may not have reached the remote.
            let pushed = self.push().await?;
            health::mark_ok(Component::Repo);
            if tree_clean && pushed.combined().contains(UP_TO_DATE) {
                return Ok(PushOutcome::NothingToPush);
            }
            Ok(PushOutcome::Pushed)
        })
    }

    fn build(&self) -> BoxFuture<'_, RepoResult<()>> {
        Box::pin(async move {
            self.cargo(&self.deploy.release_args).await?;
            for target in &self.deploy.targets {
                self.install(target).await?;
            }
            Ok(())
        })
    }

    fn build_and_test(&self) -> BoxFuture<'_, RepoResult<()>> {
        Box::pin(async move {
            self.cargo(&self.deploy.check_args).await?;
            self.cargo(&self.deploy.test_args).await?;
            health::mark_ok(Component::Repo);
            Ok(())
        })
    }

    fn restart_self(&self) -> BoxFuture<'_, RepoResult<()>> {
        Box::pin(async move {
            let binary = &self.deploy.engine_binary;
            if let Err(error) = tokio::fs::copy(binary, backup_path(binary)).await {
                tracing::warn!(%error, binary = %binary.display(), "binary backup failed, restarting anyway");
            }
            exec_replace(binary)
        })
    }

    fn write_heartbeat(&self) -> BoxFuture<'_, RepoResult<()>> {
        Box::pin(async move {
            tokio::fs::write(&self.heartbeat_path, health::heartbeat_bytes()).await?;
            Ok(())
        })
    }

    fn recent_log(&self, count: usize) -> BoxFuture<'_, RepoResult<String>> {
        Box::pin(async move {
            let count = count.to_string();
            Ok(self.git(&["log", "--oneline", "-n", &count]).await?.stdout)
        })
    }

    fn diff_stat(&self) -> BoxFuture<'_, RepoResult<String>> {
        Box::pin(async move { Ok(self.git(&["diff", "--stat"]).await?.stdout) })
    }

    fn push_dry_run(&self) -> BoxFuture<'_, RepoResult<String>> {
        Box::pin(async move {
            let out = self
                .git(&["push", "--dry-run", &self.deploy.remote, &self.deploy.branch])
                .await?;
            Ok(out.combined())
        })
    }

    fn unpushed_count(&self) -> BoxFuture<'_, RepoResult<usize>> {
        Box::pin(async move {
            let range = format!("{}/{}..HEAD", self.deploy.remote, self.deploy.branch);
            let out = self.git(&["log", "--oneline", &range]).await?;
            Ok(out.stdout.lines().filter(|l| !l.trim().is_empty()).count())
        })
    }

    fn uncommitted_count(&self) -> BoxFuture<'_, RepoResult<usize>> {
        Box::pin(async move { Ok(self.dirty_files().await?.len()) })
    }
}

/// Re-executes `binary` with this process's arguments and environment.
#[cfg(unix)]
fn exec_replace(binary: &Path) -> RepoResult<()> {
    use std::os::unix::process::CommandExt;

    tracing::info!(binary = %binary.display(), "re-executing engine");
    let err = std::process::Command::new(binary)
        .args(std::env::args_os().skip(1))
        .exec();
    health::mark_error(Component::Repo, &err);
    Err(RepoError::Io(err))
}

#[cfg(not(unix))]
fn exec_replace(_binary: &Path) -> RepoResult<()> {
    Err(RepoError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "in-place restart requires a unix platform",
    )))
}
