//! Typed wrapper around the system `git` binary.
//!
//! Every git interaction in the crate goes through [`GitCommand`]: a small
//! builder naming the operation (for error messages), the arguments, the
//! working directory, and a deadline. Commands run as tokio subprocesses
//! with captured output; a non-zero exit becomes [`TavernError::GitError`]
//! carrying the operation name and stderr, and a missing binary becomes
//! [`TavernError::GitNotFound`].
//!
//! The git *source* decides which subcommands to run and how to lay out
//! mirrors and working trees; see `source::git`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::TavernError;

/// Deadline applied to every git subprocess.
const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Whether a `git` executable is reachable on PATH.
#[must_use]
pub fn git_available() -> bool {
    which::which("git").is_ok()
}

/// Builder for one git invocation.
pub struct GitCommand {
    operation: &'static str,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
}

impl GitCommand {
    fn new(operation: &'static str, args: Vec<String>) -> Self {
        Self {
            operation,
            args,
            current_dir: None,
        }
    }

    /// `git clone --mirror <url> <dest>`: the bare mirror kept per
    /// repository URL.
    #[must_use]
    pub fn clone_mirror(url: &str, dest: &Path) -> Self {
        Self::new(
            "clone --mirror",
            vec![
                "clone".into(),
                "--mirror".into(),
                url.into(),
                dest.display().to_string(),
            ],
        )
    }

    /// `git clone <src> <dest>`: a working-tree clone from the local
    /// mirror, no network involved.
    #[must_use]
    pub fn clone_local(src: &Path, dest: &Path) -> Self {
        Self::new(
            "clone",
            vec!["clone".into(), src.display().to_string(), dest.display().to_string()],
        )
    }

    /// `git fetch`: refresh a mirror.
    #[must_use]
    pub fn fetch() -> Self {
        Self::new("fetch", vec!["fetch".into()])
    }

    /// `git rev-parse <rev>`: resolve a symbolic ref to a commit SHA.
    #[must_use]
    pub fn rev_parse(rev: &str) -> Self {
        Self::new("rev-parse", vec!["rev-parse".into(), rev.to_string()])
    }

    /// `git checkout <rev>`: detach a working tree at a commit.
    #[must_use]
    pub fn checkout(rev: &str) -> Self {
        Self::new("checkout", vec!["checkout".into(), rev.to_string()])
    }

    /// `git show <rev>:<path>`: read one file at a revision without a
    /// working tree.
    #[must_use]
    pub fn show_file(rev: &str, path: &str) -> Self {
        Self::new("show", vec!["show".into(), format!("{rev}:{path}")])
    }

    /// Run the command inside `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Run to completion, requiring exit status zero.
    pub async fn execute(self) -> Result<std::process::Output> {
        let mut command = Command::new("git");
        command.args(&self.args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        tracing::debug!(target: "git", operation = self.operation, "running git {:?}", self.args);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::new(TavernError::GitNotFound)
            } else {
                anyhow::Error::new(TavernError::GitError {
                    operation: self.operation.to_string(),
                    stderr: e.to_string(),
                })
            }
        })?;

        let output = timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| TavernError::GitError {
                operation: self.operation.to_string(),
                stderr: format!("timed out after {}s", GIT_TIMEOUT.as_secs()),
            })??;

        if !output.status.success() {
            return Err(TavernError::GitError {
                operation: self.operation.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    /// Run to completion and return trimmed stdout.
    pub async fn execute_stdout(self) -> Result<String> {
        let output = self.execute().await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
