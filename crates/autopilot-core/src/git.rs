use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Worktree primitives consumed by the workspace manager.
#[async_trait]
pub trait WorktreeOps: Send + Sync {
    /// `git worktree add -b <branch> <path> <base>`
    async fn add_worktree_new_branch(
        &self,
        repo_root: &str,
        path: &str,
        branch: &str,
        base: &str,
    ) -> Result<ExecResult>;

    /// `git worktree add <path> <branch>` for a branch that already exists.
    async fn add_worktree_existing(&self, repo_root: &str, path: &str, branch: &str)
        -> Result<ExecResult>;

    /// `git worktree remove --force <path>`
    async fn remove_worktree(&self, repo_root: &str, path: &str) -> Result<ExecResult>;
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub async fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn git -C {} {}", self.repo_path, args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}

/// `WorktreeOps` backed by the local `git` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitCli;

#[async_trait]
impl WorktreeOps for GitCli {
    async fn add_worktree_new_branch(
        &self,
        repo_root: &str,
        path: &str,
        branch: &str,
        base: &str,
    ) -> Result<ExecResult> {
        Git::new(repo_root)
            .exec(&["worktree", "add", "-b", branch, path, base])
            .await
    }

    async fn add_worktree_existing(
        &self,
        repo_root: &str,
        path: &str,
        branch: &str,
    ) -> Result<ExecResult> {
        Git::new(repo_root)
            .exec(&["worktree", "add", path, branch])
            .await
    }

    async fn remove_worktree(&self, repo_root: &str, path: &str) -> Result<ExecResult> {
        Git::new(repo_root)
            .exec(&["worktree", "remove", "--force", path])
            .await
    }
}
