use std::process::Stdio;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::git::ExecResult;
use crate::types::CheckRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Squash => "--squash",
            Self::Merge => "--merge",
            Self::Rebase => "--rebase",
        }
    }
}

impl FromStr for MergeMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "squash" => Ok(Self::Squash),
            "merge" => Ok(Self::Merge),
            "rebase" => Ok(Self::Rebase),
            other => Err(anyhow!("unknown merge method '{other}'")),
        }
    }
}

/// Pull-request and check-status primitives of the code host.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Opens a PR for an already-pushed branch and returns its URL.
    async fn create_pr(&self, branch: &str, title: &str, body: &str) -> Result<String>;

    async fn pr_diff(&self, pr: u64) -> Result<String>;

    async fn pr_checks(&self, pr: u64) -> Result<Vec<CheckRun>>;

    async fn comment(&self, pr: u64, body: &str) -> Result<()>;

    /// Merges only if the host reports the PR as mergeable.
    async fn merge_pr(&self, pr: u64, method: MergeMethod) -> Result<()>;

    async fn pr_number_for_branch(&self, branch: &str) -> Result<Option<u64>>;
}

/// Extract the PR number from a URL like `https://github.com/o/r/pull/7`.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    let (_, rest) = url.rsplit_once("/pull/")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `CodeHost` backed by the GitHub CLI.
pub struct GhCli {
    /// Directory `gh` runs in; the repo is inferred from its remote unless `repo` is set.
    pub repo_root: String,
    /// Optional `owner/name` passed as `--repo`.
    pub repo: Option<String>,
    pub token: Option<String>,
}

impl GhCli {
    pub fn new(repo_root: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            repo: None,
            token: None,
        }
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        let repo = repo.into();
        self.repo = (!repo.is_empty()).then_some(repo);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    async fn gh(&self, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("gh");
        cmd.args(args);
        if let Some(repo) = &self.repo {
            cmd.arg("--repo").arg(repo);
        }
        if let Some(token) = &self.token {
            cmd.env("GH_TOKEN", token);
        }
        debug!("gh {}", args.join(" "));
        let output = cmd
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn gh {}", args.first().unwrap_or(&"")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}

#[async_trait]
impl CodeHost for GhCli {
    async fn create_pr(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let out = self
            .gh(&["pr", "create", "--head", branch, "--title", title, "--body", body])
            .await?;
        if !out.success() {
            bail!("gh pr create {branch} failed: {}", out.combined_output().trim());
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn pr_diff(&self, pr: u64) -> Result<String> {
        let n = pr.to_string();
        let out = self.gh(&["pr", "diff", &n]).await?;
        if !out.success() {
            bail!("gh pr diff {pr} failed: {}", out.combined_output().trim());
        }
        Ok(out.stdout)
    }

    async fn pr_checks(&self, pr: u64) -> Result<Vec<CheckRun>> {
        let n = pr.to_string();
        // Exits non-zero while checks are pending or failing; stdout still carries the JSON.
        let out = self.gh(&["pr", "checks", &n, "--json", "name,state"]).await?;
        parse_checks(&out)
    }

    async fn comment(&self, pr: u64, body: &str) -> Result<()> {
        let n = pr.to_string();
        let out = self.gh(&["pr", "comment", &n, "--body", body]).await?;
        if !out.success() {
            bail!("gh pr comment {pr} failed: {}", out.combined_output().trim());
        }
        Ok(())
    }

    async fn merge_pr(&self, pr: u64, method: MergeMethod) -> Result<()> {
        let n = pr.to_string();
        let view = self
            .gh(&["pr", "view", &n, "--json", "mergeable,mergeStateStatus"])
            .await?;
        if !view.success() {
            bail!("Failed to check PR status: {}", view.combined_output().trim());
        }
        ensure_mergeable(&view.stdout)?;

        let out = self
            .gh(&[
                "pr",
                "merge",
                &n,
                method.as_flag(),
                "--body",
                "Auto-merged by Autopilot after passing all checks.",
            ])
            .await?;
        if !out.success() {
            bail!("gh pr merge {pr} failed: {}", out.combined_output().trim());
        }
        Ok(())
    }

    async fn pr_number_for_branch(&self, branch: &str) -> Result<Option<u64>> {
        let out = self
            .gh(&["pr", "list", "--head", branch, "--json", "number", "--limit", "1"])
            .await?;
        if !out.success() {
            bail!("gh pr list --head {branch} failed: {}", out.combined_output().trim());
        }
        #[derive(Deserialize)]
        struct Numbered {
            number: u64,
        }
        let prs: Vec<Numbered> =
            serde_json::from_str(out.stdout.trim()).context("parse gh pr list output")?;
        Ok(prs.first().map(|p| p.number))
    }
}

fn parse_checks(out: &ExecResult) -> Result<Vec<CheckRun>> {
    let stdout = out.stdout.trim();
    if !stdout.is_empty() {
        return serde_json::from_str(stdout).context("parse gh pr checks output");
    }
    if out.success() || out.stderr.contains("no checks reported") {
        return Ok(Vec::new());
    }
    Err(anyhow!("gh pr checks failed: {}", out.combined_output().trim()))
}

fn ensure_mergeable(view_json: &str) -> Result<()> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct MergeView {
        #[serde(default)]
        mergeable: String,
        #[serde(default)]
        merge_state_status: Option<String>,
    }
    let view: MergeView = serde_json::from_str(view_json.trim()).context("parse gh pr view output")?;
    if view.mergeable != "MERGEABLE" {
        bail!(
            "PR not mergeable: {}",
            view.merge_state_status.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
