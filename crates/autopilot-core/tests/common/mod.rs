#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use autopilot_core::agent::RemediationAgent;
use autopilot_core::ci::ManualClock;
use autopilot_core::git::{ExecResult, WorktreeOps};
use autopilot_core::hosting::{CodeHost, MergeMethod};
use autopilot_core::ledger::RunLedger;
use autopilot_core::pipeline::{Pipeline, PipelineConfig};
use autopilot_core::sentry::IssueSource;
use autopilot_core::types::{CheckRun, Defect, FixOutput, ReviewOutput, SecurityOutput, Workspace};
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub fn defect(id: &str, title: &str) -> Defect {
    Defect {
        id: id.into(),
        title: title.into(),
        culprit: "app/server.py in search".into(),
        message: "'price'".into(),
        stacktrace: "KeyError: 'price'\n  at app/server.py in search".into(),
        ..Default::default()
    }
}

fn exec(exit_code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code,
    }
}

// ── Worktrees ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeWorktrees {
    pub live: Mutex<HashSet<String>>,
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_add: bool,
}

#[async_trait]
impl WorktreeOps for FakeWorktrees {
    async fn add_worktree_new_branch(
        &self,
        _repo_root: &str,
        path: &str,
        _branch: &str,
        _base: &str,
    ) -> Result<ExecResult> {
        if self.fail_add {
            return Ok(exec(128, "fatal: invalid reference: main"));
        }
        std::fs::create_dir_all(path)?;
        self.live.lock().unwrap().insert(path.to_string());
        self.added.lock().unwrap().push(path.to_string());
        Ok(exec(0, ""))
    }

    async fn add_worktree_existing(
        &self,
        _repo_root: &str,
        path: &str,
        _branch: &str,
    ) -> Result<ExecResult> {
        std::fs::create_dir_all(path)?;
        self.live.lock().unwrap().insert(path.to_string());
        self.added.lock().unwrap().push(path.to_string());
        Ok(exec(0, ""))
    }

    async fn remove_worktree(&self, _repo_root: &str, path: &str) -> Result<ExecResult> {
        self.removed.lock().unwrap().push(path.to_string());
        if !self.live.lock().unwrap().remove(path) {
            return Ok(exec(128, "fatal: not a working tree"));
        }
        let _ = std::fs::remove_dir_all(path);
        Ok(exec(0, ""))
    }
}

// ── Code host ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreatePr(String),
    Diff(u64),
    Checks(u64),
    Comment(u64, String),
    Merge(u64, MergeMethod),
    PrForBranch(String),
}

pub struct FakeHost {
    pub calls: Mutex<Vec<HostCall>>,
    pub checks: Mutex<Vec<CheckRun>>,
    pub pr_for_branch: Mutex<Option<u64>>,
    pub created_pr_url: Mutex<Option<String>>,
    pub merge_error: Mutex<Option<String>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            checks: Mutex::new(vec![
                CheckRun::new("test", "SUCCESS"),
                CheckRun::new("lint", "SUCCESS"),
            ]),
            pr_for_branch: Mutex::new(None),
            created_pr_url: Mutex::new(None),
            merge_error: Mutex::new(None),
        }
    }
}

impl FakeHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Comment(_, body) => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn merges(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Merge(..)))
            .count()
    }

    pub fn check_polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Checks(_)))
            .count()
    }

    fn push(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CodeHost for FakeHost {
    async fn create_pr(&self, branch: &str, _title: &str, _body: &str) -> Result<String> {
        self.push(HostCall::CreatePr(branch.to_string()));
        self.created_pr_url
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no commits between main and {branch}"))
    }

    async fn pr_diff(&self, pr: u64) -> Result<String> {
        self.push(HostCall::Diff(pr));
        Ok("--- a/app/server.py\n+++ b/app/server.py\n-    p['price']\n+    p.get('price')\n".into())
    }

    async fn pr_checks(&self, pr: u64) -> Result<Vec<CheckRun>> {
        self.push(HostCall::Checks(pr));
        Ok(self.checks.lock().unwrap().clone())
    }

    async fn comment(&self, pr: u64, body: &str) -> Result<()> {
        self.push(HostCall::Comment(pr, body.to_string()));
        Ok(())
    }

    async fn merge_pr(&self, pr: u64, method: MergeMethod) -> Result<()> {
        self.push(HostCall::Merge(pr, method));
        match self.merge_error.lock().unwrap().clone() {
            Some(e) => Err(anyhow!(e)),
            None => Ok(()),
        }
    }

    async fn pr_number_for_branch(&self, branch: &str) -> Result<Option<u64>> {
        self.push(HostCall::PrForBranch(branch.to_string()));
        Ok(*self.pr_for_branch.lock().unwrap())
    }
}

// ── Agent ────────────────────────────────────────────────────────────────

pub struct FakeAgent {
    pub fix: Mutex<FixOutput>,
    pub review: Mutex<Result<ReviewOutput, String>>,
    pub security: Mutex<Result<SecurityOutput, String>>,
    pub panic_on_fix: bool,
    pub panic_on_review: bool,
    /// When set, each `fix` call blocks until a permit is added.
    pub gate: Option<Arc<Semaphore>>,
    pub fix_calls: Mutex<Vec<Workspace>>,
    pub review_calls: Mutex<Vec<String>>,
    pub security_calls: Mutex<usize>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            fix: Mutex::new(FixOutput {
                success: true,
                summary: "Guarded the price lookup.".into(),
                pr_url: Some("https://github.com/acme/shop/pull/7".into()),
            }),
            review: Mutex::new(Ok(ReviewOutput {
                approved: true,
                summary: "APPROVE: minimal and correct.".into(),
            })),
            security: Mutex::new(Ok(SecurityOutput {
                passed: true,
                summary: "PASS: no issues.".into(),
            })),
            panic_on_fix: false,
            panic_on_review: false,
            gate: None,
            fix_calls: Mutex::new(Vec::new()),
            review_calls: Mutex::new(Vec::new()),
            security_calls: Mutex::new(0),
        }
    }
}

impl FakeAgent {
    pub fn failing_fix() -> Self {
        let agent = Self::default();
        *agent.fix.lock().unwrap() = FixOutput::failed("Could not reproduce.");
        agent
    }
}

#[async_trait]
impl RemediationAgent for FakeAgent {
    async fn fix(&self, _defect: &Defect, workspace: &Workspace) -> Result<FixOutput> {
        self.fix_calls.lock().unwrap().push(workspace.clone());
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.panic_on_fix {
            panic!("agent crashed");
        }
        Ok(self.fix.lock().unwrap().clone())
    }

    async fn review(&self, diff: &str, _ctx: &str, _root: &str) -> Result<ReviewOutput> {
        self.review_calls.lock().unwrap().push(diff.to_string());
        if self.panic_on_review {
            panic!("review agent crashed");
        }
        self.review.lock().unwrap().clone().map_err(|e| anyhow!(e))
    }

    async fn security(&self, _diff: &str, _ctx: &str, _root: &str) -> Result<SecurityOutput> {
        *self.security_calls.lock().unwrap() += 1;
        self.security.lock().unwrap().clone().map_err(|e| anyhow!(e))
    }
}

// ── Issue source ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSource {
    pub defects: Mutex<Vec<Defect>>,
    pub fail: bool,
    pub fetches: Mutex<usize>,
}

#[async_trait]
impl IssueSource for FakeSource {
    async fn fetch_unresolved(&self) -> Result<Vec<Defect>> {
        *self.fetches.lock().unwrap() += 1;
        if self.fail {
            return Err(anyhow!("401 Unauthorized"));
        }
        Ok(self.defects.lock().unwrap().clone())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<FakeHost>,
    pub agent: Arc<FakeAgent>,
    pub worktrees: Arc<FakeWorktrees>,
    pub ledger: Arc<RunLedger>,
    pub pipeline: Arc<Pipeline>,
}

impl Harness {
    pub fn new(host: FakeHost, agent: FakeAgent) -> Self {
        Self::build(host, agent, FakeWorktrees::default(), |_| {})
    }

    pub fn build(
        host: FakeHost,
        agent: FakeAgent,
        worktrees: FakeWorktrees,
        tweak: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(host);
        let agent = Arc::new(agent);
        let worktrees = Arc::new(worktrees);
        let ledger = Arc::new(RunLedger::new(dir.path().join("runs")));
        std::fs::create_dir_all(dir.path().join("repo")).unwrap();
        let mut config = PipelineConfig {
            repo_root: dir.path().join("repo").to_string_lossy().into_owned(),
            ci_timeout: Duration::from_secs(300),
            ci_poll_interval: Duration::from_secs(15),
            ..Default::default()
        };
        tweak(&mut config);
        let pipeline = Pipeline::new(
            host.clone(),
            agent.clone(),
            worktrees.clone(),
            ledger.clone(),
            config,
        )
        .with_clock(Arc::new(ManualClock::default()));

        Self {
            dir,
            host,
            agent,
            worktrees,
            ledger,
            pipeline: Arc::new(pipeline),
        }
    }
}
