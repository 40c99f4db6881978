use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};

use crate::agent::RemediationAgent;
use crate::ci::{self, Clock, TokioClock};
use crate::dedup::DedupGuard;
use crate::git::WorktreeOps;
use crate::hosting::{pr_number_from_url, CodeHost, MergeMethod};
use crate::ledger::RunLedger;
use crate::merge;
use crate::types::{
    Defect, FixOutput, PipelineEvent, PipelineRun, ReviewOutput, SecurityOutput, Step,
    StepResult, Workspace,
};
use crate::workspace::{workspace_path, WorkspaceManager};

pub const COMMENT_CI_HOLD: &str = "**Autopilot:** CI checks did not pass. Proceeding with review.";
pub const COMMENT_MERGED: &str = "**Autopilot:** All checks passed. PR merged automatically.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repo_root: String,
    pub mainline: String,
    pub ci_timeout: Duration,
    pub ci_poll_interval: Duration,
    pub merge_method: MergeMethod,
    /// Open the PR ourselves when the fix reports success without one.
    pub open_missing_pr: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repo_root: ".".into(),
            mainline: "main".into(),
            ci_timeout: Duration::from_secs(300),
            ci_poll_interval: Duration::from_secs(15),
            merge_method: MergeMethod::Squash,
            open_missing_pr: false,
        }
    }
}

/// Key under which concurrent runs are deduplicated.
pub fn dedup_key(defect: &Defect) -> String {
    if defect.title.is_empty() {
        defect.id.clone()
    } else {
        defect.title.clone()
    }
}

pub struct Pipeline {
    host: Arc<dyn CodeHost>,
    agent: Arc<dyn RemediationAgent>,
    workspaces: WorkspaceManager,
    ledger: Arc<RunLedger>,
    dedup: Arc<DedupGuard>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(
        host: Arc<dyn CodeHost>,
        agent: Arc<dyn RemediationAgent>,
        worktrees: Arc<dyn WorktreeOps>,
        ledger: Arc<RunLedger>,
        config: PipelineConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            host,
            agent,
            workspaces: WorkspaceManager::new(worktrees, config.mainline.clone()),
            ledger,
            dedup: Arc::new(DedupGuard::new()),
            clock: Arc::new(TokioClock::default()),
            config,
            event_tx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dedup(&self) -> &Arc<DedupGuard> {
        &self.dedup
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Claim `key` and run the pipeline for `defect` on a detached task.
    ///
    /// Returns `None` when a run for `key` is already active. The returned
    /// handle resolves after the run finished and the key was released.
    pub fn dispatch(self: &Arc<Self>, key: String, defect: Defect) -> Option<JoinHandle<()>> {
        if !self.dedup.try_acquire(&key) {
            info!(key = %key, defect_id = %defect.id, "run already active, skipping");
            return None;
        }

        let pipeline = Arc::clone(self);
        let run = tokio::spawn(async move { pipeline.run(defect).await });

        let pipeline = Arc::clone(self);
        Some(tokio::spawn(async move {
            match run.await {
                Ok(run) => info!(
                    run_id = %run.run_id,
                    merged = run.merged(),
                    steps = run.steps.len(),
                    "run finished"
                ),
                Err(e) => error!(key = %key, "run task failed: {e}"),
            }
            pipeline.dedup.release(&key);
        }))
    }

    /// Drive one defect through the pipeline. Never fails; every outcome,
    /// including a panic inside a step, ends up in the returned record and
    /// in the ledger.
    pub async fn run(&self, defect: Defect) -> PipelineRun {
        let mut run = PipelineRun::new(RunLedger::new_run_id(), defect);
        info!(run_id = %run.run_id, defect_id = %run.defect.id, "pipeline started");
        self.log(&run.run_id, Level::INFO, &format!("Pipeline started for: {}", run.defect.title))
            .await;

        let outcome = AssertUnwindSafe(self.drive(&mut run)).catch_unwind().await;
        if let Err(panic) = outcome {
            let msg = format!("pipeline step panicked: {}", panic_message(&*panic));
            error!(run_id = %run.run_id, "{msg}");
            self.log(&run.run_id, Level::ERROR, &msg).await;
            run.record_abort(msg);
        }

        run.finish();
        if let Err(e) = self.ledger.save(&run).await {
            error!(run_id = %run.run_id, "failed to save run record: {e:#}");
        }
        let merged = run.merged();
        self.log(
            &run.run_id,
            Level::INFO,
            &format!("Pipeline complete. Merged: {merged}"),
        )
        .await;
        let _ = self.event_tx.send(PipelineEvent::Finished {
            run_id: run.run_id.clone(),
            merged,
            message: format!("{} finished, merged={merged}", run.defect.title),
        });
        run
    }

    async fn drive(&self, run: &mut PipelineRun) {
        let root = self.config.repo_root.clone();
        let defect = run.defect.clone();

        // ── Workspace ──
        self.log(&run.run_id, Level::INFO, "Step 1: Creating workspace").await;
        let workspace = match self.workspaces.allocate(&defect.id, &root).await {
            Ok(ws) => ws,
            Err(e) => {
                let path = workspace_path(&root, &defect.id).to_string_lossy().into_owned();
                self.record(
                    run,
                    Step::Workspace,
                    StepResult::Workspace {
                        success: false,
                        path,
                        error: Some(format!("{e:#}")),
                    },
                    Level::ERROR,
                    format!("Failed to create workspace: {e:#}"),
                )
                .await;
                return;
            }
        };
        self.record(
            run,
            Step::Workspace,
            StepResult::Workspace {
                success: true,
                path: workspace.path.clone(),
                error: None,
            },
            Level::INFO,
            format!("Workspace created: {}", workspace.path),
        )
        .await;

        // ── Fix ──
        self.log(&run.run_id, Level::INFO, "Step 2: Running fix capability").await;
        let fix = self.run_fix(&defect, &workspace).await;
        if let Err(e) = self.workspaces.release(&workspace.path, &root).await {
            warn!(run_id = %run.run_id, "workspace release failed: {e:#}");
            self.log(&run.run_id, Level::WARN, &format!("Workspace release failed: {e:#}"))
                .await;
        }

        let pr = if fix.success {
            self.resolve_pr(&defect, &workspace, fix.pr_url.as_deref()).await
        } else {
            None
        };
        let Some((pr, pr_url)) = pr else {
            let summary = if fix.success {
                format!("{}\n\nNo pull request reference could be resolved.", fix.summary)
            } else {
                fix.summary
            };
            self.record(
                run,
                Step::Fix,
                StepResult::Fix {
                    success: false,
                    summary,
                    pr_url: fix.pr_url,
                },
                Level::ERROR,
                "Fix failed".into(),
            )
            .await;
            return;
        };
        self.record(
            run,
            Step::Fix,
            StepResult::Fix {
                success: true,
                summary: fix.summary,
                pr_url: Some(pr_url.clone()),
            },
            Level::INFO,
            format!("PR created: {pr_url} (#{pr})"),
        )
        .await;

        // ── CI ──
        self.log(&run.run_id, Level::INFO, "Step 3: Waiting for CI checks").await;
        let ci_passed = ci::wait_for_checks(
            self.host.as_ref(),
            pr,
            self.config.ci_timeout,
            self.config.ci_poll_interval,
            self.clock.as_ref(),
        )
        .await;
        self.record(
            run,
            Step::Ci,
            StepResult::Ci { passed: ci_passed },
            if ci_passed { Level::INFO } else { Level::WARN },
            if ci_passed {
                "CI checks passed".into()
            } else {
                "CI checks did not pass, continuing with review anyway".into()
            },
        )
        .await;
        if !ci_passed {
            self.comment(pr, COMMENT_CI_HOLD).await;
        }

        let diff = match self.host.pr_diff(pr).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(run_id = %run.run_id, pr, "fetching PR diff failed: {e:#}");
                String::new()
            }
        };
        let context = defect.context();

        // ── Review ──
        self.log(&run.run_id, Level::INFO, "Step 4: Running review").await;
        let review = match self.agent.review(&diff, &context, &root).await {
            Ok(r) => r,
            Err(e) => ReviewOutput {
                approved: false,
                summary: format!("Review failed: {e:#}"),
            },
        };
        self.record(
            run,
            Step::Review,
            StepResult::Review {
                approved: review.approved,
                summary: review.summary.clone(),
            },
            Level::INFO,
            format!("Review: {}", verdict(review.approved, "APPROVED", "CHANGES REQUESTED")),
        )
        .await;
        self.comment(pr, &format!("**Autopilot Review:**\n\n{}", review.summary))
            .await;

        // ── Security ──
        self.log(&run.run_id, Level::INFO, "Step 5: Running security audit").await;
        let security = match self.agent.security(&diff, &context, &root).await {
            Ok(s) => s,
            Err(e) => SecurityOutput {
                passed: false,
                summary: format!("Security audit failed: {e:#}"),
            },
        };
        self.record(
            run,
            Step::Security,
            StepResult::Security {
                passed: security.passed,
                summary: security.summary.clone(),
            },
            Level::INFO,
            format!("Security: {}", verdict(security.passed, "PASSED", "FAILED")),
        )
        .await;
        self.comment(
            pr,
            &format!("**Autopilot Security Audit:**\n\n{}", security.summary),
        )
        .await;

        // ── Merge ──
        let decision = merge::decide(ci_passed, review.approved, security.passed);
        if decision.merge {
            self.log(&run.run_id, Level::INFO, "Step 6: All checks passed, merging PR")
                .await;
            match self.host.merge_pr(pr, self.config.merge_method).await {
                Ok(()) => {
                    self.record(
                        run,
                        Step::Merge,
                        StepResult::Merge {
                            success: true,
                            reasons: Vec::new(),
                        },
                        Level::INFO,
                        "PR merged successfully".into(),
                    )
                    .await;
                    self.comment(pr, COMMENT_MERGED).await;
                }
                Err(e) => {
                    let err = format!("{e:#}");
                    self.record(
                        run,
                        Step::Merge,
                        StepResult::Merge {
                            success: false,
                            reasons: vec![err.clone()],
                        },
                        Level::ERROR,
                        format!("Merge failed: {err}"),
                    )
                    .await;
                    self.comment(pr, &format!("**Autopilot:** Failed to auto-merge: {err}"))
                        .await;
                }
            }
        } else {
            let reasons = decision.reasons.join(", ");
            self.record(
                run,
                Step::Merge,
                StepResult::Merge {
                    success: false,
                    reasons: decision.reasons,
                },
                Level::WARN,
                format!("Not merging: {reasons}"),
            )
            .await;
            self.comment(
                pr,
                &format!(
                    "**Autopilot:** Not auto-merging. Reasons: {reasons}. Manual review required."
                ),
            )
            .await;
        }
    }

    /// The fix call owns a live workspace, so its panics are caught here to
    /// let the caller release it.
    async fn run_fix(&self, defect: &Defect, workspace: &Workspace) -> FixOutput {
        match AssertUnwindSafe(self.agent.fix(defect, workspace))
            .catch_unwind()
            .await
        {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => FixOutput::failed(format!("Fix capability error: {e:#}")),
            Err(panic) => {
                FixOutput::failed(format!("Fix capability panicked: {}", panic_message(&*panic)))
            }
        }
    }

    /// PR number and URL for a successful fix: parsed from the reported URL,
    /// else looked up by branch, else (if enabled) opened here.
    async fn resolve_pr(
        &self,
        defect: &Defect,
        workspace: &Workspace,
        reported: Option<&str>,
    ) -> Option<(u64, String)> {
        if let Some(url) = reported {
            if let Some(n) = pr_number_from_url(url) {
                return Some((n, url.to_string()));
            }
        }

        match self.host.pr_number_for_branch(&workspace.branch).await {
            Ok(Some(n)) => {
                let url = reported.map(str::to_string).unwrap_or_else(|| format!("#{n}"));
                return Some((n, url));
            }
            Ok(None) => {}
            Err(e) => warn!(branch = %workspace.branch, "PR lookup by branch failed: {e:#}"),
        }

        if !self.config.open_missing_pr {
            return None;
        }
        let title = format!("fix: {}", defect.title);
        let body = format!(
            "Automated fix for production error.\n\n{}\n\n{}",
            defect.permalink,
            defect.context()
        );
        match self.host.create_pr(&workspace.branch, &title, &body).await {
            Ok(url) => pr_number_from_url(&url).map(|n| (n, url)),
            Err(e) => {
                warn!(branch = %workspace.branch, "opening PR failed: {e:#}");
                None
            }
        }
    }

    async fn record(
        &self,
        run: &mut PipelineRun,
        step: Step,
        result: StepResult,
        level: Level,
        message: String,
    ) {
        run.record(step, result);
        match level {
            Level::ERROR => error!(run_id = %run.run_id, step = %step, "{message}"),
            Level::WARN => warn!(run_id = %run.run_id, step = %step, "{message}"),
            _ => info!(run_id = %run.run_id, step = %step, "{message}"),
        }
        self.log(&run.run_id, level, &message).await;
        let _ = self.event_tx.send(PipelineEvent::Step {
            run_id: run.run_id.clone(),
            step,
            message,
        });
    }

    async fn log(&self, run_id: &str, level: Level, message: &str) {
        if let Err(e) = self.ledger.append_log(run_id, level, message).await {
            warn!(run_id, "step log write failed: {e:#}");
        }
    }

    async fn comment(&self, pr: u64, body: &str) {
        if let Err(e) = self.host.comment(pr, body).await {
            warn!(pr, "posting PR comment failed: {e:#}");
        }
    }
}

fn verdict(ok: bool, yes: &'static str, no: &'static str) -> &'static str {
    if ok {
        yes
    } else {
        no
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
