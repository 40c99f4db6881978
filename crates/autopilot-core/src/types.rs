use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Defect ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    /// Any level string the tracker sends that we do not model.
    #[serde(other)]
    Unknown,
}

impl Default for DefectLevel {
    fn default() -> Self {
        Self::Error
    }
}

impl DefectLevel {
    /// Lenient mapping from the tracker's free-form level string.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "fatal" | "critical" => Self::Fatal,
            "error" | "" => Self::Error,
            "warning" | "warn" => Self::Warning,
            "info" => Self::Info,
            "debug" => Self::Debug,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Unknown => "unknown",
        }
    }
}

/// One production error as reported by the issue tracker.
///
/// Immutable once handed to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    /// Stable tracker identifier; also the source of the workspace branch name.
    pub id: String,
    pub short_id: String,
    pub title: String,
    /// Code location string reported by the tracker (e.g. `app/server.py in search`).
    pub culprit: String,
    pub level: DefectLevel,
    pub status: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub occurrence_count: u64,
    pub permalink: String,
    pub message: String,
    /// Human-readable stack trace rendered at parse time.
    pub stacktrace: String,
    pub platform: String,
    pub project: String,
    pub metadata: Map<String, Value>,
}

impl Defect {
    /// Title, message and stack trace as a single block for audit prompts.
    pub fn context(&self) -> String {
        format!("{}: {}\n{}", self.title, self.message, self.stacktrace)
    }
}

// ── Workspace ────────────────────────────────────────────────────────────

/// An isolated checkout owned by exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub branch: String,
    pub path: String,
}

// ── Capability outputs ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixOutput {
    pub success: bool,
    pub summary: String,
    pub pr_url: Option<String>,
}

impl FixOutput {
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            pr_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub approved: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityOutput {
    pub passed: bool,
    pub summary: String,
}

// ── CI checks ────────────────────────────────────────────────────────────

/// A single check as reported by the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Pending,
    Success,
    /// Failed, cancelled, skipped, errored, or anything else terminal.
    Failed,
}

impl CheckRun {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
        }
    }

    pub fn classify(&self) -> CheckState {
        match self.state.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" | "PASS" | "COMPLETED_SUCCESS" => CheckState::Success,
            "PENDING" | "QUEUED" | "IN_PROGRESS" | "WAITING" | "REQUESTED" | "EXPECTED"
            | "STARTUP_FAILURE_PENDING" => CheckState::Pending,
            _ => CheckState::Failed,
        }
    }
}

// ── Pipeline run ─────────────────────────────────────────────────────────

/// Names of the pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Workspace,
    Fix,
    Ci,
    Review,
    Security,
    Merge,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Self::Workspace,
        Self::Fix,
        Self::Ci,
        Self::Review,
        Self::Security,
        Self::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Fix => "fix",
            Self::Ci => "ci",
            Self::Review => "review",
            Self::Security => "security",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResult {
    Workspace {
        success: bool,
        path: String,
        error: Option<String>,
    },
    Fix {
        success: bool,
        summary: String,
        pr_url: Option<String>,
    },
    Ci {
        passed: bool,
    },
    Review {
        approved: bool,
        summary: String,
    },
    Security {
        passed: bool,
        summary: String,
    },
    Merge {
        success: bool,
        reasons: Vec<String>,
    },
    /// The step raised an unexpected error; the run stopped here.
    Aborted {
        error: String,
    },
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Workspace { success, .. }
            | Self::Fix { success, .. }
            | Self::Merge { success, .. } => *success,
            Self::Ci { passed } | Self::Security { passed, .. } => *passed,
            Self::Review { approved, .. } => *approved,
            Self::Aborted { .. } => false,
        }
    }
}

/// One end-to-end execution of the pipeline for one defect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub defect: Defect,
    /// Insertion order is execution order.
    pub steps: IndexMap<String, StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(run_id: impl Into<String>, defect: Defect) -> Self {
        Self {
            run_id: run_id.into(),
            defect,
            steps: IndexMap::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn record(&mut self, step: Step, result: StepResult) {
        self.steps.insert(step.as_str().to_string(), result);
    }

    /// Record an unexpected failure under the first step that has no result yet.
    pub fn record_abort(&mut self, error: impl Into<String>) {
        let key = Step::ALL
            .iter()
            .find(|s| !self.steps.contains_key(s.as_str()))
            .map(Step::as_str)
            .unwrap_or("aborted");
        self.steps
            .insert(key.to_string(), StepResult::Aborted { error: error.into() });
    }

    pub fn step(&self, step: Step) -> Option<&StepResult> {
        self.steps.get(step.as_str())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    /// True only when the merge step ran and succeeded.
    pub fn merged(&self) -> bool {
        self.step(Step::Merge).map(StepResult::succeeded).unwrap_or(false)
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

// ── Pipeline events ──────────────────────────────────────────────────────

/// Broadcast after each step so the server can stream progress.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Step {
        run_id: String,
        step: Step,
        message: String,
    },
    Finished {
        run_id: String,
        merged: bool,
        message: String,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Step { .. } => "run_step",
            Self::Finished { .. } => "run_finished",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Step { run_id, .. } | Self::Finished { run_id, .. } => run_id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Step { message, .. } | Self::Finished { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_states_classify_into_three_buckets() {
        assert_eq!(CheckRun::new("lint", "SUCCESS").classify(), CheckState::Success);
        assert_eq!(CheckRun::new("lint", "in_progress").classify(), CheckState::Pending);
        assert_eq!(CheckRun::new("lint", "QUEUED").classify(), CheckState::Pending);
        assert_eq!(CheckRun::new("lint", "FAILURE").classify(), CheckState::Failed);
        assert_eq!(CheckRun::new("lint", "CANCELLED").classify(), CheckState::Failed);
        assert_eq!(CheckRun::new("lint", "SKIPPED").classify(), CheckState::Failed);
    }

    #[test]
    fn level_labels_map_leniently() {
        assert_eq!(DefectLevel::from_label("ERROR"), DefectLevel::Error);
        assert_eq!(DefectLevel::from_label("warning"), DefectLevel::Warning);
        assert_eq!(DefectLevel::from_label(""), DefectLevel::Error);
        assert_eq!(DefectLevel::from_label("sample"), DefectLevel::Unknown);
    }

    #[test]
    fn run_steps_keep_execution_order() {
        let mut run = PipelineRun::new("run-1", Defect::default());
        run.record(Step::Workspace, StepResult::Workspace {
            success: true,
            path: "/tmp/x".into(),
            error: None,
        });
        run.record(Step::Fix, StepResult::Fix {
            success: false,
            summary: String::new(),
            pr_url: None,
        });
        assert_eq!(run.step_names(), vec!["workspace", "fix"]);
        assert!(!run.merged());
    }

    #[test]
    fn abort_lands_on_first_unfinished_step() {
        let mut run = PipelineRun::new("run-1", Defect::default());
        run.record(Step::Workspace, StepResult::Workspace {
            success: true,
            path: "/tmp/x".into(),
            error: None,
        });
        run.record_abort("boom");
        assert_eq!(run.step_names(), vec!["workspace", "fix"]);
        assert_eq!(
            run.step(Step::Fix),
            Some(&StepResult::Aborted { error: "boom".into() })
        );
    }

    #[test]
    fn step_result_serializes_with_kind_tag() {
        let v = serde_json::to_value(StepResult::Ci { passed: true }).unwrap();
        assert_eq!(v["kind"], "ci");
        assert_eq!(v["passed"], true);
    }
}
