use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{warn, Level};

use crate::types::{Defect, PipelineRun, StepResult};

pub const LOG_FILE: &str = "pipeline.log";
pub const RESULT_FILE: &str = "result.json";

/// The persisted form of a finished (or aborted) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub error_title: String,
    pub merged: bool,
    pub defect: Defect,
    pub steps: IndexMap<String, StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineRun> for RunRecord {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            error_title: run.defect.title.clone(),
            merged: run.merged(),
            defect: run.defect.clone(),
            steps: run.steps.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

/// Append-only directory of runs: `<runs_dir>/<run_id>/{pipeline.log,result.json}`.
pub struct RunLedger {
    runs_dir: PathBuf,
}

impl RunLedger {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// `run-` followed by 8 hex chars.
    pub fn new_run_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("run-{}", &id[..8])
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty()
            || !run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("invalid run id {run_id:?}");
        }
        Ok(self.runs_dir.join(run_id))
    }

    /// Append `[ts] LEVEL message` to the run's step log.
    pub async fn append_log(&self, run_id: &str, level: Level, message: &str) -> Result<()> {
        let dir = self.run_dir(run_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let line = format!(
            "[{}] {} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await
            .with_context(|| format!("open {}/{LOG_FILE}", dir.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn save(&self, run: &PipelineRun) -> Result<PathBuf> {
        let dir = self.run_dir(&run.run_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(RESULT_FILE);
        let json = serde_json::to_string_pretty(&RunRecord::from(run))?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub async fn load(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let path = self.run_dir(run_id)?.join(RESULT_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let record = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub async fn read_log(&self, run_id: &str) -> Result<Option<String>> {
        let path = self.run_dir(run_id)?.join(LOG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// All saved records, newest first. Unreadable entries are skipped.
    pub async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.runs_dir.display())),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.load(&name).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(run_id = %name, "skipping unreadable run record: {e:#}"),
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::types::Step;

    fn run(id: &str, title: &str) -> PipelineRun {
        let defect = Defect {
            id: "42".into(),
            title: title.into(),
            ..Default::default()
        };
        PipelineRun::new(id, defect)
    }

    #[test]
    fn run_ids_have_fixed_shape() {
        let id = RunLedger::new_run_id();
        assert!(id.starts_with("run-"));
        assert_eq!(id.len(), 12);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, RunLedger::new_run_id());
    }

    #[tokio::test]
    async fn save_then_load_keeps_step_order_and_merge_flag() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path());
        let mut r = run("run-aaaa0001", "KeyError");
        r.record(Step::Workspace, StepResult::Workspace {
            success: true,
            path: "/tmp/w".into(),
            error: None,
        });
        r.record(Step::Merge, StepResult::Merge {
            success: true,
            reasons: vec![],
        });
        r.finish();
        ledger.save(&r).await.unwrap();

        let rec = ledger.load("run-aaaa0001").await.unwrap().unwrap();
        assert_eq!(rec.error_title, "KeyError");
        assert!(rec.merged);
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.steps.keys().collect::<Vec<_>>(), vec!["workspace", "merge"]);
    }

    #[tokio::test]
    async fn step_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path());
        ledger.append_log("run-1", Level::INFO, "Step 1: workspace").await.unwrap();
        ledger.append_log("run-1", Level::WARN, "CI did not pass").await.unwrap();

        let log = ledger.read_log("run-1").await.unwrap().unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO Step 1: workspace"));
        assert!(lines[1].ends_with("WARN CI did not pass"));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path());
        let mut older = run("run-old", "A");
        older.started_at = Utc::now() - Duration::minutes(5);
        let newer = run("run-new", "B");
        ledger.save(&older).await.unwrap();
        ledger.save(&newer).await.unwrap();
        std::fs::create_dir_all(dir.path().join("run-empty")).unwrap();

        let ids: Vec<_> = ledger
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["run-new", "run-old"]);
    }

    #[tokio::test]
    async fn unknown_and_hostile_ids() {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::new(dir.path().join("runs"));
        assert!(ledger.load("run-missing").await.unwrap().is_none());
        assert!(ledger.load("../etc").await.is_err());
        assert!(ledger.list().await.unwrap().is_empty());
    }
}
