use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Defect, FixOutput, ReviewOutput, SecurityOutput, Workspace};

/// The external fix, review and security capabilities.
///
/// Each call may block for minutes. A negative verdict is an `Ok` value;
/// `Err` means the capability itself could not run.
#[async_trait]
pub trait RemediationAgent: Send + Sync {
    /// Fix `defect` inside `workspace`, then commit, push and open a PR.
    async fn fix(&self, defect: &Defect, workspace: &Workspace) -> Result<FixOutput>;

    async fn review(&self, diff: &str, defect_context: &str, repo_root: &str)
        -> Result<ReviewOutput>;

    async fn security(
        &self,
        diff: &str,
        defect_context: &str,
        repo_root: &str,
    ) -> Result<SecurityOutput>;
}
