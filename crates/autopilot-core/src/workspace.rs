use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::git::WorktreeOps;
use crate::types::Workspace;

/// Branch used for a defect's remediation attempt.
pub fn branch_name(defect_id: &str) -> String {
    format!("autopilot/fix-{}", sanitize(defect_id))
}

/// Checkout location for a defect's remediation attempt.
pub fn workspace_path(repo_root: &str, defect_id: &str) -> PathBuf {
    Path::new(repo_root)
        .join("trees")
        .join("autopilot")
        .join(format!("fix-{}", sanitize(defect_id)))
}

/// Keep ids usable as both a ref name and a single path component.
///
/// Ids that had to be rewritten get a short digest of the raw id appended,
/// so `a/b` and `a-b` never share a branch or checkout.
fn sanitize(defect_id: &str) -> String {
    let cleaned: String = defect_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        return format!("unknown-{}", short_digest(defect_id));
    }
    if cleaned != defect_id {
        return format!("{cleaned}-{}", short_digest(defect_id));
    }
    cleaned
}

fn short_digest(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..4])
}

/// Relative roots would be resolved twice by `git -C <root> worktree add
/// <root>/trees/...`, so every path handed to git is made absolute first.
async fn resolve_root(repo_root: &str) -> Result<String> {
    let root = tokio::fs::canonicalize(repo_root)
        .await
        .with_context(|| format!("resolve repo root {repo_root}"))?;
    Ok(root.to_string_lossy().into_owned())
}

/// Allocates and releases per-defect worktrees.
///
/// Workspace identity is a pure function of the defect id, so a second
/// allocation for the same id always replaces whatever a previous (possibly
/// crashed) run left behind.
pub struct WorkspaceManager {
    ops: Arc<dyn WorktreeOps>,
    mainline: String,
}

impl WorkspaceManager {
    pub fn new(ops: Arc<dyn WorktreeOps>, mainline: impl Into<String>) -> Self {
        Self {
            ops,
            mainline: mainline.into(),
        }
    }

    pub async fn allocate(&self, defect_id: &str, repo_root: &str) -> Result<Workspace> {
        let root = resolve_root(repo_root).await?;
        let repo_root = root.as_str();
        let branch = branch_name(defect_id);
        let path = workspace_path(repo_root, defect_id);
        let path_str = path.to_string_lossy().into_owned();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(defect_id, path = %path_str, "removing stale workspace");
            let removed = self.ops.remove_worktree(repo_root, &path_str).await?;
            if !removed.success() {
                bail!(
                    "failed to remove stale workspace {path_str}: {}",
                    removed.combined_output().trim()
                );
            }
        }

        let created = self
            .ops
            .add_worktree_new_branch(repo_root, &path_str, &branch, &self.mainline)
            .await?;
        if created.success() {
            info!(defect_id, branch = %branch, path = %path_str, "workspace allocated");
            return Ok(Workspace {
                branch,
                path: path_str,
            });
        }

        let first_error = created.combined_output();
        if !first_error.contains("already exists") {
            bail!(
                "git worktree add failed for branch={branch} base={}: {}",
                self.mainline,
                first_error.trim()
            );
        }

        info!(defect_id, branch = %branch, "branch already exists, attaching it");
        let attached = self
            .ops
            .add_worktree_existing(repo_root, &path_str, &branch)
            .await?;
        if !attached.success() {
            bail!(
                "git worktree add failed for existing branch={branch}: {}",
                attached.combined_output().trim()
            );
        }

        info!(defect_id, branch = %branch, path = %path_str, "workspace allocated");
        Ok(Workspace {
            branch,
            path: path_str,
        })
    }

    pub async fn release(&self, path: &str, repo_root: &str) -> Result<()> {
        let root = resolve_root(repo_root).await?;
        let removed = self.ops.remove_worktree(&root, path).await?;
        if !removed.success() {
            let err = removed.combined_output();
            warn!(path, "workspace removal failed: {}", err.trim());
            bail!("git worktree remove failed for {path}: {}", err.trim());
        }
        info!(path, "workspace released");
        Ok(())
    }
}
