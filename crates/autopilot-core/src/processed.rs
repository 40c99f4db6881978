use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Durable defect id → first-processed timestamp map, backed by one JSON file.
///
/// Entries are never removed or overwritten. Writes go to a temp file that is
/// renamed over the original, so a crash leaves either the old or new set.
pub struct ProcessedSet {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl ProcessedSet {
    /// Load from `path`; a missing or unreadable file starts an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), "processed set is corrupt, starting empty: {e}");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, defect_id: &str) -> bool {
        match self.entries.lock() {
            Ok(map) => map.contains_key(defect_id),
            Err(poisoned) => poisoned.into_inner().contains_key(defect_id),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `defect_id` as processed now. Returns false if it already was.
    pub fn mark(&self, defect_id: &str) -> Result<bool> {
        let mut map = match self.entries.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if map.contains_key(defect_id) {
            return Ok(false);
        }
        map.insert(defect_id.to_string(), Utc::now());
        let json = serde_json::to_string_pretty(&*map)?;
        write_atomic(&self.path, &json)?;
        Ok(true)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename onto {}", path.display()))?;
    Ok(())
}
