use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::{dedup_key, Pipeline};
use crate::processed::ProcessedSet;
use crate::sentry::IssueSource;

/// Periodically fetches unresolved defects and hands new ones to the pipeline.
pub struct Poller {
    source: Arc<dyn IssueSource>,
    pipeline: Arc<Pipeline>,
    processed: Arc<ProcessedSet>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn IssueSource>,
        pipeline: Arc<Pipeline>,
        processed: Arc<ProcessedSet>,
    ) -> Self {
        Self {
            source,
            pipeline,
            processed,
        }
    }

    /// One cycle: fetch, skip processed ids, dispatch the rest.
    ///
    /// An id is marked processed as soon as it is dispatched, before its run
    /// completes, so the next cycle never picks it up again. An id whose
    /// dispatch was refused by the dedup guard is left unmarked.
    pub async fn poll_once(&self) -> Result<Vec<JoinHandle<()>>> {
        let defects = self
            .source
            .fetch_unresolved()
            .await
            .context("fetch unresolved issues")?;
        let total = defects.len();
        let fresh: Vec<_> = defects
            .into_iter()
            .filter(|d| !self.processed.contains(&d.id))
            .collect();

        if fresh.is_empty() {
            info!(total, "no new issues");
            return Ok(Vec::new());
        }
        info!(total, new = fresh.len(), "found new issues");

        let mut handles = Vec::new();
        for defect in fresh {
            let id = defect.id.clone();
            info!(defect_id = %id, title = %defect.title, "processing issue");
            // Refused dispatches stay unmarked so a later cycle retries them.
            let Some(handle) = self.pipeline.dispatch(dedup_key(&defect), defect) else {
                continue;
            };
            handles.push(handle);
            if let Err(e) = self.processed.mark(&id) {
                error!(defect_id = %id, "failed to persist processed id: {e:#}");
            }
        }
        Ok(handles)
    }

    pub async fn run_forever(self: Arc<Self>, interval: Duration) {
        info!(
            interval_s = interval.as_secs(),
            processed_file = %self.processed.path().display(),
            "poller started"
        );
        loop {
            if let Err(e) = self.poll_once().await {
                warn!("poll cycle failed: {e:#}");
            }
            tokio::time::sleep(interval).await;
        }
    }
}
