use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::hosting::CodeHost;
use crate::types::CheckState;

/// Time source for the CI gate so tests can drive timeouts without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    async fn sleep(&self, d: Duration);
}

pub struct TokioClock {
    origin: Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Clock that only advances when slept on.
#[derive(Default)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn advance(&self, d: Duration) {
        match self.elapsed.lock() {
            Ok(mut e) => *e += d,
            Err(poisoned) => *poisoned.into_inner() += d,
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        match self.elapsed.lock() {
            Ok(e) => *e,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn sleep(&self, d: Duration) {
        self.advance(d);
        tokio::task::yield_now().await;
    }
}

/// Poll the PR's checks until all are terminal or `timeout` elapses.
///
/// Returns true only when every check succeeded. An empty check list, any
/// pending check, or a fetch error means sleep and retry. Reaching the
/// timeout exactly counts as expired.
pub async fn wait_for_checks(
    host: &dyn CodeHost,
    pr: u64,
    timeout: Duration,
    poll_interval: Duration,
    clock: &dyn Clock,
) -> bool {
    let start = clock.now();
    while clock.now().saturating_sub(start) < timeout {
        match host.pr_checks(pr).await {
            Ok(checks) if checks.is_empty() => {
                debug!(pr, "no checks reported yet");
            }
            Ok(checks) => {
                let states: Vec<_> = checks.iter().map(|c| c.classify()).collect();
                if states.contains(&CheckState::Pending) {
                    info!(pr, "CI still running, waiting...");
                } else {
                    let failed: Vec<&str> = checks
                        .iter()
                        .zip(&states)
                        .filter(|(_, s)| **s == CheckState::Failed)
                        .map(|(c, _)| c.name.as_str())
                        .collect();
                    if failed.is_empty() {
                        info!(pr, checks = checks.len(), "all CI checks passed");
                        return true;
                    }
                    warn!(pr, "CI checks failed: {}", failed.join(", "));
                    return false;
                }
            }
            Err(e) => {
                warn!(pr, "fetching CI checks failed, retrying: {e:#}");
            }
        }
        clock.sleep(poll_interval).await;
    }
    warn!(pr, timeout_s = timeout.as_secs(), "CI check timeout reached");
    false
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::{anyhow, Result};
    use tracing_test::traced_test;

    use super::*;
    use crate::hosting::MergeMethod;
    use crate::types::CheckRun;

    /// Returns scripted check responses in order; repeats the last one.
    struct ScriptedChecks {
        responses: Mutex<VecDeque<Result<Vec<CheckRun>>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedChecks {
        fn new(responses: Vec<Result<Vec<CheckRun>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CodeHost for ScriptedChecks {
        async fn create_pr(&self, _: &str, _: &str, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn pr_diff(&self, _: u64) -> Result<String> {
            unimplemented!()
        }
        async fn pr_checks(&self, _: u64) -> Result<Vec<CheckRun>> {
            *self.calls.lock().unwrap() += 1;
            let mut q = self.responses.lock().unwrap();
            if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                match q.front().unwrap() {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(anyhow!("{e}")),
                }
            }
        }
        async fn comment(&self, _: u64, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn merge_pr(&self, _: u64, _: MergeMethod) -> Result<()> {
            unimplemented!()
        }
        async fn pr_number_for_branch(&self, _: &str) -> Result<Option<u64>> {
            unimplemented!()
        }
    }

    const POLL: Duration = Duration::from_secs(15);
    const TIMEOUT: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn all_success_passes() {
        let host = ScriptedChecks::new(vec![Ok(vec![
            CheckRun::new("test", "SUCCESS"),
            CheckRun::new("lint", "SUCCESS"),
        ])]);
        let clock = ManualClock::default();
        assert!(wait_for_checks(&host, 7, TIMEOUT, POLL, &clock).await);
        assert_eq!(host.calls(), 1);
    }

    #[tokio::test]
    async fn pending_then_success_polls_until_terminal() {
        let host = ScriptedChecks::new(vec![
            Ok(vec![]),
            Ok(vec![CheckRun::new("test", "IN_PROGRESS")]),
            Ok(vec![CheckRun::new("test", "SUCCESS")]),
        ]);
        let clock = ManualClock::default();
        assert!(wait_for_checks(&host, 7, TIMEOUT, POLL, &clock).await);
        assert_eq!(host.calls(), 3);
        assert_eq!(clock.now(), POLL * 2);
    }

    #[traced_test]
    #[tokio::test]
    async fn terminal_failure_logs_failed_check_names() {
        let host = ScriptedChecks::new(vec![Ok(vec![
            CheckRun::new("test", "SUCCESS"),
            CheckRun::new("e2e", "FAILURE"),
            CheckRun::new("deploy-preview", "CANCELLED"),
        ])]);
        let clock = ManualClock::default();
        assert!(!wait_for_checks(&host, 7, TIMEOUT, POLL, &clock).await);
        assert!(logs_contain("CI checks failed: e2e, deploy-preview"));
    }

    #[traced_test]
    #[tokio::test]
    async fn never_terminal_times_out() {
        let host = ScriptedChecks::new(vec![Ok(vec![CheckRun::new("test", "QUEUED")])]);
        let clock = ManualClock::default();
        assert!(!wait_for_checks(&host, 7, TIMEOUT, POLL, &clock).await);
        // 300 / 15 polls; the one that would land exactly on 300s is not made.
        assert_eq!(host.calls(), 20);
        assert!(logs_contain("CI check timeout reached"));
    }

    #[tokio::test]
    async fn exactly_at_timeout_counts_as_expired() {
        let host = ScriptedChecks::new(vec![Ok(vec![CheckRun::new("test", "SUCCESS")])]);
        let clock = ManualClock::default();
        assert!(!wait_for_checks(&host, 7, Duration::ZERO, POLL, &clock).await);
        assert_eq!(host.calls(), 0);
    }

    #[tokio::test]
    async fn fetch_errors_are_retried() {
        let host = ScriptedChecks::new(vec![
            Err(anyhow!("HTTP 502")),
            Ok(vec![CheckRun::new("test", "SUCCESS")]),
        ]);
        let clock = ManualClock::default();
        assert!(wait_for_checks(&host, 7, TIMEOUT, POLL, &clock).await);
        assert_eq!(host.calls(), 2);
    }
}
