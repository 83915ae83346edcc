//! Repository Synchronizer - drives one repository through clone or reconcile
//!
//! Each repository moves through a small state machine:
//!
//! ```text
//! Unsynced --(no working copy)--> Cloning --ok--> Reconciling --> Succeeded
//!    |                               |                  |
//!    +--(working copy exists)--------+------------------+-------> Failed
//! ```
//!
//! Transient engine failures are retried with exponential backoff up to
//! [`RetryPolicy::max_retries`] times; permanent ones fail immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ErrorDisposition, GitError};
use crate::git::GitEngine;
use crate::matcher::BranchMatcher;
use crate::reconcile::{BranchReconciler, BranchReport};
use crate::sync::{RepoSyncReport, SyncResult, SyncStatus, SyncTarget};

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-based): doubles each time, capped at `max_backoff`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Cloning,
    Reconciling,
    Succeeded,
    Failed,
}

/// Synchronizes single repositories against a [`GitEngine`]
pub struct RepositorySynchronizer<E: GitEngine + ?Sized> {
    engine: Arc<E>,
    reconciler: BranchReconciler,
    retry: RetryPolicy,
}

impl<E: GitEngine + ?Sized> RepositorySynchronizer<E> {
    pub fn new(engine: Arc<E>, matcher: BranchMatcher) -> Self {
        Self {
            engine,
            reconciler: BranchReconciler::new(matcher),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Bring one target in sync. Never fails: every problem ends up in the report.
    pub fn sync(&self, target: &SyncTarget) -> RepoSyncReport {
        let started = Instant::now();
        let label = target.local_path.display().to_string();

        let mut state = SyncState::Unsynced;
        let mut result = SyncResult::default();
        let mut branches: Option<BranchReport> = None;
        let mut retries = 0;
        let mut cloned = false;

        loop {
            let next = match state {
                SyncState::Unsynced => {
                    if self.engine.is_local_repository(&target.local_path) {
                        SyncState::Reconciling
                    } else {
                        SyncState::Cloning
                    }
                }
                SyncState::Cloning => {
                    info!("Cloning {} into {}", target.remote_url, label);
                    let outcome = self.run_with_retry("clone", &label, &mut retries, || {
                        self.engine
                            .clone_remote(&target.remote_url, &target.local_path)
                    });
                    match outcome {
                        Ok(()) => {
                            cloned = true;
                            SyncState::Reconciling
                        }
                        Err(e) => {
                            result.push(e.to_string());
                            SyncState::Failed
                        }
                    }
                }
                SyncState::Reconciling => {
                    let outcome = self.run_with_retry("reconcile", &label, &mut retries, || {
                        self.reconcile_once(target, &label)
                    });
                    match outcome {
                        Ok(report) => {
                            for failure in &report.failures {
                                result.push(failure.message.clone());
                            }
                            let next = if report.is_clean() {
                                SyncState::Succeeded
                            } else {
                                SyncState::Failed
                            };
                            branches = Some(report);
                            next
                        }
                        Err(e) => {
                            result.push(e.to_string());
                            SyncState::Failed
                        }
                    }
                }
                SyncState::Succeeded | SyncState::Failed => break,
            };

            debug!(repo = %label, "{:?} -> {:?}", state, next);
            state = next;
        }

        let status = if state == SyncState::Succeeded {
            SyncStatus::Succeeded
        } else {
            SyncStatus::Failed
        };

        RepoSyncReport {
            target: target.clone(),
            status,
            result,
            branches,
            retries,
            cloned,
            duration: started.elapsed(),
        }
    }

    /// One reconciliation pass; the working copy is released before returning.
    fn reconcile_once(&self, target: &SyncTarget, label: &str) -> Result<BranchReport, GitError> {
        let mut working_copy = self.engine.open(&target.local_path)?;
        self.reconciler.reconcile(working_copy.as_mut(), label)
    }

    fn run_with_retry<T>(
        &self,
        operation: &str,
        label: &str,
        retries: &mut u32,
        mut op: impl FnMut() -> Result<T, GitError>,
    ) -> Result<T, GitError> {
        let mut attempt = 0;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match err.disposition() {
                ErrorDisposition::Transient if attempt < self.retry.max_retries => {
                    attempt += 1;
                    *retries += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        repo = label,
                        attempt,
                        "{} failed ({}), retrying in {}ms",
                        operation,
                        err,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                ErrorDisposition::Transient => {
                    warn!(repo = label, "{} still failing after {} retries", operation, attempt);
                    return Err(err);
                }
                ErrorDisposition::Permanent => {
                    warn!(repo = label, "{} cannot succeed, not retrying: {}", operation, err);
                    return Err(err);
                }
                ErrorDisposition::Fatal => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{BranchInfo, MockGitEngine, PullOutcome, WorkingCopy};
    use assert_matches::assert_matches;
    use mockall::Sequence;
    use quickcheck_macros::quickcheck;
    use std::path::Path;

    struct EmptyWorkingCopy;

    impl WorkingCopy for EmptyWorkingCopy {
        fn fetch_all_remotes(&mut self) -> Result<(), GitError> {
            Ok(())
        }
        fn branches(&self) -> Result<Vec<BranchInfo>, GitError> {
            Ok(vec![])
        }
        fn create_tracking_branch(&mut self, _: &BranchInfo) -> Result<String, GitError> {
            unreachable!("no branches to create")
        }
        fn checkout(&mut self, _: &str) -> Result<(), GitError> {
            unreachable!("no branches to check out")
        }
        fn is_up_to_date(&self, _: &str) -> Result<bool, GitError> {
            unreachable!("no branches to compare")
        }
        fn pull(&mut self, _: &str) -> Result<PullOutcome, GitError> {
            unreachable!("no branches to pull")
        }
    }

    fn clone_error(reason: &str) -> GitError {
        GitError::Clone {
            url: "https://git.example.com/team/app.git".to_string(),
            reason: reason.to_string(),
        }
    }

    fn quick_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn target(url: &str) -> SyncTarget {
        SyncTarget::new(url, "/srv/mirror/team/app")
    }

    fn synchronizer(engine: MockGitEngine, retry: RetryPolicy) -> RepositorySynchronizer<MockGitEngine> {
        RepositorySynchronizer::new(Arc::new(engine), BranchMatcher::all()).with_retry(retry)
    }

    #[test]
    fn test_transient_clone_failure_is_retried_with_same_parameters() {
        let mut engine = MockGitEngine::new();
        let mut seq = Sequence::new();
        engine.expect_is_local_repository().return_const(false);
        engine
            .expect_clone_remote()
            .withf(|url, path| {
                url == "https://git.example.com/team/app.git"
                    && path == Path::new("/srv/mirror/team/app")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(clone_error("failed to send request: connection reset")));
        engine
            .expect_clone_remote()
            .withf(|url, path| {
                url == "https://git.example.com/team/app.git"
                    && path == Path::new("/srv/mirror/team/app")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        engine
            .expect_open()
            .times(1)
            .returning(|_| Ok(Box::new(EmptyWorkingCopy)));

        let report = synchronizer(engine, quick_retry(3))
            .sync(&target("https://git.example.com/team/app.git"));

        assert_eq!(report.status, SyncStatus::Succeeded);
        assert_eq!(report.retries, 1);
        assert!(report.cloned);
        assert!(report.result.is_successful());
    }

    #[test]
    fn test_unsupported_scheme_fails_without_retry() {
        let mut engine = MockGitEngine::new();
        engine.expect_is_local_repository().return_const(false);
        engine
            .expect_clone_remote()
            .times(1)
            .returning(|_, _| Err(clone_error("unsupported URL protocol")));
        engine.expect_open().never();

        let report = synchronizer(engine, quick_retry(3)).sync(&target("ftp://git.example.com/app"));

        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.retries, 0);
        assert!(!report.result.is_successful());
        assert!(report.result.errors()[0]
            .message
            .contains("unsupported URL protocol"));
    }

    #[test]
    fn test_transient_retries_are_bounded() {
        let mut engine = MockGitEngine::new();
        engine.expect_is_local_repository().return_const(false);
        engine
            .expect_clone_remote()
            .times(3)
            .returning(|_, _| Err(clone_error("Failed to send request")));

        let report = synchronizer(engine, quick_retry(2)).sync(&target("https://example.com/a.git"));

        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.retries, 2);
        assert_eq!(report.result.errors().len(), 1);
    }

    #[test]
    fn test_existing_working_copy_skips_clone() {
        let mut engine = MockGitEngine::new();
        engine.expect_is_local_repository().return_const(true);
        engine.expect_clone_remote().never();
        engine
            .expect_open()
            .times(1)
            .returning(|_| Ok(Box::new(EmptyWorkingCopy)));

        let report = synchronizer(engine, RetryPolicy::none()).sync(&target("https://example.com/a.git"));

        assert_eq!(report.status, SyncStatus::Succeeded);
        assert!(!report.cloned);
        assert_matches!(report.branches, Some(ref b) if b.is_clean());
    }

    #[test]
    fn test_open_failure_is_reported_not_raised() {
        let mut engine = MockGitEngine::new();
        engine.expect_is_local_repository().return_const(true);
        engine.expect_open().times(1).returning(|path| {
            Err(GitError::Open {
                path: path.to_path_buf(),
                reason: "corrupt index".to_string(),
            })
        });

        let report = synchronizer(engine, quick_retry(3)).sync(&target("https://example.com/a.git"));

        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.retries, 0);
        assert!(report.result.errors()[0].message.contains("corrupt index"));
    }

    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[quickcheck]
    fn prop_backoff_is_capped_and_non_decreasing(initial_ms: u16, max_ms: u16, retry: u8) -> bool {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(initial_ms as u64),
            max_backoff: Duration::from_millis(max_ms as u64),
        };
        let retry = retry as u32 + 1;
        let delay = policy.delay_for(retry);
        delay <= policy.max_backoff && policy.delay_for(retry + 1) >= delay
    }
}
