//! Sync Orchestrator - runs many repository synchronizations in parallel
//!
//! Targets whose working copy already exists are scheduled ahead of fresh
//! clones. At most `max_parallel` repositories synchronize at once; each one
//! runs on a blocking worker thread because git operations are synchronous.
//! Cancellation stops new repositories from starting and lets in-flight ones
//! finish.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::git::GitEngine;
use crate::reconcile::BranchReport;
use crate::synchronizer::RepositorySynchronizer;

/// Default number of repositories synchronized at the same time
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// One repository to synchronize: where it comes from and where it lives locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub remote_url: String,
    pub local_path: PathBuf,
}

impl SyncTarget {
    pub fn new(remote_url: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: remote_url.into(),
            local_path: local_path.into(),
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote_url, self.local_path.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError {
    pub message: String,
}

/// Outcome of one repository's sync attempt. Successful iff it holds no errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    errors: Vec<SyncError>,
}

impl SyncResult {
    pub fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.push(message);
        result
    }

    pub fn is_successful(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(SyncError {
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Succeeded,
    Failed,
    /// Never started because the run was cancelled first
    Cancelled,
}

/// Everything known about one target after the run
#[derive(Debug, Clone)]
pub struct RepoSyncReport {
    pub target: SyncTarget,
    pub status: SyncStatus,
    pub result: SyncResult,
    /// Branch outcomes of the last reconciliation pass, if one completed
    pub branches: Option<BranchReport>,
    /// Transient failures that were retried
    pub retries: u32,
    pub cloned: bool,
    pub duration: Duration,
}

impl RepoSyncReport {
    pub fn cancelled(target: SyncTarget) -> Self {
        Self::without_work(target, SyncStatus::Cancelled, "cancelled before start")
    }

    fn without_work(target: SyncTarget, status: SyncStatus, message: &str) -> Self {
        Self {
            target,
            status,
            result: SyncResult::failed(message),
            branches: None,
            retries: 0,
            cloned: false,
            duration: Duration::ZERO,
        }
    }
}

/// Results from a complete sync run
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub cancelled_operations: usize,
    pub duration: Duration,
    pub reports: Vec<RepoSyncReport>,
}

impl SyncSummary {
    /// Count outcomes of a finished run
    pub fn compile(reports: Vec<RepoSyncReport>, duration: Duration) -> Self {
        let mut successful_operations = 0;
        let mut failed_operations = 0;
        let mut cancelled_operations = 0;

        for report in &reports {
            match report.status {
                SyncStatus::Succeeded => successful_operations += 1,
                SyncStatus::Failed => failed_operations += 1,
                SyncStatus::Cancelled => cancelled_operations += 1,
            }
        }

        Self {
            total_repositories: reports.len(),
            successful_operations,
            failed_operations,
            cancelled_operations,
            duration,
            reports,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepoSyncReport> {
        self.reports
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
    }
}

/// Fans a batch of targets out to a [`RepositorySynchronizer`]
pub struct SyncOrchestrator<E: GitEngine + ?Sized + 'static> {
    synchronizer: Arc<RepositorySynchronizer<E>>,
    max_parallel: usize,
}

impl<E: GitEngine + ?Sized + 'static> SyncOrchestrator<E> {
    pub fn new(synchronizer: RepositorySynchronizer<E>) -> Self {
        Self {
            synchronizer: Arc::new(synchronizer),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Limit concurrent repositories; values below 1 are raised to 1.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Order targets for scheduling: existing working copies first, then
    /// clones, each group keeping input order. Each target is paired with
    /// whether its working copy exists.
    pub async fn schedule(&self, targets: Vec<SyncTarget>) -> Vec<(SyncTarget, bool)> {
        let synchronizer = self.synchronizer.clone();
        let candidates = targets.clone();
        let inspection = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .map(|t| {
                    let exists = synchronizer.engine().is_local_repository(&t.local_path);
                    (t, exists)
                })
                .collect::<Vec<_>>()
        });

        match inspection.await {
            Ok(mut scheduled) => {
                scheduled.sort_by_key(|(_, exists)| !exists);
                scheduled
            }
            Err(e) => {
                error!("Failed to inspect local working copies: {}", e);
                targets.into_iter().map(|t| (t, false)).collect()
            }
        }
    }

    /// Synchronize every target, returning one report per target in scheduling order.
    ///
    /// Never fails as a whole: repository failures are reported per target,
    /// and targets not started before `cancel` fires are reported as cancelled.
    pub async fn sync_all(&self, targets: Vec<SyncTarget>, cancel: CancellationToken) -> SyncSummary {
        let start_time = Instant::now();
        let scheduled = self.schedule(targets).await;
        let total = scheduled.len();

        let existing = scheduled.iter().filter(|(_, exists)| *exists).count();
        info!(
            "Syncing {} repositories ({} existing, {} to clone) with max parallelism {}",
            total,
            existing,
            total - existing,
            self.max_parallel
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut workers = JoinSet::new();
        let mut started = 0;

        for (index, (target, _)) in scheduled.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }

            info!("[{}/{}] Syncing {}", index + 1, total, target.remote_url);
            let synchronizer = self.synchronizer.clone();
            let target = target.clone();
            workers.spawn_blocking(move || {
                let report = panic::catch_unwind(AssertUnwindSafe(|| synchronizer.sync(&target)))
                    .unwrap_or_else(|payload| {
                        RepoSyncReport::without_work(
                            target,
                            SyncStatus::Failed,
                            &format!("worker panicked: {}", panic_message(payload.as_ref())),
                        )
                    });
                drop(permit);
                (index, report)
            });
            started += 1;
        }

        if started < total {
            warn!(
                "Cancellation requested: {} repositories will not start, waiting for {} in flight",
                total - started,
                workers.len()
            );
        }

        let mut slots: Vec<Option<RepoSyncReport>> = vec![None; total];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, report)) => {
                    if report.status == SyncStatus::Failed {
                        error!("Failed to sync {}", report.target);
                    } else {
                        debug!("{} finished: {:?}", report.target, report.status);
                    }
                    slots[index] = Some(report);
                }
                Err(e) => error!("Repository worker did not finish: {}", e),
            }
        }

        let reports = slots
            .into_iter()
            .zip(scheduled)
            .enumerate()
            .map(|(index, (slot, (target, _)))| match slot {
                Some(report) => report,
                None if index < started => RepoSyncReport::without_work(
                    target,
                    SyncStatus::Failed,
                    "worker did not finish",
                ),
                None => RepoSyncReport::cancelled(target),
            })
            .collect();

        let summary = SyncSummary::compile(reports, start_time.elapsed());
        info!(
            "Sync completed in {:.2}s: {} successful, {} failed, {} cancelled",
            summary.duration.as_secs_f64(),
            summary.successful_operations,
            summary.failed_operations,
            summary.cancelled_operations
        );
        summary
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GitError;
    use crate::git::{BranchInfo, PullOutcome, WorkingCopy};
    use crate::matcher::BranchMatcher;
    use crate::synchronizer::RetryPolicy;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};

    struct NoBranches;

    impl WorkingCopy for NoBranches {
        fn fetch_all_remotes(&mut self) -> Result<(), GitError> {
            Ok(())
        }
        fn branches(&self) -> Result<Vec<BranchInfo>, GitError> {
            Ok(vec![])
        }
        fn create_tracking_branch(&mut self, _: &BranchInfo) -> Result<String, GitError> {
            unreachable!()
        }
        fn checkout(&mut self, _: &str) -> Result<(), GitError> {
            unreachable!()
        }
        fn is_up_to_date(&self, _: &str) -> Result<bool, GitError> {
            unreachable!()
        }
        fn pull(&mut self, _: &str) -> Result<PullOutcome, GitError> {
            unreachable!()
        }
    }

    /// Engine whose clones sleep briefly while counting how many run at once.
    /// Paths containing "existing" are reported as working copies, paths
    /// containing "broken" fail to clone and "panic" makes the clone panic.
    #[derive(Default)]
    struct InstrumentedEngine {
        current: AtomicUsize,
        peak: AtomicUsize,
        clones: AtomicUsize,
        gate: Option<Arc<(Mutex<bool>, Condvar)>>,
    }

    impl InstrumentedEngine {
        fn gated() -> (Self, Arc<(Mutex<bool>, Condvar)>) {
            let gate = Arc::new((Mutex::new(false), Condvar::new()));
            let engine = Self {
                gate: Some(gate.clone()),
                ..Default::default()
            };
            (engine, gate)
        }
    }

    impl GitEngine for InstrumentedEngine {
        fn is_local_repository(&self, path: &Path) -> bool {
            path.to_string_lossy().contains("existing")
        }

        fn clone_remote(&self, _remote_url: &str, local_path: &Path) -> Result<(), GitError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.clones.fetch_add(1, Ordering::SeqCst);

            match &self.gate {
                Some(gate) => {
                    let (open, signal) = &**gate;
                    let mut open = open.lock().unwrap();
                    while !*open {
                        open = signal.wait(open).unwrap();
                    }
                }
                None => std::thread::sleep(Duration::from_millis(20)),
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            let path = local_path.to_string_lossy();
            if path.contains("panic") {
                panic!("engine exploded");
            }
            if path.contains("broken") {
                return Err(GitError::Clone {
                    url: "https://example.com/broken.git".to_string(),
                    reason: "repository not found".to_string(),
                });
            }
            Ok(())
        }

        fn open(&self, _path: &Path) -> Result<Box<dyn WorkingCopy>, GitError> {
            Ok(Box::new(NoBranches))
        }
    }

    fn targets(names: &[&str]) -> Vec<SyncTarget> {
        names
            .iter()
            .map(|name| SyncTarget::new(format!("https://example.com/{name}.git"), format!("/mirror/{name}")))
            .collect()
    }

    fn orchestrator(engine: Arc<InstrumentedEngine>, max_parallel: usize) -> SyncOrchestrator<InstrumentedEngine> {
        let synchronizer = RepositorySynchronizer::new(engine, BranchMatcher::all())
            .with_retry(RetryPolicy::none());
        SyncOrchestrator::new(synchronizer).with_max_parallel(max_parallel)
    }

    #[test]
    fn test_summary_counts_each_status() {
        let ok = RepoSyncReport {
            status: SyncStatus::Succeeded,
            result: SyncResult::default(),
            ..RepoSyncReport::cancelled(SyncTarget::new("a", "/a"))
        };
        let failed = RepoSyncReport::without_work(SyncTarget::new("b", "/b"), SyncStatus::Failed, "boom");
        let cancelled = RepoSyncReport::cancelled(SyncTarget::new("c", "/c"));

        let summary = SyncSummary::compile(vec![ok, failed, cancelled], Duration::from_secs(60));

        assert_eq!(summary.total_repositories, 3);
        assert_eq!(summary.successful_operations, 1);
        assert_eq!(summary.failed_operations, 1);
        assert_eq!(summary.cancelled_operations, 1);
        assert_eq!(summary.failures().count(), 1);
        assert_eq!(summary.duration, Duration::from_secs(60));
    }

    #[test]
    fn test_sync_result_success_tracks_errors() {
        let mut result = SyncResult::default();
        assert!(result.is_successful());
        result.push("fetch failed");
        assert!(!result.is_successful());
        assert_eq!(result.errors()[0].message, "fetch failed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        let names: Vec<String> = (0..25).map(|i| format!("repo-{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let engine = Arc::new(InstrumentedEngine::default());

        let summary = orchestrator(engine.clone(), 10)
            .sync_all(targets(&names), CancellationToken::new())
            .await;

        assert_eq!(summary.total_repositories, 25);
        assert_eq!(summary.successful_operations, 25);
        assert_eq!(engine.clones.load(Ordering::SeqCst), 25);
        assert!(engine.peak.load(Ordering::SeqCst) <= 10);
        assert!(engine.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_existing_working_copies_are_scheduled_first() {
        let engine = Arc::new(InstrumentedEngine::default());

        let summary = orchestrator(engine, 2)
            .sync_all(
                targets(&["new-a", "existing-b", "new-c", "existing-d"]),
                CancellationToken::new(),
            )
            .await;

        let order: Vec<_> = summary
            .reports
            .iter()
            .map(|r| r.target.local_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            order,
            vec!["/mirror/existing-b", "/mirror/existing-d", "/mirror/new-a", "/mirror/new-c"]
        );
        assert!(!summary.reports[0].cloned);
        assert!(summary.reports[2].cloned);
    }

    #[tokio::test]
    async fn test_failures_and_panics_stay_local_to_their_repository() {
        let engine = Arc::new(InstrumentedEngine::default());

        let summary = orchestrator(engine, 3)
            .sync_all(targets(&["good", "broken", "panic"]), CancellationToken::new())
            .await;

        assert_eq!(summary.successful_operations, 1);
        assert_eq!(summary.failed_operations, 2);
        let panicked = &summary.reports[2];
        assert_eq!(panicked.status, SyncStatus::Failed);
        assert!(panicked.result.errors()[0]
            .message
            .starts_with("worker panicked: engine exploded"));
        assert!(summary.reports[1].result.errors()[0]
            .message
            .contains("repository not found"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_stops_pending_targets() {
        let (engine, gate) = InstrumentedEngine::gated();
        let engine = Arc::new(engine);
        let cancel = CancellationToken::new();
        let orchestrator = orchestrator(engine.clone(), 2);

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator
                    .sync_all(targets(&["a", "b", "c", "d", "e"]), cancel)
                    .await
            })
        };

        while engine.current.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        {
            let (open, signal) = &*gate;
            *open.lock().unwrap() = true;
            signal.notify_all();
        }

        let summary = run.await.unwrap();
        assert_eq!(summary.successful_operations, 2);
        assert_eq!(summary.cancelled_operations, 3);
        assert_eq!(engine.clones.load(Ordering::SeqCst), 2);
        for report in &summary.reports[2..] {
            assert_eq!(report.status, SyncStatus::Cancelled);
            assert_eq!(report.result.errors()[0].message, "cancelled before start");
        }
    }
}
