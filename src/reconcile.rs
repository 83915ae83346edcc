//! Branch reconciliation
//!
//! One pass over an open working copy: fetch every remote, select branches
//! with the [`BranchMatcher`], create local tracking branches for remote
//! branches that have none, and bring existing tracking branches up to date.
//!
//! Pulls favor the incoming side on conflicting hunks. Local trees are treated
//! as mirrors of the remote, so local edits on a synchronized branch are
//! expected to be lost.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::error::GitError;
use crate::git::{BranchInfo, PullOutcome, WorkingCopy};
use crate::matcher::BranchMatcher;

/// Where a selected branch stands before the pass touches it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    /// Remote branch without a local branch tracking it
    RemoteOnly(BranchInfo),
    /// Local branch tracking one of the selected remote branches
    LocalTrackingExists { local: String, upstream: String },
    /// Local branch with nothing selected to track
    LocalOnlyNoRemote(String),
}

/// A branch that could not be reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFailure {
    pub branch: String,
    pub message: String,
}

/// Per-branch outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct BranchReport {
    /// Local tracking branches created in this pass
    pub created: Vec<String>,
    /// Tracking branches that were checked out and pulled
    pub updated: Vec<(String, PullOutcome)>,
    /// Tracking branches already at their upstream's tip
    pub up_to_date: Vec<String>,
    /// Branch names rejected by the matcher
    pub unmatched: Vec<String>,
    /// Selected branches left alone (no tracked remote, or a name clash)
    pub untouched: Vec<String>,
    pub failures: Vec<BranchFailure>,
}

impl BranchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of branches whose ref or checkout changed.
    pub fn changed(&self) -> usize {
        self.created.len()
            + self
                .updated
                .iter()
                .filter(|(_, outcome)| *outcome != PullOutcome::UpToDate)
                .count()
    }
}

/// Classify the branches of one working copy.
///
/// Returned states are ordered: remote-only branches first, then tracking
/// branches, then local-only ones, each group sorted by name. Also returns the
/// names the matcher rejected.
pub fn classify(branches: &[BranchInfo], matcher: &BranchMatcher) -> (Vec<BranchState>, Vec<String>) {
    let mut unmatched = BTreeSet::new();
    let mut selected_remotes: BTreeMap<&str, &BranchInfo> = BTreeMap::new();

    for branch in branches.iter().filter(|b| b.is_remote() && !b.is_symbolic) {
        if matcher.matches(branch.local_name()) {
            selected_remotes.insert(branch.name.as_str(), branch);
        } else {
            unmatched.insert(branch.local_name().to_string());
        }
    }

    let mut tracked = BTreeSet::new();
    let mut local_names = BTreeSet::new();
    let mut tracking = Vec::new();
    let mut local_only = Vec::new();

    for branch in branches.iter().filter(|b| !b.is_remote()) {
        local_names.insert(branch.name.as_str());

        match branch.upstream.as_deref() {
            Some(upstream) if selected_remotes.contains_key(upstream) => {
                tracked.insert(upstream);
                tracking.push(BranchState::LocalTrackingExists {
                    local: branch.name.clone(),
                    upstream: upstream.to_string(),
                });
            }
            _ if matcher.matches(&branch.name) => {
                local_only.push(BranchState::LocalOnlyNoRemote(branch.name.clone()));
            }
            _ => {
                unmatched.insert(branch.name.clone());
            }
        }
    }

    let mut planned = BTreeSet::new();
    let mut states = Vec::new();
    for (name, branch) in &selected_remotes {
        if tracked.contains(name) {
            continue;
        }
        let local = branch.local_name();
        if local_names.contains(local) || !planned.insert(local) {
            // Another branch already owns the local name
            local_only.push(BranchState::LocalOnlyNoRemote(branch.name.clone()));
            continue;
        }
        states.push(BranchState::RemoteOnly((*branch).clone()));
    }

    states.extend(tracking);
    states.extend(local_only);
    (states, unmatched.into_iter().collect())
}

/// Reconciles the branches of one working copy
#[derive(Debug, Clone, Default)]
pub struct BranchReconciler {
    matcher: BranchMatcher,
}

impl BranchReconciler {
    pub fn new(matcher: BranchMatcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &BranchMatcher {
        &self.matcher
    }

    /// Run one pass over `working_copy`.
    ///
    /// Errors that concern the whole repository (fetch, branch listing) are
    /// returned; failures of individual branches are collected in the report
    /// and do not stop the remaining branches.
    pub fn reconcile(
        &self,
        working_copy: &mut dyn WorkingCopy,
        label: &str,
    ) -> Result<BranchReport, GitError> {
        debug!("Fetching all remotes for {}", label);
        working_copy.fetch_all_remotes()?;

        let branches = working_copy.branches()?;
        let (states, unmatched) = classify(&branches, &self.matcher);

        let mut report = BranchReport {
            unmatched,
            ..Default::default()
        };

        let to_create = states
            .iter()
            .filter(|s| matches!(s, BranchState::RemoteOnly(_)))
            .count();
        let to_track = states
            .iter()
            .filter(|s| matches!(s, BranchState::LocalTrackingExists { .. }))
            .count();
        info!(
            repo = label,
            untracked = to_create,
            tracking = to_track,
            unmatched = report.unmatched.len(),
            "{} branches selected",
            to_create + to_track
        );

        for state in states {
            match state {
                BranchState::RemoteOnly(remote) => {
                    self.create_branch(working_copy, &remote, label, &mut report)
                }
                BranchState::LocalTrackingExists { local, upstream } => {
                    self.update_branch(working_copy, &local, &upstream, label, &mut report)
                }
                BranchState::LocalOnlyNoRemote(name) => {
                    warn!(
                        "Leaving branch {} in {} untouched: no selected remote branch to track",
                        name, label
                    );
                    report.untouched.push(name);
                }
            }
        }

        Ok(report)
    }

    fn create_branch(
        &self,
        working_copy: &mut dyn WorkingCopy,
        remote: &BranchInfo,
        label: &str,
        report: &mut BranchReport,
    ) {
        let result = working_copy
            .create_tracking_branch(remote)
            .and_then(|local| working_copy.checkout(&local).map(|_| local));

        match result {
            Ok(local) => {
                info!(repo = label, branch = %local, "Created tracking branch for {}", remote.name);
                report.created.push(local);
            }
            Err(e) => {
                warn!(repo = label, branch = %remote.name, "Failed to create branch: {}", e);
                report.failures.push(BranchFailure {
                    branch: remote.local_name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn update_branch(
        &self,
        working_copy: &mut dyn WorkingCopy,
        local: &str,
        upstream: &str,
        label: &str,
        report: &mut BranchReport,
    ) {
        let result = working_copy.is_up_to_date(local).and_then(|current| {
            if current {
                return Ok(None);
            }
            info!(repo = label, branch = local, "Checking out and pulling {}", upstream);
            working_copy.checkout(local)?;
            working_copy.pull(local).map(Some)
        });

        match result {
            Ok(None) => {
                debug!(repo = label, branch = local, "Already up to date");
                report.up_to_date.push(local.to_string());
            }
            Ok(Some(outcome)) => {
                debug!(repo = label, branch = local, "Pull finished: {:?}", outcome);
                report.updated.push((local.to_string(), outcome));
            }
            Err(e) => {
                warn!(repo = label, branch = local, "Failed to update branch: {}", e);
                report.failures.push(BranchFailure {
                    branch: local.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}
