//! Git engine adapter
//!
//! The rest of the crate talks to git through two small capability traits:
//!
//! - [`GitEngine`]: repository-level operations (detect, clone, open)
//! - [`WorkingCopy`]: operations on one open working tree (fetch, list
//!   branches, create tracking branches, checkout, pull)
//!
//! Both are synchronous. The orchestrator runs them on blocking worker
//! threads, one working copy per worker. [`Git2Engine`] is the libgit2
//! implementation.

mod git2_engine;
mod progress;

pub use git2_engine::Git2Engine;
pub use progress::ProgressThrottle;

use std::fmt;
use std::path::Path;

use crate::error::GitError;

/// Username/password pair used for every network operation against one provider
#[derive(Clone, Default)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Author/committer used for merge commits created by a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: "source-syncer".to_string(),
            email: "source-syncer@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Local,
    Remote,
}

/// One branch as seen during a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    /// Short name: `main` for local branches, `origin/main` for remote ones
    pub name: String,
    pub kind: BranchKind,
    /// Remote a remote-tracking branch belongs to
    pub remote: Option<String>,
    /// Short name of a local branch's configured upstream (`origin/main`)
    pub upstream: Option<String>,
    /// Symbolic pointer such as `origin/HEAD`
    pub is_symbolic: bool,
}

impl BranchInfo {
    pub fn local(name: impl Into<String>, upstream: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind: BranchKind::Local,
            remote: None,
            upstream: upstream.map(str::to_string),
            is_symbolic: false,
        }
    }

    pub fn remote(remote: &str, branch: &str) -> Self {
        Self {
            name: format!("{remote}/{branch}"),
            kind: BranchKind::Remote,
            remote: Some(remote.to_string()),
            upstream: None,
            is_symbolic: branch == "HEAD",
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind == BranchKind::Remote
    }

    /// Name this branch has (or would have) as a local branch.
    pub fn local_name(&self) -> &str {
        match (&self.kind, &self.remote) {
            (BranchKind::Remote, Some(remote)) => self
                .name
                .strip_prefix(remote.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(&self.name),
            (BranchKind::Remote, None) => self
                .name
                .split_once('/')
                .map(|(_, rest)| rest)
                .unwrap_or(&self.name),
            (BranchKind::Local, _) => &self.name,
        }
    }
}

/// What a pull did to a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded,
    Merged,
}

/// An open local repository, held for the duration of one reconciliation pass
pub trait WorkingCopy {
    /// Update remote-tracking refs of every configured remote. Never touches the working tree.
    fn fetch_all_remotes(&mut self) -> Result<(), GitError>;

    /// Local and remote-tracking branches, sorted by name.
    fn branches(&self) -> Result<Vec<BranchInfo>, GitError>;

    /// Create a local branch at the remote branch's tip, tracking it. Returns the local name.
    fn create_tracking_branch(&mut self, remote_branch: &BranchInfo) -> Result<String, GitError>;

    /// Force-checkout a local branch, discarding uncommitted changes.
    fn checkout(&mut self, branch: &str) -> Result<(), GitError>;

    /// Whether a local branch already contains its upstream's tip (equal to it or merged past it).
    fn is_up_to_date(&self, branch: &str) -> Result<bool, GitError>;

    /// Merge the (already fetched) upstream into the checked-out branch.
    ///
    /// Fast-forwards when possible; otherwise merges preferring the incoming
    /// side for conflicting hunks.
    fn pull(&mut self, branch: &str) -> Result<PullOutcome, GitError>;
}

/// Repository-level git capabilities
#[cfg_attr(test, mockall::automock)]
pub trait GitEngine: Send + Sync {
    /// True iff `path` is a git working directory. Missing paths are `false`, not errors.
    fn is_local_repository(&self, path: &Path) -> bool;

    /// Full clone of `remote_url` into `local_path`.
    fn clone_remote(&self, remote_url: &str, local_path: &Path) -> Result<(), GitError>;

    /// Open the working copy at `path`.
    fn open(&self, path: &Path) -> Result<Box<dyn WorkingCopy>, GitError>;
}
