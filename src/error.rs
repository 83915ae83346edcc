//! Git error type and failure classification
//!
//! Every failure reported by a [`GitEngine`](crate::git::GitEngine) is a
//! [`GitError`]. The synchronizer asks each error for its
//! [`ErrorDisposition`] to decide between retrying, failing fast, or
//! recording the failure for that repository.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Engine message fragment for a transient transport failure.
const TRANSIENT_MARKER: &str = "failed to send request";

/// Engine message fragment for a remote URL the engine cannot talk to.
const PERMANENT_MARKER: &str = "unsupported url protocol";

/// Errors raised by git engine operations
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to clone {url}: {reason}")]
    Clone { url: String, reason: String },

    #[error("failed to open repository at {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error("failed to fetch remote '{remote}': {reason}")]
    Fetch { remote: String, reason: String },

    #[error("{operation} timed out after {}s", elapsed.as_secs())]
    TimedOut {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("branch '{branch}': {reason}")]
    Branch { branch: String, reason: String },

    #[error("merge into '{branch}' left conflicts in {}", paths.join(", "))]
    Conflicts { branch: String, paths: Vec<String> },

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the synchronizer reacts to a failed engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Network blip; the same operation is retried with backoff
    Transient,
    /// The operation can never succeed for this repository; fail without retrying
    Permanent,
    /// Anything else; recorded as the repository's failure
    Fatal,
}

impl GitError {
    /// Classify this error by its message, case-insensitively.
    pub fn disposition(&self) -> ErrorDisposition {
        if let GitError::TimedOut { .. } = self {
            return ErrorDisposition::Fatal;
        }

        let message = self.to_string().to_lowercase();
        if message.contains(TRANSIENT_MARKER) {
            ErrorDisposition::Transient
        } else if message.contains(PERMANENT_MARKER) {
            ErrorDisposition::Permanent
        } else {
            ErrorDisposition::Fatal
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == ErrorDisposition::Transient
    }

    pub(crate) fn branch(branch: impl Into<String>, err: impl std::fmt::Display) -> Self {
        GitError::Branch {
            branch: branch.into(),
            reason: err.to_string(),
        }
    }
}
