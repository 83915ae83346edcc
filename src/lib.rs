//! source-syncer - keeps a fleet of local git working copies in sync
//!
//! Repositories are discovered from a hosted provider, mapped to local
//! directories through a path template, and then cloned or reconciled
//! branch by branch, many repositories at a time.
//!
//! ## Modules
//!
//! - [`providers`] / [`discovery`]: list repositories of a GitHub or Bitbucket account
//! - [`template`]: render a repository's local directory
//! - [`git`]: git engine contract and its libgit2 implementation
//! - [`reconcile`]: per-branch reconciliation of one working copy
//! - [`synchronizer`]: clone-or-reconcile state machine with bounded retry
//! - [`sync`]: bounded-parallel orchestration and run summary
//! - [`config`] / [`logging`]: YAML configuration and tracing setup

pub mod config;
pub mod discovery;
pub mod error;
pub mod git;
pub mod logging;
pub mod matcher;
pub mod providers;
pub mod reconcile;
pub mod sync;
pub mod synchronizer;
pub mod template;

pub use config::Config;
pub use discovery::{Discovery, RepositoryDescriptor};
pub use error::{ErrorDisposition, GitError};
pub use git::{Credentials, Git2Engine, GitEngine, Identity};
pub use matcher::{BranchMatcher, RepositoryFilter};
pub use sync::{RepoSyncReport, SyncOrchestrator, SyncResult, SyncStatus, SyncSummary, SyncTarget};
pub use synchronizer::{RepositorySynchronizer, RetryPolicy};
pub use template::{PathTemplate, TemplateVariables};
