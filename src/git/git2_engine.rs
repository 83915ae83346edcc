use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, FetchPrune,
    FileFavor, MergeOptions, Progress, RemoteCallbacks, Repository, ResetType, Signature,
};
use tracing::{debug, info, warn};

use super::{
    BranchInfo, BranchKind, Credentials, GitEngine, Identity, ProgressThrottle, PullOutcome,
    WorkingCopy,
};
use crate::error::GitError;

/// libgit2-backed [`GitEngine`]
#[derive(Debug, Clone, Default)]
pub struct Git2Engine {
    credentials: Option<Credentials>,
    identity: Identity,
    operation_timeout: Option<Duration>,
    progress_interval: Option<Duration>,
}

impl Git2Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Abort clone and fetch transfers running longer than `timeout`.
    ///
    /// Also bounds libgit2's socket connect and read/write waits, which are
    /// process-wide settings, so a remote that accepts a connection and then
    /// goes silent cannot hold a worker forever.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        if let Some(timeout) = timeout {
            apply_server_timeouts(timeout);
        }
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    fn throttle(&self) -> ProgressThrottle {
        self.progress_interval
            .map(ProgressThrottle::new)
            .unwrap_or_default()
    }
}

fn apply_server_timeouts(timeout: Duration) {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1);
    // SAFETY: libgit2 global options; set while building the engine, before
    // any worker starts a network operation.
    let applied = unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)
            .and_then(|_| git2::opts::set_server_timeout_in_milliseconds(millis))
    };
    if let Err(e) = applied {
        warn!("Failed to set git server timeouts: {}", e.message());
    }
}

/// URL schemes libgit2 can clone from. scp-style (`git@host:path`) and plain
/// local paths carry no scheme and are always accepted.
const SUPPORTED_SCHEMES: [&str; 7] = ["http", "https", "ssh", "git", "file", "git+ssh", "ssh+git"];

fn check_protocol(remote_url: &str) -> Result<(), GitError> {
    let Some((scheme, _)) = remote_url.split_once("://") else {
        return Ok(());
    };
    let scheme = scheme.to_ascii_lowercase();
    if SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Ok(());
    }

    Err(GitError::Clone {
        url: remote_url.to_string(),
        reason: format!("unsupported URL protocol '{}'", scheme),
    })
}

/// libgit2's message, tagged as a transport failure when it came from the network layer.
fn failure_reason(e: &git2::Error) -> String {
    match e.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl => {
            format!("failed to send request: {}", e.message())
        }
        _ => e.message().to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn expired(&self) -> bool {
        self.limit
            .map(|limit| self.started.elapsed() >= limit)
            .unwrap_or(false)
    }

    fn timed_out(&self, operation: &'static str) -> GitError {
        GitError::TimedOut {
            operation,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Callbacks shared by clone and fetch: credentials, throttled transfer
/// progress, and the deadline check.
fn remote_callbacks<'a>(
    credentials: Option<&'a Credentials>,
    operation: &'static str,
    target: String,
    deadline: Deadline,
    mut throttle: ProgressThrottle,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0u32;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        if allowed.contains(CredentialType::USERNAME) {
            let username = credentials
                .map(Credentials::username)
                .or(username_from_url)
                .unwrap_or("git");
            return Cred::username(username);
        }

        attempts += 1;
        if attempts > 1 {
            return Err(git2::Error::from_str("credentials were rejected by the remote"));
        }

        match credentials {
            Some(creds) if allowed.is_user_pass_plaintext() => {
                Cred::userpass_plaintext(creds.username(), creds.password())
            }
            _ if allowed.is_ssh_key() => {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            }
            _ => Cred::default(),
        }
    });

    callbacks.sideband_progress(move |_text| !deadline.expired());

    callbacks.transfer_progress(move |stats: Progress<'_>| {
        if deadline.expired() {
            return false;
        }
        if throttle.ready() {
            info!(
                repo = %target,
                received = stats.received_objects(),
                indexed = stats.indexed_objects(),
                total = stats.total_objects(),
                bytes = stats.received_bytes(),
                "{} transfer progress",
                operation
            );
        }
        true
    });

    callbacks
}

impl GitEngine for Git2Engine {
    fn is_local_repository(&self, path: &Path) -> bool {
        Repository::open(path)
            .map(|repo| !repo.is_bare())
            .unwrap_or(false)
    }

    fn clone_remote(&self, remote_url: &str, local_path: &Path) -> Result<(), GitError> {
        check_protocol(remote_url)?;
        let created_here = !local_path.exists();

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let deadline = Deadline::start(self.operation_timeout);
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(
            self.credentials.as_ref(),
            "clone",
            local_path.display().to_string(),
            deadline,
            self.throttle(),
        ));

        let mut checkout_throttle = self.throttle();
        let checkout_target = local_path.display().to_string();
        let mut checkout = CheckoutBuilder::new();
        checkout.progress(move |_path, completed, total| {
            if checkout_throttle.ready() {
                info!(repo = %checkout_target, completed, total, "checkout progress");
            }
        });

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options);
        builder.with_checkout(checkout);

        match builder.clone(remote_url, local_path) {
            Ok(_) => Ok(()),
            Err(e) => {
                if created_here && local_path.exists() {
                    if let Err(cleanup) = std::fs::remove_dir_all(local_path) {
                        warn!(
                            "Failed to remove partial clone at {}: {}",
                            local_path.display(),
                            cleanup
                        );
                    }
                }

                if deadline.expired() {
                    Err(deadline.timed_out("clone"))
                } else {
                    Err(GitError::Clone {
                        url: remote_url.to_string(),
                        reason: failure_reason(&e),
                    })
                }
            }
        }
    }

    fn open(&self, path: &Path) -> Result<Box<dyn WorkingCopy>, GitError> {
        let repo = Repository::open(path).map_err(|e| GitError::Open {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })?;

        Ok(Box::new(Git2WorkingCopy {
            repo,
            path: path.to_path_buf(),
            engine: self.clone(),
        }))
    }
}

struct Git2WorkingCopy {
    repo: Repository,
    path: PathBuf,
    engine: Git2Engine,
}

impl Git2WorkingCopy {
    fn local_branch(&self, branch: &str) -> Result<git2::Branch<'_>, GitError> {
        self.repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| GitError::branch(branch, e))
    }

    fn upstream_of(&self, branch: &str) -> Result<git2::Branch<'_>, GitError> {
        self.local_branch(branch)?
            .upstream()
            .map_err(|e| GitError::branch(branch, format!("no upstream: {}", e.message())))
    }

    fn signature(&self) -> Result<Signature<'static>, GitError> {
        Ok(Signature::now(
            &self.engine.identity.name,
            &self.engine.identity.email,
        )?)
    }

    /// Leave the tree clean on the branch tip after a failed merge.
    fn abort_merge(&self) -> Result<(), GitError> {
        self.repo.cleanup_state()?;
        let head = self.repo.head()?.peel_to_commit()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .reset(head.as_object(), ResetType::Hard, Some(&mut checkout))?;
        Ok(())
    }

    fn fast_forward(&self, branch: &str, target: git2::Oid) -> Result<(), GitError> {
        let object = self.repo.find_object(target, None)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_tree(&object, Some(&mut checkout))?;

        let mut reference = self.local_branch(branch)?.into_reference();
        reference.set_target(target, &format!("fast-forward {} to {}", branch, target))?;
        Ok(())
    }

    fn merge_theirs(
        &self,
        branch: &str,
        upstream_name: &str,
        incoming: &git2::AnnotatedCommit<'_>,
    ) -> Result<(), GitError> {
        let mut merge_options = MergeOptions::new();
        merge_options.file_favor(FileFavor::Theirs);
        let mut checkout = CheckoutBuilder::new();
        checkout.force().allow_conflicts(true);
        if let Err(e) = self
            .repo
            .merge(&[incoming], Some(&mut merge_options), Some(&mut checkout))
        {
            self.abort_merge()?;
            return Err(GitError::branch(branch, e));
        }

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let paths = index
                .conflicts()?
                .filter_map(Result::ok)
                .filter_map(|conflict| conflict.their.or(conflict.our).or(conflict.ancestor))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            self.abort_merge()?;
            return Err(GitError::Conflicts {
                branch: branch.to_string(),
                paths,
            });
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let ours = self.repo.head()?.peel_to_commit()?;
        let theirs = self.repo.find_commit(incoming.id())?;
        let signature = self.signature()?;
        let message = format!("Merge {} into {}", upstream_name, branch);

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message,
            &tree,
            &[&ours, &theirs],
        )?;
        self.repo.cleanup_state()?;
        Ok(())
    }
}

impl WorkingCopy for Git2WorkingCopy {
    fn fetch_all_remotes(&mut self) -> Result<(), GitError> {
        let remotes = self.repo.remotes()?;

        for name in remotes.iter().flatten() {
            let mut remote = self.repo.find_remote(name)?;
            let deadline = Deadline::start(self.engine.operation_timeout);

            let mut options = FetchOptions::new();
            options.prune(FetchPrune::On);
            options.remote_callbacks(remote_callbacks(
                self.engine.credentials.as_ref(),
                "fetch",
                format!("{} ({})", self.path.display(), name),
                deadline,
                self.engine.throttle(),
            ));

            debug!("Fetching remote {} for {}", name, self.path.display());
            remote
                .fetch::<&str>(&[], Some(&mut options), None)
                .map_err(|e| {
                    if deadline.expired() {
                        deadline.timed_out("fetch")
                    } else {
                        GitError::Fetch {
                            remote: name.to_string(),
                            reason: failure_reason(&e),
                        }
                    }
                })?;
        }

        Ok(())
    }

    fn branches(&self) -> Result<Vec<BranchInfo>, GitError> {
        let mut branches = Vec::new();

        for entry in self.repo.branches(None)? {
            let (branch, branch_type) = entry?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                warn!("Skipping branch with a non UTF-8 name in {}", self.path.display());
                continue;
            };

            match branch_type {
                BranchType::Local => {
                    let upstream = match branch.upstream() {
                        Ok(upstream) => upstream.name()?.map(str::to_string),
                        Err(e) if e.code() == ErrorCode::NotFound => None,
                        Err(e) => return Err(e.into()),
                    };
                    branches.push(BranchInfo::local(name, upstream.as_deref()));
                }
                BranchType::Remote => {
                    let reference = branch.get();
                    let remote = reference
                        .name()
                        .and_then(|full| self.repo.branch_remote_name(full).ok())
                        .and_then(|buf| buf.as_str().map(str::to_string));
                    let is_symbolic =
                        reference.symbolic_target().is_some() || name.ends_with("/HEAD");

                    branches.push(BranchInfo {
                        name,
                        kind: BranchKind::Remote,
                        remote,
                        upstream: None,
                        is_symbolic,
                    });
                }
            }
        }

        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    fn create_tracking_branch(&mut self, remote_branch: &BranchInfo) -> Result<String, GitError> {
        let local_name = remote_branch.local_name().to_string();
        let tip = self
            .repo
            .find_reference(&format!("refs/remotes/{}", remote_branch.name))
            .and_then(|reference| reference.peel_to_commit())
            .map_err(|e| GitError::branch(&local_name, e))?;

        let mut branch = self
            .repo
            .branch(&local_name, &tip, false)
            .map_err(|e| GitError::branch(&local_name, e))?;
        branch
            .set_upstream(Some(&remote_branch.name))
            .map_err(|e| GitError::branch(&local_name, e))?;

        Ok(local_name)
    }

    fn checkout(&mut self, branch: &str) -> Result<(), GitError> {
        let reference = self.local_branch(branch)?.into_reference();
        let refname = reference
            .name()
            .ok_or_else(|| GitError::branch(branch, "reference name is not valid UTF-8"))?
            .to_string();
        let tip = reference
            .peel_to_commit()
            .map_err(|e| GitError::branch(branch, e))?;

        let mut throttle = self.engine.throttle();
        let target = self.path.display().to_string();
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        checkout.progress(move |_path, completed, total| {
            if throttle.ready() {
                info!(repo = %target, completed, total, "checkout progress");
            }
        });

        self.repo
            .checkout_tree(tip.as_object(), Some(&mut checkout))
            .map_err(|e| GitError::branch(branch, e))?;
        self.repo
            .set_head(&refname)
            .map_err(|e| GitError::branch(branch, e))?;
        Ok(())
    }

    fn is_up_to_date(&self, branch: &str) -> Result<bool, GitError> {
        let local = self.local_branch(branch)?.get().target();
        let upstream = self.upstream_of(branch)?.get().target();

        match (local, upstream) {
            (Some(local), Some(upstream)) if local == upstream => Ok(true),
            // A branch that already merged its upstream tip has nothing to pull
            (Some(local), Some(upstream)) => Ok(self.repo.graph_descendant_of(local, upstream)?),
            _ => Ok(false),
        }
    }

    fn pull(&mut self, branch: &str) -> Result<PullOutcome, GitError> {
        let upstream = self.upstream_of(branch)?;
        let upstream_name = upstream
            .name()?
            .unwrap_or("upstream")
            .to_string();
        let upstream_ref = upstream.into_reference();
        let incoming = self.repo.reference_to_annotated_commit(&upstream_ref)?;

        let (analysis, _) = self.repo.merge_analysis(&[&incoming])?;
        if analysis.is_up_to_date() {
            return Ok(PullOutcome::UpToDate);
        }
        if analysis.is_fast_forward() {
            self.fast_forward(branch, incoming.id())?;
            return Ok(PullOutcome::FastForwarded);
        }
        if analysis.is_normal() {
            self.merge_theirs(branch, &upstream_name, &incoming)?;
            return Ok(PullOutcome::Merged);
        }

        Err(GitError::branch(
            branch,
            format!("cannot merge {} (unborn branch or unrelated state)", upstream_name),
        ))
    }
}
