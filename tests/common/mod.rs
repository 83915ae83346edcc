/// Common test utilities and helpers for source-syncer tests
use git2::{Commit, Oid, Repository, RepositoryInitOptions, Signature};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[allow(dead_code)]
pub const SHARED_FILE: &str = "shared.txt";

/// A bare "hosted" repository with `main` and `dev` branches, plus a scratch
/// directory for the local working copies synced from it.
pub struct RemoteFixture {
    pub temp_dir: TempDir,
    pub remote_path: PathBuf,
    pub remote: Repository,
}

#[allow(dead_code)]
impl RemoteFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remote_path = temp_dir.path().join("remote.git");

        let mut options = RepositoryInitOptions::new();
        options.bare(true).initial_head("main");
        let remote =
            Repository::init_opts(&remote_path, &options).expect("Failed to init bare remote");

        commit_file(&remote, "main", SHARED_FILE, "base\n");
        commit_file(&remote, "main", "README.md", "# fixture\n");
        let main_tip = branch_tip(&remote, "main");
        remote
            .reference("refs/heads/dev", main_tip, false, "create dev")
            .expect("Failed to create dev branch");
        commit_file(&remote, "dev", "dev.txt", "dev work\n");

        Self {
            temp_dir,
            remote_path,
            remote,
        }
    }

    pub fn remote_url(&self) -> String {
        self.remote_path.to_string_lossy().into_owned()
    }

    /// Where a working copy named `name` should live.
    pub fn local_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join("local").join(name)
    }

    /// Add a commit to `branch` on the remote.
    pub fn advance(&self, branch: &str, file: &str, content: &str) -> Oid {
        commit_file(&self.remote, branch, file, content)
    }
}

pub fn signature() -> Signature<'static> {
    Signature::now("Fixture", "fixture@example.com").expect("Failed to create signature")
}

/// Commit `file` with `content` on top of `branch` without touching any working tree.
pub fn commit_file(repo: &Repository, branch: &str, file: &str, content: &str) -> Oid {
    let refname = format!("refs/heads/{}", branch);
    let parent = repo
        .find_reference(&refname)
        .ok()
        .and_then(|reference| reference.peel_to_commit().ok());
    let parent_tree = parent
        .as_ref()
        .map(|commit| commit.tree().expect("Failed to read parent tree"));

    let blob = repo.blob(content.as_bytes()).expect("Failed to write blob");
    let mut builder = repo
        .treebuilder(parent_tree.as_ref())
        .expect("Failed to create tree builder");
    builder
        .insert(file, blob, 0o100644)
        .expect("Failed to insert tree entry");
    let tree = repo
        .find_tree(builder.write().expect("Failed to write tree"))
        .expect("Failed to find tree");

    let sig = signature();
    let parents: Vec<&Commit> = parent.iter().collect();
    repo.commit(
        Some(&refname),
        &sig,
        &sig,
        &format!("Update {}", file),
        &tree,
        &parents,
    )
    .expect("Failed to commit")
}

#[allow(dead_code)]
pub fn branch_tip(repo: &Repository, branch: &str) -> Oid {
    repo.find_reference(&format!("refs/heads/{}", branch))
        .and_then(|reference| reference.peel_to_commit())
        .expect("Branch not found")
        .id()
}

#[allow(dead_code)]
pub fn local_branches(repo: &Repository) -> Vec<String> {
    let mut names: Vec<String> = repo
        .branches(Some(git2::BranchType::Local))
        .expect("Failed to list branches")
        .filter_map(|entry| entry.ok())
        .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
        .collect();
    names.sort();
    names
}

#[allow(dead_code)]
pub fn upstream_of(repo: &Repository, branch: &str) -> Option<String> {
    repo.find_branch(branch, git2::BranchType::Local)
        .ok()?
        .upstream()
        .ok()?
        .name()
        .ok()
        .flatten()
        .map(str::to_string)
}

/// Check out `branch` in a working copy and commit `file` there, as a developer would.
#[allow(dead_code)]
pub fn commit_in_working_copy(path: &Path, branch: &str, file: &str, content: &str) -> Oid {
    let repo = Repository::open(path).expect("Failed to open working copy");
    repo.set_head(&format!("refs/heads/{}", branch))
        .expect("Failed to move HEAD");
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .expect("Failed to check out");

    fs::write(path.join(file), content).expect("Failed to write file");
    let mut index = repo.index().expect("Failed to open index");
    index
        .add_path(Path::new(file))
        .expect("Failed to stage file");
    index.write().expect("Failed to write index");
    let tree = repo
        .find_tree(index.write_tree().expect("Failed to write tree"))
        .expect("Failed to find tree");
    let head = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .expect("Failed to read HEAD");

    let sig = signature();
    repo.commit(Some("HEAD"), &sig, &sig, "Local change", &tree, &[&head])
        .expect("Failed to commit")
}

/// Check out `branch` in a working copy and commit the removal of `file`.
#[allow(dead_code)]
pub fn remove_in_working_copy(path: &Path, branch: &str, file: &str) -> Oid {
    let repo = Repository::open(path).expect("Failed to open working copy");
    repo.set_head(&format!("refs/heads/{}", branch))
        .expect("Failed to move HEAD");
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .expect("Failed to check out");

    fs::remove_file(path.join(file)).expect("Failed to remove file");
    let mut index = repo.index().expect("Failed to open index");
    index
        .remove_path(Path::new(file))
        .expect("Failed to unstage file");
    index.write().expect("Failed to write index");
    let tree = repo
        .find_tree(index.write_tree().expect("Failed to write tree"))
        .expect("Failed to find tree");
    let head = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .expect("Failed to read HEAD");

    let sig = signature();
    repo.commit(Some("HEAD"), &sig, &sig, "Remove file", &tree, &[&head])
        .expect("Failed to commit")
}

/// A TCP port on localhost with nothing listening.
#[allow(dead_code)]
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("Failed to read address").port()
}

/// A localhost server that accepts connections and never answers.
#[allow(dead_code)]
pub fn silent_server() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let port = listener.local_addr().expect("Failed to read address").port();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    port
}

/// Assertion helpers for test validation
#[allow(dead_code)]
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
