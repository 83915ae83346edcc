use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use octocrab::models::Repository;
use octocrab::Octocrab;
use std::env;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, RepositoryDescriptor};
use crate::template::PathTemplate;

const DEFAULT_PATH_TEMPLATE: &str = "./repos/{ProviderName}/{Namespace}/{Slug}";

/// Where the access token came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Passed explicitly (command line or configuration)
    Explicit,
    /// `GITHUB_TOKEN` environment variable
    EnvironmentToken,
    /// GitHub CLI (`gh auth token`)
    GitHubCLI,
}

/// GitHub provider listing the authenticated user's repositories
pub struct GitHubProvider {
    client: Octocrab,
    username: String,
}

impl GitHubProvider {
    /// Build a client for `username`. `api_url` selects a GitHub Enterprise API root.
    pub fn new(username: &str, token: String, api_url: Option<&str>) -> Result<Self> {
        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(api_url) = api_url {
            builder = builder
                .base_uri(api_url)
                .with_context(|| format!("Invalid GitHub API URL: {}", api_url))?;
        }
        let client = builder.build().context("Failed to create GitHub client")?;

        Ok(Self {
            client,
            username: username.to_string(),
        })
    }

    /// Resolve a token: explicit value, then `GITHUB_TOKEN`, then the GitHub CLI.
    pub fn detect_authentication(explicit: Option<&str>) -> Result<(AuthStrategy, String)> {
        if let Some(token) = explicit.filter(|t| !t.trim().is_empty()) {
            return Ok((AuthStrategy::Explicit, token.trim().to_string()));
        }
        if let Ok(token) = Self::try_environment_token() {
            return Ok((AuthStrategy::EnvironmentToken, token));
        }
        if let Ok(token) = Self::try_github_cli() {
            return Ok((AuthStrategy::GitHubCLI, token));
        }

        Err(anyhow!(
            "No GitHub authentication found. Please either:\n\
             1. Pass --access-token\n\
             2. Set GITHUB_TOKEN environment variable\n\
             3. Install and authenticate GitHub CLI: gh auth login"
        ))
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
        let token = token.trim().to_string();

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected a ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(token)
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        let output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("GitHub CLI (gh) is not available")?;

        if !output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let token = String::from_utf8(output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        Ok(token)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// List all repositories for the authenticated user
    async fn list_user_repositories(&self) -> Result<Vec<Repository>> {
        debug!("Fetching user repositories for: {}", self.username);

        let mut repositories = Vec::new();
        let mut page = 1u8;

        loop {
            let page_repos = self
                .client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .with_context(|| format!("Failed to fetch repositories page {}", page))?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }
            repositories.extend(items);

            // GitHub API pagination limit for u8
            if page == u8::MAX {
                warn!("Reached maximum pagination limit (255 pages)");
                break;
            }
            page += 1;
        }

        info!("Found {} user repositories", repositories.len());
        Ok(repositories)
    }

    fn to_descriptor(&self, repo: Repository) -> Option<RepositoryDescriptor> {
        let Some(clone_url) = repo.clone_url else {
            warn!("Skipping {}: no clone URL", repo.name);
            return None;
        };
        let namespace = repo
            .owner
            .map(|owner| owner.login)
            .unwrap_or_else(|| self.username.clone());

        Some(RepositoryDescriptor {
            slug: repo.name.clone(),
            name: repo.name,
            namespace,
            remote_url: clone_url.to_string(),
        })
    }
}

#[async_trait]
impl Discovery for GitHubProvider {
    async fn discover(&self) -> Result<Vec<RepositoryDescriptor>> {
        let repos = self.list_user_repositories().await?;
        Ok(repos
            .into_iter()
            .filter_map(|repo| self.to_descriptor(repo))
            .collect())
    }

    fn provider_name(&self) -> &str {
        "github"
    }

    fn provider_type(&self) -> &'static str {
        "github"
    }

    fn default_path_template(&self) -> PathTemplate {
        PathTemplate::new(DEFAULT_PATH_TEMPLATE)
    }
}
