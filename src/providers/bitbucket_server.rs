use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{http_client, BitbucketLinks};
use crate::discovery::{Discovery, RepositoryDescriptor};
use crate::template::PathTemplate;

const REST_API: &str = "/rest/api/1.0";
const PAGE_LIMIT: u32 = 1000;

/// Projects whose repositories are listed at the same time
const PROJECT_CONCURRENCY: usize = 8;

const DEFAULT_PATH_TEMPLATE: &str = "./source/{ProviderName}/{ProviderType}/{Namespace}/{Slug}";

/// One page of a Bitbucket Server paged response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default = "default_last_page")]
    is_last_page: bool,
    next_page_start: Option<u64>,
}

fn default_last_page() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Project {
    key: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    slug: String,
    #[serde(default)]
    links: BitbucketLinks,
}

/// Bitbucket Server (self-hosted) provider using basic authentication
pub struct BitbucketServerProvider {
    client: reqwest::Client,
    server_url: String,
    username: String,
    password: String,
}

impl BitbucketServerProvider {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Every item of a paged endpoint, following `nextPageStart`.
    async fn get_paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let url = format!("{}{}{}", self.server_url, REST_API, path);
        let mut items = Vec::new();
        let mut start = 0u64;

        loop {
            let page: Page<T> = self
                .client
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .query(&[("limit", u64::from(PAGE_LIMIT)), ("start", start)])
                .send()
                .await
                .with_context(|| format!("Failed to request {}", url))?
                .error_for_status()
                .with_context(|| format!("Bitbucket Server rejected request to {}", url))?
                .json()
                .await
                .with_context(|| format!("Failed to parse response from {}", url))?;

            items.extend(page.values);

            match page.next_page_start {
                Some(next) if !page.is_last_page && next > start => start = next,
                _ => break,
            }
        }

        Ok(items)
    }

    async fn project_repositories(&self, project: &Project) -> Result<Vec<RepositoryDescriptor>> {
        debug!("Getting repositories for project {} ({})", project.name, project.key);
        let repos: Vec<Repository> = self
            .get_paged(&format!("/projects/{}/repos", project.key))
            .await?;
        debug!("Found {} repositories for project {}", repos.len(), project.key);

        Ok(repos
            .into_iter()
            .filter_map(|repo| {
                let Some(remote_url) = repo.links.clone_url("http") else {
                    warn!("Skipping {}/{}: no http clone link", project.key, repo.slug);
                    return None;
                };
                Some(RepositoryDescriptor {
                    remote_url: remote_url.to_string(),
                    name: repo.name,
                    slug: repo.slug,
                    namespace: project.key.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl Discovery for BitbucketServerProvider {
    async fn discover(&self) -> Result<Vec<RepositoryDescriptor>> {
        debug!("Getting projects for user {}", self.username);
        let projects: Vec<Project> = self
            .get_paged("/projects")
            .await
            .context("Failed to list Bitbucket Server projects")?;
        info!("Found {} projects on {}", projects.len(), self.server_url);

        let requests: Vec<_> = projects
            .iter()
            .map(|project| async move {
                self.project_repositories(project)
                    .await
                    .with_context(|| format!("Failed to list repositories of project {}", project.key))
            })
            .collect();
        let per_project: Vec<Result<Vec<RepositoryDescriptor>>> = stream::iter(requests)
            .buffer_unordered(PROJECT_CONCURRENCY)
            .collect()
            .await;

        let mut repositories = Vec::new();
        for result in per_project {
            repositories.extend(result?);
        }
        repositories.sort_by(|a, b| (&a.namespace, &a.slug).cmp(&(&b.namespace, &b.slug)));

        Ok(repositories)
    }

    fn provider_name(&self) -> &str {
        "bitbucket"
    }

    fn provider_type(&self) -> &'static str {
        "server"
    }

    fn default_path_template(&self) -> PathTemplate {
        PathTemplate::new(DEFAULT_PATH_TEMPLATE)
    }
}
