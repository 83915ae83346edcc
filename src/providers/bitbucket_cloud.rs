use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{http_client, BitbucketLinks};
use crate::discovery::{Discovery, RepositoryDescriptor};
use crate::template::{PathTemplate, TemplateVariables, ACCOUNT_USERNAME};

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";

const PAGE_LENGTH: u32 = 100;

const DEFAULT_PATH_TEMPLATE: &str =
    "./source/{ProviderName}/{ProviderType}/{AccountUsername}/{Namespace}/{Slug}";

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    values: Vec<Repository>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    slug: String,
    project: Option<ProjectRef>,
    #[serde(default)]
    links: BitbucketLinks,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    key: String,
}

/// Bitbucket Cloud provider listing one account's (workspace's) repositories
pub struct BitbucketCloudProvider {
    client: reqwest::Client,
    api_url: String,
    account: String,
    username: String,
    password: String,
}

impl BitbucketCloudProvider {
    pub fn new(
        account: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_url: DEFAULT_API_URL.to_string(),
            account: account.into(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Point the provider at another API root (e.g. a mock server).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_page(&self, url: &str) -> Result<Page> {
        self.client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Bitbucket Cloud rejected request to {}", url))?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

#[async_trait]
impl Discovery for BitbucketCloudProvider {
    async fn discover(&self) -> Result<Vec<RepositoryDescriptor>> {
        debug!("Getting repositories for account {}", self.account);

        let mut repositories = Vec::new();
        let mut next = Some(format!(
            "{}/repositories/{}?pagelen={}",
            self.api_url, self.account, PAGE_LENGTH
        ));

        while let Some(url) = next.take() {
            let page = self.get_page(&url).await?;

            for repo in page.values {
                let Some(remote_url) = repo.links.clone_url("https").map(str::to_string) else {
                    warn!("Skipping {}/{}: no https clone link", self.account, repo.slug);
                    continue;
                };
                let namespace = repo
                    .project
                    .map(|project| project.key)
                    .unwrap_or_else(|| self.account.clone());

                repositories.push(RepositoryDescriptor {
                    name: repo.name,
                    slug: repo.slug,
                    namespace,
                    remote_url,
                });
            }

            next = page.next.filter(|n| !n.is_empty() && *n != url);
        }

        debug!("Found {} repositories for account {}", repositories.len(), self.account);
        Ok(repositories)
    }

    fn provider_name(&self) -> &str {
        "bitbucket"
    }

    fn provider_type(&self) -> &'static str {
        "cloud"
    }

    fn default_path_template(&self) -> PathTemplate {
        PathTemplate::new(DEFAULT_PATH_TEMPLATE)
    }

    fn template_variables(&self) -> TemplateVariables {
        TemplateVariables::new()
            .with(crate::template::PROVIDER_NAME, self.provider_name())
            .with(crate::template::PROVIDER_TYPE, self.provider_type())
            .with(ACCOUNT_USERNAME, self.account.as_str())
    }
}
