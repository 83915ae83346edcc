//! Hosted source-control providers
//!
//! - [`github`]: repositories of the authenticated GitHub user
//! - [`bitbucket_server`]: every repository of every project on a Bitbucket Server instance
//! - [`bitbucket_cloud`]: repositories of a Bitbucket Cloud account

pub mod bitbucket_cloud;
pub mod bitbucket_server;
pub mod github;

pub use bitbucket_cloud::BitbucketCloudProvider;
pub use bitbucket_server::BitbucketServerProvider;
pub use github::GitHubProvider;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("source-syncer/", env!("CARGO_PKG_VERSION"));

/// HTTP client shared by the REST providers
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")
}

/// `links` object of a Bitbucket repository
#[derive(Debug, Default, Deserialize)]
pub(crate) struct BitbucketLinks {
    #[serde(default)]
    pub clone: Vec<BitbucketLink>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BitbucketLink {
    pub href: String,
    pub name: String,
}

impl BitbucketLinks {
    /// Clone URL published under `name` ("http" on Server, "https" on Cloud)
    pub fn clone_url(&self, name: &str) -> Option<&str> {
        self.clone
            .iter()
            .find(|link| link.name.eq_ignore_ascii_case(name))
            .map(|link| link.href.as_str())
    }
}
