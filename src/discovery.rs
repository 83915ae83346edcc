//! Repository discovery abstraction layer
//!
//! Providers turn a hosted source-control account into a list of
//! [`RepositoryDescriptor`]s. Everything past discovery (path rendering,
//! synchronization) is provider-agnostic.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::matcher::RepositoryFilter;
use crate::sync::SyncTarget;
use crate::template::{PathTemplate, TemplateVariables};

/// Identity and location of a remote repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    /// Display name (e.g., "Billing API")
    pub name: String,

    /// URL-safe repository identifier (e.g., "billing-api")
    pub slug: String,

    /// Owner, project key or workspace the repository lives under
    pub namespace: String,

    /// HTTPS clone URL
    pub remote_url: String,
}

impl RepositoryDescriptor {
    /// Display name (namespace/slug format)
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.slug)
    }

    /// Local directory for this repository under `template`.
    pub fn local_path(
        &self,
        template: &PathTemplate,
        provider_variables: &TemplateVariables,
    ) -> Result<PathBuf> {
        template.render(&provider_variables.for_repository(&self.namespace, &self.slug))
    }

    pub fn to_target(
        &self,
        template: &PathTemplate,
        provider_variables: &TemplateVariables,
    ) -> Result<SyncTarget> {
        Ok(SyncTarget::new(
            self.remote_url.clone(),
            self.local_path(template, provider_variables)?,
        ))
    }
}

/// Trait for repository discovery from a hosted provider
///
/// Implement this trait to add support for another hosting provider.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every repository visible to the configured account
    async fn discover(&self) -> Result<Vec<RepositoryDescriptor>>;

    /// Configured name of this provider instance, used in paths
    fn provider_name(&self) -> &str;

    /// Kind of provider (e.g., "GitHub")
    fn provider_type(&self) -> &'static str;

    /// Path template used when none is configured
    fn default_path_template(&self) -> PathTemplate;

    /// Provider-level template variables
    fn template_variables(&self) -> TemplateVariables {
        TemplateVariables::new()
            .with(crate::template::PROVIDER_NAME, self.provider_name())
            .with(crate::template::PROVIDER_TYPE, self.provider_type())
    }

    /// Discover, then keep repositories whose name passes `filter`.
    async fn fetch_repositories(
        &self,
        filter: &RepositoryFilter,
    ) -> Result<Vec<RepositoryDescriptor>> {
        let discovered = self.discover().await?;
        let total = discovered.len();

        let selected: Vec<_> = discovered
            .into_iter()
            .filter(|repo| {
                let allowed = filter.allows(&repo.name);
                if !allowed {
                    debug!("Excluding repository {} by name filter", repo.full_name());
                }
                allowed
            })
            .collect();

        info!(
            "Discovered {} repositories from {}, {} selected",
            total,
            self.provider_type(),
            selected.len()
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        repos: Vec<RepositoryDescriptor>,
    }

    #[async_trait]
    impl Discovery for StaticProvider {
        async fn discover(&self) -> Result<Vec<RepositoryDescriptor>> {
            Ok(self.repos.clone())
        }

        fn provider_name(&self) -> &str {
            "static"
        }

        fn provider_type(&self) -> &'static str {
            "Static"
        }

        fn default_path_template(&self) -> PathTemplate {
            PathTemplate::new("/mirror/{ProviderName}/{Namespace}/{Slug}")
        }
    }

    fn descriptor(name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            name: name.to_string(),
            slug: name.to_lowercase(),
            namespace: "Team".to_string(),
            remote_url: format!("https://git.example.com/team/{}.git", name.to_lowercase()),
        }
    }

    #[tokio::test]
    async fn test_fetch_repositories_applies_filter() {
        let provider = StaticProvider {
            repos: vec![descriptor("Api"), descriptor("Web"), descriptor("Api-Archive")],
        };
        let filter = RepositoryFilter::new(Some(&["^api"][..]), &["archive"][..]).unwrap();

        let repos = provider.fetch_repositories(&filter).await.unwrap();

        assert_eq!(repos, vec![descriptor("Api")]);
    }

    #[tokio::test]
    async fn test_descriptor_becomes_target_under_provider_template() {
        let provider = StaticProvider { repos: vec![] };
        let repo = descriptor("Api");

        let target = repo
            .to_target(&provider.default_path_template(), &provider.template_variables())
            .unwrap();

        assert_eq!(target.remote_url, "https://git.example.com/team/api.git");
        assert_eq!(target.local_path, PathBuf::from("/mirror/static/team/api"));
    }
}
