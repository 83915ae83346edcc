//! Path Resolver - renders a repository's local directory from a template
//!
//! Templates use `{Key}` placeholders, e.g.
//! `./source/{ProviderName}/{ProviderType}/{Namespace}/{Slug}`. `~` and
//! environment variables are expanded before substitution, so values coming
//! from a provider are never interpreted by the shell expander. Each
//! substituted value stays a single path segment: separators become `_`, and
//! so do the dots of a bare `.` or `..`.

use anyhow::{Context, Result};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const PROVIDER_NAME: &str = "ProviderName";
pub const PROVIDER_TYPE: &str = "ProviderType";
pub const ACCOUNT_USERNAME: &str = "AccountUsername";
pub const NAMESPACE: &str = "Namespace";
pub const SLUG: &str = "Slug";

/// Variables whose values are lower-cased when substituted
const LOWERCASED: [&str; 2] = [NAMESPACE, SLUG];

/// Values available to a [`PathTemplate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVariables {
    values: BTreeMap<String, String>,
}

impl TemplateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Provider-level variables merged with one repository's namespace and slug
    pub fn for_repository(&self, namespace: &str, slug: &str) -> Self {
        self.clone().with(NAMESPACE, namespace).with(SLUG, slug)
    }
}

/// A local-path template such as `./repos/{ProviderName}/{Namespace}/{Slug}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render to an absolute, normalized path. Relative templates resolve
    /// against the current directory.
    pub fn render(&self, variables: &TemplateVariables) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.0)
            .with_context(|| format!("Failed to expand path template: {}", self.0))?;
        let path = PathBuf::from(substitute(&expanded, variables));

        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .context("Failed to determine current directory")?
                .join(path)
        };

        Ok(absolute.clean())
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace `{Key}` placeholders; unknown keys are left as written.
fn substitute(template: &str, variables: &TemplateVariables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match variables.get(key) {
                    Some(value) if LOWERCASED.contains(&key) => {
                        out.push_str(&path_segment(&value.to_lowercase()))
                    }
                    Some(value) => out.push_str(&path_segment(value)),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

fn path_segment(value: &str) -> String {
    if value == "." || value == ".." {
        return "_".repeat(value.len());
    }
    value.replace(['/', '\\'], "_")
}
