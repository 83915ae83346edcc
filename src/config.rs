use anyhow::{Context, Result};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::matcher::{BranchMatcher, RepositoryFilter};
use crate::synchronizer::RetryPolicy;
use crate::template::PathTemplate;

/// Main configuration structure for source-syncer
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Which branches take part in synchronization
    #[serde(default)]
    pub branches: BranchConfig,

    /// Which discovered repositories are synchronized
    #[serde(default)]
    pub repositories: RepositoryConfig,

    /// Local directory layout
    #[serde(default)]
    pub paths: PathConfig,

    /// Signature used for merge commits
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum repositories synchronized at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a single clone or fetch, in seconds (0 disables)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry of transient network failures
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Branch selection
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BranchConfig {
    /// Case-insensitive regular expressions; `null` or empty selects every branch
    #[serde(default = "default_branch_matchers")]
    pub matchers: Option<Vec<String>>,
}

/// Repository selection by name
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct RepositoryConfig {
    /// Case-insensitive regular expressions; `null` or empty selects every repository
    #[serde(default)]
    pub matchers: Option<Vec<String>>,

    /// Repositories matching any of these are skipped
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct PathConfig {
    /// Local path template; `null` uses the provider's default
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct IdentityConfig {
    /// Merge commit author name; defaults to the provider username
    #[serde(default)]
    pub name: Option<String>,

    /// Merge commit author e-mail
    #[serde(default)]
    pub email: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Also write to a log file
    #[serde(default = "default_true")]
    pub file: bool,

    /// Log file directory
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_max_parallel() -> usize {
    crate::sync::DEFAULT_MAX_PARALLEL
}
fn default_operation_timeout() -> u64 {
    900
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8000
}
fn default_branch_matchers() -> Option<Vec<String>> {
    Some(vec![
        "^develop".to_string(),
        "^master".to_string(),
        "^release".to_string(),
    ])
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_directory() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/source-syncer/logs", data_home)
    } else if let Some(data) = data_dir() {
        data.join("source-syncer").join("logs").display().to_string()
    } else {
        "./logs".to_string()
    }
}

// Default implementations
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            operation_timeout: default_operation_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            matchers: default_branch_matchers(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_true(),
            directory: default_log_directory(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file, creating its directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("source-syncer").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.logging.directory = shellexpand::full(&self.logging.directory)
            .context("Failed to expand logging.directory path")?
            .into_owned();

        // paths.template is expanded when it is rendered

        Ok(())
    }

    /// `None` when the timeout is disabled
    pub fn operation_timeout(&self) -> Option<Duration> {
        match self.sync.operation_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.sync.retry.max_retries,
            initial_backoff: Duration::from_millis(self.sync.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.sync.retry.max_backoff_ms),
        }
    }

    pub fn branch_matcher(&self) -> Result<BranchMatcher> {
        BranchMatcher::from_patterns(self.branches.matchers.as_deref())
            .context("Invalid branch matcher in configuration")
    }

    pub fn repository_filter(&self) -> Result<RepositoryFilter> {
        RepositoryFilter::new(
            self.repositories.matchers.as_deref(),
            &self.repositories.exclude[..],
        )
        .context("Invalid repository matcher in configuration")
    }

    pub fn path_template(&self) -> Option<PathTemplate> {
        self.paths
            .template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(PathTemplate::new)
    }
}
