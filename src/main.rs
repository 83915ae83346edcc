use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use source_syncer::logging::{init_logging, LogOptions};
use source_syncer::providers::{BitbucketCloudProvider, BitbucketServerProvider, GitHubProvider};
use source_syncer::{
    Config, Credentials, Discovery, Git2Engine, Identity, RepositorySynchronizer, SyncOrchestrator,
    SyncSummary,
};

#[derive(Parser)]
#[command(name = "source-syncer")]
#[command(about = "Keep local git working copies in sync with a hosted provider")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print errors to the console
    #[arg(short, long, global = true)]
    silent: bool,

    /// Do not write a log file
    #[arg(long, global = true)]
    no_log_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Local path template to store in the configuration
        #[arg(long)]
        path_template: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Sync repositories of the authenticated GitHub user
    Github {
        #[arg(long)]
        username: String,

        /// E-mail used for merge commits
        #[arg(long)]
        email: Option<String>,

        /// Personal access token (falls back to the GitHub CLI)
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        access_token: Option<String>,

        /// API root of a GitHub Enterprise instance
        #[arg(long)]
        api_url: Option<String>,

        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Sync every repository of a Bitbucket Server instance
    BitbucketServer {
        /// Server base URL, e.g. https://bitbucket.example.com
        #[arg(long)]
        server: String,

        #[arg(long)]
        username: String,

        /// E-mail used for merge commits
        #[arg(long)]
        email: Option<String>,

        #[arg(long, env = "BITBUCKET_PASSWORD", hide_env_values = true)]
        password: String,

        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Sync repositories of a Bitbucket Cloud account
    BitbucketCloud {
        /// Account (workspace) whose repositories are synced
        #[arg(long)]
        account: String,

        #[arg(long)]
        username: String,

        /// E-mail used for merge commits
        #[arg(long)]
        email: Option<String>,

        /// Password or app password
        #[arg(long, env = "BITBUCKET_PASSWORD", hide_env_values = true)]
        password: String,

        #[command(flatten)]
        sync: SyncArgs,
    },
}

/// Options shared by every provider command; they override the configuration file
#[derive(Args, Debug, Clone, Default)]
struct SyncArgs {
    /// Local path template, e.g. ./repos/{ProviderName}/{Namespace}/{Slug}
    #[arg(long)]
    path_template: Option<String>,

    /// Only sync repositories whose name matches (repeatable, regex)
    #[arg(long = "repo-matcher")]
    repo_matchers: Vec<String>,

    /// Skip repositories whose name matches (repeatable, regex)
    #[arg(long)]
    exclude: Vec<String>,

    /// Only sync branches whose name matches (repeatable, regex)
    #[arg(long = "branch-matcher", conflicts_with = "all_branches")]
    branch_matchers: Vec<String>,

    /// Sync every branch regardless of configured matchers
    #[arg(long)]
    all_branches: bool,

    /// Maximum repositories synced at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Show what would be cloned or reconciled without touching anything
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(template) = &self.path_template {
            config.paths.template = Some(template.clone());
        }
        if !self.repo_matchers.is_empty() {
            config.repositories.matchers = Some(self.repo_matchers.clone());
        }
        config.repositories.exclude.extend(self.exclude.iter().cloned());
        if self.all_branches {
            config.branches.matchers = None;
        } else if !self.branch_matchers.is_empty() {
            config.branches.matchers = Some(self.branch_matchers.clone());
        }
        if let Some(max_parallel) = self.max_parallel {
            config.sync.max_parallel = max_parallel;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init {
        path_template,
        force,
    } = &cli.command
    {
        init_logging(&LogOptions {
            level: "info".to_string(),
            verbose: cli.verbose,
            silent: cli.silent,
            directory: None,
        })?;
        return cmd_init(cli.config.clone(), path_template.clone(), *force);
    }

    let mut config = load_config(cli.config.as_deref())?;

    let (provider, credentials, email, sync): (Box<dyn Discovery>, Credentials, Option<String>, SyncArgs) =
        match cli.command {
            Commands::Init { .. } => unreachable!("handled above"),
            Commands::Github {
                username,
                email,
                access_token,
                api_url,
                sync,
            } => {
                let (strategy, token) = GitHubProvider::detect_authentication(access_token.as_deref())?;
                let provider = GitHubProvider::new(&username, token.clone(), api_url.as_deref())?;
                println!("🔐 GitHub authentication: {:?}", strategy);
                (
                    Box::new(provider) as Box<dyn Discovery>,
                    Credentials::new(username, token),
                    email,
                    sync,
                )
            }
            Commands::BitbucketServer {
                server,
                username,
                email,
                password,
                sync,
            } => (
                Box::new(BitbucketServerProvider::new(server, username.clone(), password.clone())?)
                    as Box<dyn Discovery>,
                Credentials::new(username, password),
                email,
                sync,
            ),
            Commands::BitbucketCloud {
                account,
                username,
                email,
                password,
                sync,
            } => (
                Box::new(BitbucketCloudProvider::new(account, username.clone(), password.clone())?)
                    as Box<dyn Discovery>,
                Credentials::new(username, password),
                email,
                sync,
            ),
        };

    sync.apply(&mut config);

    let log_directory = (config.logging.file && !cli.no_log_file)
        .then(|| PathBuf::from(&config.logging.directory));
    let log_path = init_logging(&LogOptions {
        level: config.logging.level.clone(),
        verbose: cli.verbose,
        silent: cli.silent,
        directory: log_directory,
    })?;
    info!("Starting source-syncer v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = log_path {
        info!("Writing log file to {}", path.display());
    }

    let identity = Identity {
        name: config
            .identity
            .name
            .clone()
            .unwrap_or_else(|| credentials.username().to_string()),
        email: email
            .or_else(|| config.identity.email.clone())
            .unwrap_or_else(|| Identity::default().email),
    };

    cmd_sync(provider.as_ref(), credentials, identity, &config, sync.dry_run).await
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Write a default configuration file
fn cmd_init(config_path: Option<PathBuf>, path_template: Option<String>, force: bool) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if config_path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.paths.template = path_template;
    config
        .save(&config_path)
        .context("Failed to write default configuration")?;

    println!("✅ source-syncer initialized successfully!");
    println!("   Config: {}", config_path.display());
    if let Some(template) = &config.paths.template {
        println!("   Path template: {}", template);
    }
    println!("   Next: run 'source-syncer github|bitbucket-server|bitbucket-cloud --help'");

    Ok(())
}

/// Discover repositories and synchronize them
async fn cmd_sync(
    provider: &dyn Discovery,
    credentials: Credentials,
    identity: Identity,
    config: &Config,
    dry_run: bool,
) -> Result<()> {
    let whole_process = Instant::now();
    let filter = config.repository_filter()?;
    let matcher = config.branch_matcher()?;

    println!("🔍 Discovering repositories...");
    let fetching = Instant::now();
    let repositories = provider
        .fetch_repositories(&filter)
        .await
        .context("Failed to discover repositories")?;
    info!(
        "Fetching repositories took {:.2}s",
        fetching.elapsed().as_secs_f64()
    );
    println!("   Found {} repositories", repositories.len());

    let template = config
        .path_template()
        .unwrap_or_else(|| provider.default_path_template());
    let variables = provider.template_variables();
    let targets = repositories
        .iter()
        .map(|repo| repo.to_target(&template, &variables))
        .collect::<Result<Vec<_>>>()?;

    let engine = Arc::new(
        Git2Engine::new()
            .with_credentials(credentials)
            .with_identity(identity)
            .with_operation_timeout(config.operation_timeout()),
    );
    let synchronizer =
        RepositorySynchronizer::new(engine, matcher).with_retry(config.retry_policy());
    let orchestrator = SyncOrchestrator::new(synchronizer).with_max_parallel(config.sync.max_parallel);

    if dry_run {
        println!("\n🔍 Dry run mode - nothing will be changed");
        let scheduled = orchestrator.schedule(targets).await;
        let existing = scheduled.iter().filter(|(_, exists)| *exists).count();
        for (target, exists) in &scheduled {
            let action = if *exists { "🔄 Reconcile" } else { "📥 Clone    " };
            println!("   {} {}", action, target);
        }
        println!("\n📈 Summary:");
        println!("   🔄 Repositories to reconcile: {}", existing);
        println!("   📥 Repositories to clone: {}", scheduled.len() - existing);
        return Ok(());
    }

    println!("\n🔄 Running repository synchronization");

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, no new repositories will be started");
                cancel.cancel();
            }
        })
    };

    let summary = orchestrator.sync_all(targets, cancel).await;
    ctrl_c.abort();

    print_summary(&summary);
    info!(
        "Whole process took {:.2}s",
        whole_process.elapsed().as_secs_f64()
    );

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("\n🎉 Synchronization Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   ✅ Successful: {}", summary.successful_operations);
    println!("   ❌ Failed: {}", summary.failed_operations);
    println!("   ⏭️  Cancelled: {}", summary.cancelled_operations);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed_operations > 0 {
        println!("\n🔍 Failed Repositories:");
        for report in summary.failures() {
            println!("   ❌ {}", report.target.local_path.display());
            for error in report.result.errors() {
                println!("      {}", error.message);
            }
        }
    }
}
