use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::cache::Cache;
use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{AdmissionPolicy, Identity, Quota};
use tollgate::store::{self, KeyedStore};

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Admission control and shared cache over a keyed store")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one event for a caller and print the admission decision
    Check {
        #[command(flatten)]
        caller: CallerArgs,

        #[command(flatten)]
        quota: QuotaArgs,
    },
    /// Print how many events a caller has left without recording one
    Remaining {
        #[command(flatten)]
        caller: CallerArgs,

        #[command(flatten)]
        quota: QuotaArgs,
    },
    /// List configured operation quotas
    Quotas,
    /// Inspect or modify cached values
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    Get { key: String },
    Set {
        key: String,
        value: String,
        /// TTL in seconds; the configured default when omitted
        #[arg(long)]
        ttl: Option<u64>,
    },
    Delete { key: String },
    Exists { key: String },
    /// Delete every key matching a glob pattern
    Clear { pattern: String },
    Stats,
}

#[derive(Args, Debug)]
struct CallerArgs {
    /// Authenticated subject id
    #[arg(long)]
    subject: Option<String>,

    /// Network origin of the caller
    #[arg(long, default_value = "unknown")]
    origin: String,
}

impl CallerArgs {
    fn identity(&self) -> Identity {
        match &self.subject {
            Some(subject) => Identity::authenticated(subject.clone(), self.origin.clone()),
            None => Identity::anonymous(self.origin.clone()),
        }
    }
}

#[derive(Args, Debug)]
struct QuotaArgs {
    /// Configured operation whose quota applies
    #[arg(long, conflicts_with_all = ["limit", "window"])]
    operation: Option<String>,

    /// Ad-hoc limit, used with --window
    #[arg(long, requires = "window")]
    limit: Option<u32>,

    /// Ad-hoc window in seconds, used with --limit
    #[arg(long, requires = "limit")]
    window: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    let store = store::connect(&config.store)
        .await
        .context("Failed to connect to the backing store")?;

    let result = run(cli.command, &config, store.clone()).await;
    store.close().await;
    result
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(command: Command, config: &TollgateConfig, store: Arc<dyn KeyedStore>) -> anyhow::Result<()> {
    match command {
        Command::Check { caller, quota } => {
            let policy = AdmissionPolicy::new(store, &config.admission);
            let identity = caller.identity();
            let decision = match resolve_quota(&quota, &policy)? {
                QuotaSource::Operation(operation) => policy
                    .check_operation(&operation, &identity)
                    .await
                    .with_context(|| format!("No quota configured for operation '{operation}'"))?,
                QuotaSource::AdHoc(quota) => policy.check(&identity, &quota).await,
            };

            match decision.rejection() {
                Some(rejection) => {
                    println!("denied");
                    for (name, value) in rejection.headers() {
                        println!("{name}: {value}");
                    }
                    println!("{}", rejection.body());
                }
                None => println!("allowed remaining={} limit={}", decision.remaining, decision.limit),
            }
        }
        Command::Remaining { caller, quota } => {
            let policy = AdmissionPolicy::new(store, &config.admission);
            let identity = caller.identity();
            let remaining = match resolve_quota(&quota, &policy)? {
                QuotaSource::Operation(operation) => policy
                    .remaining_for_operation(&operation, &identity)
                    .await
                    .with_context(|| format!("No quota configured for operation '{operation}'"))?,
                QuotaSource::AdHoc(quota) => policy.remaining(&identity, &quota).await,
            };
            println!("{remaining}");
        }
        Command::Quotas => {
            for (operation, quota) in &config.admission.quotas {
                println!("{operation}\t{}/{}s", quota.limit, quota.window_secs);
            }
        }
        Command::Cache(command) => run_cache(command, Cache::from_config(store, &config.cache)).await?,
    }
    Ok(())
}

async fn run_cache(command: CacheCommand, cache: Cache) -> anyhow::Result<()> {
    match command {
        CacheCommand::Get { key } => match cache.get_raw(&key).await {
            Some(value) => println!("{value}"),
            None => bail!("No cached value for '{key}'"),
        },
        CacheCommand::Set { key, value, ttl } => {
            if !cache.set_raw(&key, &value, ttl.map(Duration::from_secs)).await {
                bail!("Failed to cache '{key}'");
            }
        }
        CacheCommand::Delete { key } => println!("{}", cache.delete(&key).await),
        CacheCommand::Exists { key } => println!("{}", cache.exists(&key).await),
        CacheCommand::Clear { pattern } => println!("{}", cache.clear_pattern(&pattern).await),
        CacheCommand::Stats => {
            let stats = cache.stats().await.context("Store statistics unavailable")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("hit_rate: {:.2}%", stats.hit_rate() * 100.0);
        }
    }
    Ok(())
}

enum QuotaSource {
    Operation(String),
    AdHoc(Quota),
}

fn resolve_quota(args: &QuotaArgs, policy: &AdmissionPolicy) -> anyhow::Result<QuotaSource> {
    match (&args.operation, args.limit, args.window) {
        (Some(operation), _, _) => {
            if policy.quotas().get(operation).is_none() {
                bail!("No quota configured for operation '{operation}'");
            }
            Ok(QuotaSource::Operation(operation.clone()))
        }
        (None, Some(limit), Some(window)) => {
            let quota = Quota::new(limit, window);
            quota.validate().map_err(anyhow::Error::msg)?;
            Ok(QuotaSource::AdHoc(quota))
        }
        _ => bail!("Pass --operation, or both --limit and --window"),
    }
}
