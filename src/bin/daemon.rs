use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::rolling::RollingFileAppender;

use playlist_bridge_sync as lib;
use lib::adapter::spotify::SpotifyAdapter;
use lib::adapter::youtube::YoutubeAdapter;
use lib::adapter::Platform;
use lib::analysis::AnalysisContext;
use lib::config::Config;
use lib::execution::ExecutionContext;
use lib::models::Service;
use lib::quota::QuotaBucket;
use lib::ratelimit::RateLimiter;

#[derive(Parser)]
#[command(name = "playlist-bridge-syncd", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "config/example-config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both the analysis and execution sweeps on their periodic timers (long-running).
    Run,
    /// Run one analysis sweep and exit.
    AnalyzeOnce,
    /// Run one execution tick and exit.
    ExecuteOnce,
    /// Print the current queue/quota status snapshot as JSON.
    Status,
    /// Validate the config file and exit.
    ConfigValidate,
    /// Store OAuth client id/secret for a service in the database.
    SetCredentials(SetCredentialsArgs),
}

#[derive(Args)]
struct SetCredentialsArgs {
    #[arg(long, value_enum)]
    service: ServiceArg,
    #[arg(long)]
    client_id: String,
    #[arg(long)]
    client_secret: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ServiceArg {
    A,
    B,
}

impl From<ServiceArg> for Service {
    fn from(s: ServiceArg) -> Service {
        match s {
            ServiceArg::A => Service::A,
            ServiceArg::B => Service::B,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_path(&cli.config)?;

    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "playlist-bridge-sync.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .init();

    match cli.command {
        Commands::ConfigValidate => {
            println!("OK");
            return Ok(());
        }
        Commands::SetCredentials(args) => {
            let conn = rusqlite::Connection::open(&cfg.db_path)?;
            lib::db::run_migrations(&conn)?;
            lib::db::save_credential_fields(&conn, args.service.into(), &args.client_id, &args.client_secret)?;
            println!("credentials saved");
            return Ok(());
        }
        Commands::Status => {
            let quota = QuotaBucket::new(cfg.daily_quota_ceiling);
            let snap = lib::status::snapshot(&cfg.db_path, &quota)?;
            println!("{}", serde_json::to_string_pretty(&snap)?);
            return Ok(());
        }
        _ => {}
    }

    {
        let conn = rusqlite::Connection::open(&cfg.db_path)?;
        lib::db::run_migrations(&conn)?;
        // Rows left `running` by a previous process that crashed or was
        // killed mid-item are safely re-selectable on the next sweep
        // (spec.md §4.6 "Concurrency safety") — reclaim them once here
        // rather than every tick, since a tick interval shorter than an
        // item's processing time would otherwise reclaim genuinely
        // in-flight work from *this* run.
        let reclaimed = lib::db::reclaim_orphaned_running(&conn, chrono::Utc::now().timestamp())?;
        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, "reclaimed work items orphaned in 'running' state by a prior process");
        }
    }

    let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
    let tokens = lib::tokens::TokenStore::new(cfg.db_path.clone(), http.clone(), cfg.token_refresh_margin_secs);

    let (platform_a, platform_b) = build_platforms(&cfg, http, tokens)?;

    match cli.command {
        Commands::AnalyzeOnce => {
            let ctx = AnalysisContext { db_path: cfg.db_path.clone(), platform_a, platform_b };
            lib::analysis::run_sweep(&ctx).await?;
        }
        Commands::ExecuteOnce => {
            let ctx = Arc::new(build_execution_context(&cfg, platform_a, platform_b));
            lib::execution::run_tick(ctx).await?;
        }
        Commands::Run => {
            let analysis_ctx = Arc::new(AnalysisContext {
                db_path: cfg.db_path.clone(),
                platform_a: platform_a.clone(),
                platform_b: platform_b.clone(),
            });
            let execution_ctx = Arc::new(build_execution_context(&cfg, platform_a, platform_b));
            let shutdown = lib::scheduler::ctrl_c_shutdown();
            lib::scheduler::run(
                analysis_ctx,
                execution_ctx,
                Duration::from_secs(cfg.analysis_period_secs),
                Duration::from_secs(cfg.execution_period_secs),
                shutdown,
            )
            .await;
        }
        Commands::ConfigValidate | Commands::Status | Commands::SetCredentials(_) => unreachable!(),
    }

    Ok(())
}

fn build_platforms(
    cfg: &Config,
    http: reqwest::Client,
    tokens: Arc<lib::tokens::TokenStore>,
) -> anyhow::Result<(Arc<dyn Platform>, Arc<dyn Platform>)> {
    let conn = rusqlite::Connection::open(&cfg.db_path)?;
    let (a_id, a_secret) = lib::credentials::resolve(&conn, Service::A)?;
    let (b_id, b_secret) = lib::credentials::resolve(&conn, Service::B)?;
    let platform_a: Arc<dyn Platform> = Arc::new(SpotifyAdapter::new(http.clone(), a_id, a_secret, tokens.clone()));
    let platform_b: Arc<dyn Platform> = Arc::new(YoutubeAdapter::new(http, b_id, b_secret, tokens));
    Ok((platform_a, platform_b))
}

fn build_execution_context(cfg: &Config, platform_a: Arc<dyn Platform>, platform_b: Arc<dyn Platform>) -> ExecutionContext {
    ExecutionContext {
        db_path: cfg.db_path.clone(),
        platform_a,
        platform_b,
        quota_b: Arc::new(QuotaBucket::new(cfg.daily_quota_ceiling)),
        rate_limit_a: Arc::new(RateLimiter::new(cfg.platform_a_rate_limit_per_sec)),
        batch_size: cfg.execution_batch_size,
        concurrency: cfg.execution_concurrency,
        quota_cost_add_track: cfg.quota_cost_add_track,
        quota_cost_rename: cfg.quota_cost_rename,
    }
}
