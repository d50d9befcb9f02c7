use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use serp_wayback_archiver::candidates::load_candidates;
use serp_wayback_archiver::config::Config;
use serp_wayback_archiver::scheduler::BatchScheduler;
use serp_wayback_archiver::store::StateStore;
use serp_wayback_archiver::wayback::WaybackClient;

/// Archive SERP URLs into the Wayback Machine and record their snapshot URLs.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// CSV of `url,kind` rows (kind is `query` or `link`)
    #[arg(short = 'i', long, env = "INPUT_PATH")]
    input: PathBuf,

    /// Completed table (`timestamp,url,archive_url`), appended to as URLs resolve
    #[arg(short = 'o', long, env = "COMPLETED_PATH")]
    completed: PathBuf,

    /// Job-id table (`url,job_id`), kept across runs
    #[arg(short = 'j', long, env = "JOB_IDS_PATH", default_value = "./data/job_ids.csv")]
    job_ids: PathBuf,
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // No subscriber yet, so this one goes straight to stderr.
    if let Err(e) = init_tracing() {
        eprintln!("Fatal error: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    info!("Starting serp-wayback-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if config.wayback_access_key.is_none() {
        warn!("No WAYBACK_ACCESS_KEY configured - Save Page Now will likely reject requests");
    }
    info!(
        endpoint = %config.wayback_endpoint,
        chunk_size = config.chunk_size,
        freshness_hours = config.freshness_window.as_secs() / 3600,
        "Configuration loaded"
    );

    for path in [&args.completed, &args.job_ids] {
        ensure_parent_dir(path).await?;
    }

    // An unreadable store must stop the run: treating it as empty would
    // resubmit every URL.
    let store = StateStore::open(
        &args.job_ids,
        &args.completed,
        config.freshness_window,
        Utc::now(),
    )
    .context("Failed to load persisted state")?;

    let candidates = load_candidates(&args.input)?;
    info!(count = candidates.len(), input = %args.input.display(), "Loaded candidate URLs");

    let client = WaybackClient::new(&config).context("Failed to initialize Wayback client")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down after in-flight requests...");
        signal_token.cancel();
    });

    let scheduler = BatchScheduler::new(config, Arc::new(client), Arc::new(store), shutdown);
    let summary = scheduler.run(&candidates).await?;

    if summary.interrupted > 0 {
        warn!(
            interrupted = summary.interrupted,
            "Run stopped early; known job ids will be reused next time"
        );
    }
    info!("Shutdown complete");

    Ok(())
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,serp_wayback_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
