//! relgraphd - ingestion daemon
//!
//! Polls every configured repository on a fixed interval, expires orphan
//! builds and, with `--stdin-notifications`, applies build-completion
//! notifications read as JSON lines from standard input.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relgraph_core::ingest::TracingReportSink;
use relgraph_core::metrics::METRICS;
use relgraph_core::{
    open_store, telemetry, BuildNotification, BuildOutcome, EngineConfig, GitCliSource,
    IngestError, IngestionCoordinator, LogFormat, PollOutcome,
};
use relgraph_state::RepositoryId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "relgraphd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "relgraph ingestion daemon", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "RELGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Log level, overriding the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Read build notifications as JSON lines from stdin
    #[arg(long)]
    stdin_notifications: bool,

    /// Poll every repository once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    telemetry::init_from_config(&config.log);

    let coordinator = Arc::new(start(&config).await?);
    info!(
        repositories = config.repositories.len(),
        poll_interval_secs = config.ingest.poll_interval_secs,
        version = relgraph_core::VERSION,
        "relgraphd started"
    );

    if args.once {
        poll_once(&coordinator).await;
        coordinator.shutdown().await;
        return Ok(());
    }

    if args.stdin_notifications {
        let reader = BufReader::new(tokio::io::stdin());
        tokio::spawn(read_notifications(coordinator.clone(), reader));
    }

    let mut ticker = interval(config.ingest.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => poll_once(&coordinator).await,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    coordinator.shutdown().await;
    METRICS.flush();
    Ok(())
}

/// Config file (or defaults), then `RELGRAPH_*` variables, then flags.
fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid RELGRAPH_* environment override")?;
    if args.json {
        config.log.format = LogFormat::Json;
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

/// Open the store and register one git-backed worker per repository.
async fn start(config: &EngineConfig) -> Result<IngestionCoordinator> {
    let store = open_store(&config.store)
        .await
        .context("Failed to open metadata store")?;
    let coordinator =
        IngestionCoordinator::new(store, Arc::new(TracingReportSink), config.ingest.settings());
    for repo in &config.repositories {
        let source = GitCliSource::new(repo.id.clone(), repo.path.clone());
        coordinator
            .register(RepositoryId::new(repo.id.clone()), Arc::new(source))
            .await;
        info!(repository = %repo.id, path = %repo.path.display(), "repository registered");
    }
    Ok(coordinator)
}

async fn poll_once(coordinator: &IngestionCoordinator) {
    for (repository, result) in coordinator.poll_all().await {
        match result {
            Ok(PollOutcome::Applied(summary)) => debug!(
                %repository,
                commits = summary.commits,
                ref_updates = summary.ref_updates,
                builds_drained = summary.builds_drained,
                complete = summary.complete,
                "poll applied"
            ),
            Ok(PollOutcome::Deferred { attempts, reason }) => {
                warn!(%repository, attempts, %reason, "poll deferred")
            }
            Err(IngestError::RepositoryHalted(_)) => {
                debug!(%repository, "repository halted; skipping")
            }
            Err(e) => error!(%repository, error = %e, "poll failed"),
        }
    }
    let expired = coordinator.sweep_orphans().await;
    if expired > 0 {
        info!(expired, "orphan builds expired");
    }
    METRICS.flush();
}

async fn read_notifications<R>(coordinator: Arc<IngestionCoordinator>, reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read notification input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match handle_notification(&coordinator, &line).await {
            Ok(BuildOutcome::Recorded(build)) => {
                info!(artifact = %build.artifact, version = %build.version, "build recorded")
            }
            Ok(BuildOutcome::AlreadyRecorded(build)) => {
                debug!(
                    artifact = %build.artifact,
                    version = %build.version,
                    "build already recorded"
                )
            }
            Ok(BuildOutcome::Buffered) => debug!("build buffered until its commit is ingested"),
            Ok(BuildOutcome::Rejected { reason }) => warn!(%reason, "build rejected"),
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "notification not applied")
            }
        }
    }
    info!("notification input closed");
}

async fn handle_notification(
    coordinator: &IngestionCoordinator,
    line: &str,
) -> Result<BuildOutcome> {
    let notification: BuildNotification =
        serde_json::from_str(line).context("Malformed build notification")?;
    Ok(coordinator.notify_build_completed(notification).await?)
}
