//! relgraph - command-line access to the resolution engine
//!
//! ## Commands
//!
//! - `resolve`: resolve a version expression to a build
//! - `list`: page through an artifact's builds
//! - `changelog`: commits that went into a version
//! - `refs` / `history`: current refs and a ref's movement log
//! - `builds`: builds produced from one commit
//! - `poll`: ingest new history from the configured repositories
//! - `notify-build`: record a build-completion notification
//!
//! The store comes from the `[store]` section of the config file (or
//! `RELGRAPH_STORE`). The default in-memory store does not outlive the
//! process, so persistent use needs `surreal_kv` or a SurrealDB endpoint.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use relgraph_core::ingest::TracingReportSink;
use relgraph_core::{
    open_store, telemetry, BuildNotification, BuildOutcome, Engine, EngineConfig, GitCliSource,
    IngestionCoordinator, LogFormat, PageRequest, PollOutcome, ResolveOutcome,
};
use relgraph_state::{BuildRecord, CommitRecord, MetadataStore, RepositoryId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn, Level};

#[derive(Parser)]
#[command(name = "relgraph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-metadata resolution engine", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true, env = "RELGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a version expression (`1.2.3`, `>=1.0 <2.0`, `latest`,
    /// `latest-on-main`, `latest-stable`)
    Resolve {
        /// Artifact id, e.g. `org.example:app`
        artifact: String,
        /// Version expression
        expression: String,
    },

    /// List an artifact's builds, newest first
    List {
        artifact: String,

        /// Continue after a cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Include failed builds
        #[arg(long)]
        include_failed: bool,

        /// Only builds published on this channel
        #[arg(long)]
        channel: Option<String>,
    },

    /// Show the commits between a version and the previous one
    Changelog {
        artifact: String,
        version: String,

        /// Maximum number of commits to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show current refs of a repository
    Refs { repository: String },

    /// Show the movement log of a ref
    History {
        repository: String,
        /// Ref name (`main`, `v1.0.0` or a full `refs/...` name)
        name: String,
    },

    /// Show builds produced from a commit
    Builds { repository: String, commit: String },

    /// Deactivate an artifact so new builds of it are rejected
    Deactivate { artifact: String },

    /// Ingest new commits and ref movements
    Poll {
        /// Only this configured repository
        repository: Option<String>,

        /// Maximum poll batches per repository
        #[arg(long, default_value = "100")]
        max_batches: usize,
    },

    /// Record a completed build
    NotifyBuild {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        artifact: String,
        #[arg(long)]
        commit: String,
        #[arg(long)]
        version: String,
        /// Promotion channel (default: snapshot)
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        /// The build failed
        #[arg(long)]
        failed: bool,
        /// RFC 3339 completion time (default: now)
        #[arg(long)]
        completed_at: Option<DateTime<Utc>>,
        /// Maximum poll batches when catching up history first
        #[arg(long, default_value = "100")]
        max_batches: usize,
    },
}

/// Command result rendered either as text or JSON.
#[derive(Debug)]
struct Report {
    json: Value,
    text: String,
    success: bool,
}

impl Report {
    fn ok(json: Value, text: String) -> Self {
        Self {
            json,
            text,
            success: true,
        }
    }

    fn miss(json: Value, text: String) -> Self {
        Self {
            json,
            text,
            success: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    telemetry::init_tracing(config.log.format == LogFormat::Json, level);

    let store = open_store(&config.store)
        .await
        .context("Failed to open metadata store")?;
    let engine = Engine::from_config(store.clone(), &config.query);

    let report = match cli.command {
        Commands::Resolve {
            artifact,
            expression,
        } => cmd_resolve(&engine, &artifact, &expression).await?,
        Commands::List {
            artifact,
            cursor,
            limit,
            include_failed,
            channel,
        } => {
            let page = PageRequest {
                cursor,
                limit,
                include_failed,
                channel,
            };
            cmd_list(&engine, &artifact, &page).await?
        }
        Commands::Changelog {
            artifact,
            version,
            limit,
        } => cmd_changelog(&engine, &artifact, &version, limit).await?,
        Commands::Refs { repository } => cmd_refs(&engine, &repository).await?,
        Commands::History { repository, name } => {
            cmd_history(&engine, &repository, &name).await?
        }
        Commands::Builds { repository, commit } => {
            cmd_builds(&engine, &repository, &commit).await?
        }
        Commands::Deactivate { artifact } => cmd_deactivate(&engine, &artifact).await?,
        Commands::Poll {
            repository,
            max_batches,
        } => {
            let coordinator = coordinator(&config, store, repository.as_deref()).await?;
            let report = cmd_poll(&coordinator, max_batches).await?;
            coordinator.shutdown().await;
            report
        }
        Commands::NotifyBuild {
            repository,
            artifact,
            commit,
            version,
            channel,
            display_name,
            failed,
            completed_at,
            max_batches,
        } => {
            let coordinator = coordinator(&config, store, Some(&repository)).await?;
            let notification = BuildNotification {
                repository,
                artifact,
                display_name,
                commit,
                version,
                channel,
                success: !failed,
                completed_at: completed_at.unwrap_or_else(Utc::now),
            };
            let report = cmd_notify_build(&coordinator, notification, max_batches).await?;
            coordinator.shutdown().await;
            report
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report.json)?);
    } else {
        println!("{}", report.text);
    }
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid RELGRAPH_* environment override")?;
    Ok(config)
}

/// Coordinator with git workers for the configured repositories, or only
/// for `only` when given.
async fn coordinator(
    config: &EngineConfig,
    store: Arc<dyn MetadataStore>,
    only: Option<&str>,
) -> Result<IngestionCoordinator> {
    let coordinator =
        IngestionCoordinator::new(store, Arc::new(TracingReportSink), config.ingest.settings());
    let selected: Vec<_> = config
        .repositories
        .iter()
        .filter(|r| only.map_or(true, |id| r.id == id))
        .collect();
    if let Some(id) = only {
        if selected.is_empty() {
            bail!("Repository {id:?} is not configured");
        }
    }
    for repo in selected {
        let source = GitCliSource::new(repo.id.clone(), repo.path.clone());
        coordinator
            .register(RepositoryId::new(repo.id.clone()), Arc::new(source))
            .await;
    }
    Ok(coordinator)
}

fn build_line(build: &BuildRecord) -> String {
    format!(
        "{}  {}  {}  {}  {}",
        build.version,
        build.channel,
        build.commit.short(),
        build.completed_at.to_rfc3339(),
        if build.success { "ok" } else { "failed" }
    )
}

fn commit_line(commit: &CommitRecord) -> String {
    format!("{}  {}  {}", commit.hash.short(), commit.author, commit.summary)
}

fn lines_or(lines: Vec<String>, empty: &str) -> String {
    if lines.is_empty() {
        empty.to_string()
    } else {
        lines.join("\n")
    }
}

async fn cmd_resolve(engine: &Engine, artifact: &str, expression: &str) -> Result<Report> {
    let outcome = engine
        .resolve_version(artifact, expression)
        .await
        .with_context(|| format!("Failed to resolve {expression:?} for {artifact}"))?;
    Ok(match outcome {
        ResolveOutcome::Found(resolution) => {
            let mut text = build_line(&resolution.build);
            if resolution.approximate {
                text.push_str("  (approximate ordering)");
            }
            Report::ok(serde_json::to_value(&resolution)?, text)
        }
        ResolveOutcome::NotFound => Report::miss(
            Value::Null,
            format!("No build of {artifact} matches {expression:?}"),
        ),
    })
}

#[derive(Serialize)]
struct PageView<'a> {
    builds: &'a [BuildRecord],
    next_cursor: Option<String>,
}

async fn cmd_list(engine: &Engine, artifact: &str, page: &PageRequest) -> Result<Report> {
    let page = engine
        .list_builds(artifact, page)
        .await
        .with_context(|| format!("Failed to list builds of {artifact}"))?;
    let next_cursor = page.next_cursor.map(|c| c.to_string());
    let mut lines: Vec<String> = page.builds.iter().map(build_line).collect();
    if let Some(cursor) = &next_cursor {
        lines.push(format!("next: --cursor {cursor}"));
    }
    let view = PageView {
        builds: &page.builds,
        next_cursor,
    };
    Ok(Report::ok(
        serde_json::to_value(&view)?,
        lines_or(lines, "No builds"),
    ))
}

async fn cmd_changelog(
    engine: &Engine,
    artifact: &str,
    version: &str,
    limit: usize,
) -> Result<Report> {
    let Some(log) = engine
        .changelog(artifact, version, limit)
        .await
        .with_context(|| format!("Failed to compute changelog of {artifact} {version}"))?
    else {
        return Ok(Report::miss(
            Value::Null,
            format!("No build of {artifact} has version {version:?}"),
        ));
    };

    let mut lines = vec![match &log.base_version {
        Some(base) => format!("{} {} (since {base})", log.artifact, log.version),
        None => format!("{} {} (first version)", log.artifact, log.version),
    }];
    lines.extend(log.commits.iter().map(commit_line));
    if log.truncated {
        lines.push(format!("... more than {limit} commits"));
    }
    Ok(Report::ok(serde_json::to_value(&log)?, lines.join("\n")))
}

async fn cmd_refs(engine: &Engine, repository: &str) -> Result<Report> {
    let refs = engine
        .refs(repository)
        .await
        .with_context(|| format!("Failed to list refs of {repository}"))?;
    let lines = refs
        .iter()
        .map(|r| format!("{}  {}  {}", r.target.short(), r.kind.as_str(), r.name))
        .collect();
    Ok(Report::ok(
        serde_json::to_value(&refs)?,
        lines_or(lines, "No refs"),
    ))
}

async fn cmd_history(engine: &Engine, repository: &str, name: &str) -> Result<Report> {
    let history = engine
        .ref_history(repository, name)
        .await
        .with_context(|| format!("Failed to read history of {name} in {repository}"))?;
    let lines = history
        .iter()
        .map(|m| {
            let old = m.old_target.as_ref().map_or("-", |h| h.short());
            let new = m.new_target.as_ref().map_or("-", |h| h.short());
            format!(
                "{}  {:<12}  {old} -> {new}  {}",
                m.seq,
                m.movement.as_str(),
                m.recorded_at.to_rfc3339()
            )
        })
        .collect();
    Ok(Report::ok(
        serde_json::to_value(&history)?,
        lines_or(lines, &format!("No movements recorded for {name}")),
    ))
}

async fn cmd_builds(engine: &Engine, repository: &str, commit: &str) -> Result<Report> {
    let builds = engine
        .builds_for_commit(repository, commit)
        .await
        .with_context(|| format!("Failed to list builds of {commit}"))?;
    let lines = builds
        .iter()
        .map(|b| format!("{}  {}", b.artifact, build_line(b)))
        .collect();
    Ok(Report::ok(
        serde_json::to_value(&builds)?,
        lines_or(lines, "No builds"),
    ))
}

#[derive(Debug, Default, Serialize)]
struct RepositoryPoll {
    repository: String,
    batches: usize,
    commits: usize,
    ref_updates: usize,
    builds_drained: usize,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deferred: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RepositoryPoll {
    fn succeeded(&self) -> bool {
        self.deferred.is_none() && self.error.is_none()
    }

    fn line(&self) -> String {
        let status = match (&self.error, &self.deferred) {
            (Some(e), _) => format!("error: {e}"),
            (None, Some(reason)) => format!("deferred: {reason}"),
            (None, None) if self.complete => "up to date".to_string(),
            (None, None) => "more history pending".to_string(),
        };
        format!(
            "{}  {} commits, {} ref updates, {} builds  ({status})",
            self.repository, self.commits, self.ref_updates, self.builds_drained
        )
    }
}

/// Poll one repository until its history is caught up or `max_batches` runs out.
async fn sync_repository(
    coordinator: &IngestionCoordinator,
    repository: &RepositoryId,
    max_batches: usize,
) -> RepositoryPoll {
    let mut poll = RepositoryPoll {
        repository: repository.to_string(),
        ..RepositoryPoll::default()
    };
    while poll.batches < max_batches.max(1) {
        poll.batches += 1;
        match coordinator.poll_repository(repository).await {
            Ok(PollOutcome::Applied(summary)) => {
                poll.commits += summary.commits;
                poll.ref_updates += summary.ref_updates;
                poll.builds_drained += summary.builds_drained;
                poll.complete = summary.complete;
                if summary.complete {
                    break;
                }
            }
            Ok(PollOutcome::Deferred { reason, .. }) => {
                poll.deferred = Some(reason);
                break;
            }
            Err(e) => {
                poll.error = Some(e.to_string());
                break;
            }
        }
    }
    debug!(repository = %poll.repository, batches = poll.batches, "sync finished");
    poll
}

async fn cmd_poll(coordinator: &IngestionCoordinator, max_batches: usize) -> Result<Report> {
    let mut polls = Vec::new();
    for repository in coordinator.repositories().await {
        polls.push(sync_repository(coordinator, &repository, max_batches).await);
    }
    let success = polls.iter().all(RepositoryPoll::succeeded);
    let lines = polls.iter().map(RepositoryPoll::line).collect();
    let report = Report {
        json: serde_json::to_value(&polls)?,
        text: lines_or(lines, "No repositories configured"),
        success,
    };
    Ok(report)
}

async fn cmd_deactivate(engine: &Engine, artifact: &str) -> Result<Report> {
    let outcome = engine
        .deactivate_artifact(artifact)
        .await
        .with_context(|| format!("Failed to deactivate {artifact}"))?;
    let (status, text) = if outcome.is_applied() {
        ("deactivated", format!("Deactivated {artifact}"))
    } else {
        ("already_inactive", format!("{artifact} is already inactive"))
    };
    Ok(Report::ok(
        serde_json::json!({
            "outcome": status,
            "generation": outcome.generation(),
        }),
        text,
    ))
}

/// Catch up the repository's history, then apply the notification.
async fn cmd_notify_build(
    coordinator: &IngestionCoordinator,
    notification: BuildNotification,
    max_batches: usize,
) -> Result<Report> {
    let repository = RepositoryId::new(notification.repository.trim());
    let sync = sync_repository(coordinator, &repository, max_batches).await;
    if !sync.succeeded() {
        warn!(repository = %repository, status = %sync.line(), "history not fully ingested");
    }

    let outcome = coordinator
        .notify_build_completed(notification)
        .await
        .context("Failed to record build")?;
    Ok(match outcome {
        BuildOutcome::Recorded(build) => Report::ok(
            serde_json::json!({ "outcome": "recorded", "build": serde_json::to_value(&build)? }),
            format!("Recorded {}", build_line(&build)),
        ),
        BuildOutcome::AlreadyRecorded(build) => Report::ok(
            serde_json::json!({
                "outcome": "already_recorded",
                "build": serde_json::to_value(&build)?,
            }),
            format!("Already recorded {}", build_line(&build)),
        ),
        BuildOutcome::Buffered => Report::miss(
            serde_json::json!({ "outcome": "unknown_commit" }),
            "Commit is not in the ingested history; build not recorded".to_string(),
        ),
        BuildOutcome::Rejected { reason } => Report::miss(
            serde_json::json!({ "outcome": "rejected", "reason": reason }),
            format!("Rejected: {reason}"),
        ),
    })
}
