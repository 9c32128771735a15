//! One tokio task per repository, fed through an mpsc command channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use relgraph_state::{MetadataStore, NewBuild, RepositoryId};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::report::ReportSink;
use super::repository::{IngestSettings, RepositoryIngestor};
use super::{BuildNotification, BuildOutcome, PollOutcome};
use crate::error::IngestError;
use crate::reader::CommitSource;

const COMMAND_BUFFER: usize = 64;

enum Command {
    Poll(oneshot::Sender<Result<PollOutcome, IngestError>>),
    BuildCompleted(NewBuild, oneshot::Sender<Result<BuildOutcome, IngestError>>),
    SweepOrphans(oneshot::Sender<usize>),
    Shutdown,
}

struct Worker {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Routes ingestion work to per-repository workers.
pub struct IngestionCoordinator {
    store: Arc<dyn MetadataStore>,
    reports: Arc<dyn ReportSink>,
    settings: IngestSettings,
    workers: RwLock<HashMap<RepositoryId, Worker>>,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        reports: Arc<dyn ReportSink>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            reports,
            settings,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Start a worker for `repository`. Re-registering replaces the worker
    /// and its reader state.
    #[instrument(skip(self, source))]
    pub async fn register(&self, repository: RepositoryId, source: Arc<dyn CommitSource>) {
        let ingestor = RepositoryIngestor::new(
            repository.clone(),
            source,
            self.store.clone(),
            self.reports.clone(),
            self.settings.clone(),
        );
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = tokio::spawn(run_worker(ingestor, rx));
        let previous = self
            .workers
            .write()
            .await
            .insert(repository.clone(), Worker { tx, handle });
        if let Some(old) = previous {
            warn!(%repository, "replacing existing ingestion worker");
            let _ = old.tx.send(Command::Shutdown).await;
        }
        info!(%repository, "registered repository");
    }

    pub async fn repositories(&self) -> Vec<RepositoryId> {
        let mut ids: Vec<_> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn send<T>(
        &self,
        repository: &RepositoryId,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, IngestError> {
        let tx = self
            .workers
            .read()
            .await
            .get(repository)
            .map(|w| w.tx.clone())
            .ok_or_else(|| IngestError::UnknownRepository(repository.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let stopped = || IngestError::WorkerStopped(repository.to_string());
        tx.send(make(reply_tx)).await.map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }

    /// Poll one repository's source and apply the resulting batch.
    pub async fn poll_repository(
        &self,
        repository: &RepositoryId,
    ) -> Result<PollOutcome, IngestError> {
        self.send(repository, Command::Poll).await?
    }

    /// Poll every registered repository concurrently.
    pub async fn poll_all(&self) -> Vec<(RepositoryId, Result<PollOutcome, IngestError>)> {
        let repositories = self.repositories().await;
        let polls = repositories.iter().map(|r| self.poll_repository(r));
        let results = join_all(polls).await;
        repositories.into_iter().zip(results).collect()
    }

    /// Validate a notification and hand it to its repository's worker.
    pub async fn notify_build_completed(
        &self,
        notification: BuildNotification,
    ) -> Result<BuildOutcome, IngestError> {
        let build = notification.to_new_build()?;
        let repository = build.repository.clone();
        self.send(&repository, |reply| Command::BuildCompleted(build, reply))
            .await?
    }

    /// Expire old orphan builds in every repository; returns how many.
    pub async fn sweep_orphans(&self) -> usize {
        let repositories = self.repositories().await;
        let sweeps = repositories
            .iter()
            .map(|r| self.send(r, Command::SweepOrphans));
        join_all(sweeps)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .sum()
    }

    /// Stop all workers, waiting for in-flight commands to finish.
    pub async fn shutdown(&self) {
        let workers: Vec<(RepositoryId, Worker)> = self.workers.write().await.drain().collect();
        for (repository, worker) in workers {
            let _ = worker.tx.send(Command::Shutdown).await;
            if let Err(e) = worker.handle.await {
                warn!(%repository, error = %e, "ingestion worker panicked");
            }
        }
        info!("ingestion coordinator stopped");
    }
}

async fn run_worker(mut ingestor: RepositoryIngestor, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Poll(reply) => {
                let _ = reply.send(ingestor.poll().await);
            }
            Command::BuildCompleted(build, reply) => {
                let _ = reply.send(ingestor.notify_build(build).await);
            }
            Command::SweepOrphans(reply) => {
                let _ = reply.send(ingestor.sweep_orphans());
            }
            Command::Shutdown => break,
        }
    }
    debug!(repository = %ingestor.repository(), "ingestion worker exiting");
}
