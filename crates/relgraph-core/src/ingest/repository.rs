//! Sequential ingestion for a single repository.

use std::sync::Arc;
use std::time::Duration;

use relgraph_state::{
    BuildPolicy, CommitHash, MetadataStore, NewBuild, RepositoryId, StorageError,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::orphans::OrphanBuffer;
use super::report::{IngestReport, OrphanReason, ReportSink};
use super::{BuildOutcome, PollOutcome, PollSummary};
use crate::error::{IngestError, VcsError};
use crate::metrics::METRICS;
use crate::obs::{self, RepositorySpan};
use crate::reader::{CommitGraphReader, CommitSource, ReaderEvent};
use crate::retry::RetryPolicy;

/// Tunables shared by every repository ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub max_commits_per_poll: usize,
    pub orphan_buffer_capacity: usize,
    pub orphan_timeout: Duration,
    pub policy: BuildPolicy,
    pub retry: RetryPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_commits_per_poll: 500,
            orphan_buffer_capacity: 1024,
            orphan_timeout: Duration::from_secs(600),
            policy: BuildPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Applies one repository's reader batches and build notifications in order.
pub struct RepositoryIngestor {
    repository: RepositoryId,
    store: Arc<dyn MetadataStore>,
    reader: CommitGraphReader,
    orphans: OrphanBuffer,
    reports: Arc<dyn ReportSink>,
    settings: IngestSettings,
    halted: Option<String>,
    /// Set once reader positions have been loaded from the store
    restored: bool,
}

impl RepositoryIngestor {
    pub fn new(
        repository: RepositoryId,
        source: Arc<dyn CommitSource>,
        store: Arc<dyn MetadataStore>,
        reports: Arc<dyn ReportSink>,
        settings: IngestSettings,
    ) -> Self {
        let reader = CommitGraphReader::new(
            repository.clone(),
            source,
            settings.max_commits_per_poll,
            settings.retry,
        );
        Self {
            orphans: OrphanBuffer::new(settings.orphan_buffer_capacity, settings.orphan_timeout),
            repository,
            store,
            reader,
            reports,
            settings,
            halted: None,
            restored: false,
        }
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    fn ensure_running(&self) -> Result<(), IngestError> {
        match &self.halted {
            Some(_) => Err(IngestError::RepositoryHalted(self.repository.to_string())),
            None => Ok(()),
        }
    }

    fn halt(&mut self, reason: String) {
        warn!(repository = %self.repository, %reason, "halting repository ingestion");
        self.halted = Some(reason);
    }

    /// Read the next batch from the source and apply it.
    ///
    /// Transient source or store failures yield [`PollOutcome::Deferred`];
    /// the batch is re-read on the next call.
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn poll(&mut self) -> Result<PollOutcome, IngestError> {
        self.ensure_running()?;
        self.sweep_orphans();
        if !self.restored {
            if let Err(e) = self.restore_positions().await {
                if e.is_unavailable() {
                    return Ok(deferred(e));
                }
                return Err(e.into());
            }
        }

        let attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt = 0;
        let batch = loop {
            attempt += 1;
            match self.reader.poll().await {
                Ok(batch) => break batch,
                Err(VcsError::CorruptHistory {
                    repository,
                    commit,
                    parent,
                }) => {
                    obs::emit_corrupt_history(&repository, &commit, &parent);
                    self.reports.report(IngestReport::CorruptHistory {
                        repository: self.repository.clone(),
                        commit: commit.clone(),
                        parent: parent.clone(),
                    });
                    self.halt(format!("commit {commit} has unresolvable parent {parent}"));
                    return Err(VcsError::CorruptHistory {
                        repository,
                        commit,
                        parent,
                    }
                    .into());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.settings.retry.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "source unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(attempts = attempt, error = %e, "poll deferred");
                    return Ok(PollOutcome::Deferred {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut summary = PollSummary {
            complete: batch.complete,
            ..PollSummary::default()
        };
        for event in &batch.events {
            match event {
                ReaderEvent::NewCommit(commit) => {
                    match self.store.insert_commit(commit).await {
                        Ok(outcome) => {
                            if outcome.is_applied() {
                                METRICS.inc_commits_ingested();
                                obs::emit_commit_ingested(
                                    self.repository.as_str(),
                                    commit.hash.as_str(),
                                    outcome.generation().0,
                                );
                            }
                            summary.commits += 1;
                        }
                        Err(e) if e.is_unavailable() => return Ok(deferred(e)),
                        Err(e) => {
                            self.reports.report(IngestReport::CommitRejected {
                                repository: self.repository.clone(),
                                commit: commit.hash.clone(),
                                reason: e.to_string(),
                            });
                            self.halt(e.to_string());
                            return Err(e.into());
                        }
                    }
                    match self.drain_orphans(&commit.hash).await {
                        Ok(drained) => summary.builds_drained += drained,
                        Err(e) => return Ok(deferred(e)),
                    }
                }
                ReaderEvent::RefUpdate(movement) => {
                    match self.store.apply_ref_movement(movement).await {
                        Ok(outcome) => {
                            if outcome.is_applied() {
                                METRICS.inc_ref_moves();
                                obs::emit_ref_moved(
                                    self.repository.as_str(),
                                    &movement.name,
                                    movement.movement.as_str(),
                                    movement.new_target.as_ref().map(CommitHash::as_str),
                                );
                            }
                            summary.ref_updates += 1;
                        }
                        Err(e) if e.is_unavailable() => return Ok(deferred(e)),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        self.reader.acknowledge(batch.cursor);
        debug!(?summary, "batch applied");
        Ok(PollOutcome::Applied(summary))
    }

    /// Resume the reader from the refs the store already records.
    async fn restore_positions(&mut self) -> Result<(), StorageError> {
        let refs = self.store.list_refs(&self.repository).await?;
        if !refs.is_empty() {
            info!(refs = refs.len(), "resuming from recorded ref positions");
        }
        self.reader.restore(refs.into_iter().map(|r| (r.name, r.target)));
        self.restored = true;
        Ok(())
    }

    /// Record a build, or buffer it until its commit is ingested.
    ///
    /// Store unavailability is returned to the caller, who should redeliver.
    #[instrument(
        skip(self, build),
        fields(
            repository = %self.repository,
            artifact = %build.artifact,
            version = %build.version,
        )
    )]
    pub async fn notify_build(&mut self, build: NewBuild) -> Result<BuildOutcome, IngestError> {
        self.ensure_running()?;
        if build.repository != self.repository {
            return Err(IngestError::InvalidNotification(format!(
                "build for repository {} delivered to {}",
                build.repository, self.repository
            )));
        }
        self.sweep_orphans();

        if !self
            .store
            .contains_commit(&self.repository, &build.commit)
            .await?
        {
            debug!(commit = %build.commit, "commit not yet ingested, buffering build");
            if let Some(evicted) = self.orphans.push(build, Instant::now()) {
                self.report_orphan(evicted.build, OrphanReason::Overflow);
            }
            return Ok(BuildOutcome::Buffered);
        }
        Ok(self.record(&build).await?)
    }

    /// Report and drop buffered builds older than the orphan timeout.
    pub fn sweep_orphans(&mut self) -> usize {
        let expired = self.orphans.expire(Instant::now());
        if expired.is_empty() {
            return 0;
        }
        let _span = RepositorySpan::enter(self.repository.as_str());
        let count = expired.len();
        for entry in expired {
            self.report_orphan(entry.build, OrphanReason::Timeout);
        }
        info!(count, "expired orphan builds");
        count
    }

    fn report_orphan(&self, build: NewBuild, reason: OrphanReason) {
        METRICS.inc_orphan_builds();
        self.reports.report(IngestReport::OrphanBuild {
            repository: self.repository.clone(),
            artifact: build.artifact,
            commit: build.commit,
            version: build.version,
            reason,
        });
    }

    /// Apply builds that were waiting on `commit`.
    ///
    /// On store unavailability the unapplied builds go back into the buffer.
    async fn drain_orphans(&mut self, commit: &CommitHash) -> Result<usize, StorageError> {
        let waiting = self.orphans.take_for_commit(commit);
        let mut applied = 0;
        let mut pending = waiting.into_iter();
        while let Some(build) = pending.next() {
            match self.record(&build).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    let now = Instant::now();
                    for build in std::iter::once(build).chain(pending) {
                        self.orphans.push(build, now);
                    }
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    /// Record a build whose commit is known. Invariant violations become
    /// `Rejected`; only store unavailability is an error.
    async fn record(&self, build: &NewBuild) -> Result<BuildOutcome, StorageError> {
        match self.store.record_build(build, self.settings.policy).await {
            Ok(write) if write.outcome.is_applied() => {
                METRICS.inc_builds_recorded();
                obs::emit_build_recorded(
                    build.artifact.as_str(),
                    &build.version,
                    build.commit.as_str(),
                    build.success,
                );
                Ok(BuildOutcome::Recorded(write.build))
            }
            Ok(write) => Ok(BuildOutcome::AlreadyRecorded(write.build)),
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                let reason = e.to_string();
                self.reports.report(IngestReport::BuildRejected {
                    repository: self.repository.clone(),
                    artifact: build.artifact.clone(),
                    commit: build.commit.clone(),
                    version: build.version.clone(),
                    reason: reason.clone(),
                });
                Ok(BuildOutcome::Rejected { reason })
            }
        }
    }
}

fn deferred(err: StorageError) -> PollOutcome {
    warn!(error = %err, "store unavailable, poll deferred");
    PollOutcome::Deferred {
        attempts: 1,
        reason: err.to_string(),
    }
}
