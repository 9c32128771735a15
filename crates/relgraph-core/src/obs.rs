//! Structured observability hooks for ingestion and resolution.
//!
//! Lifecycle events are emitted as `tracing` events with an `event` field so
//! they can be filtered out of JSON logs. [`RepositorySpan`] tags everything
//! logged while a repository is being ingested.

use tracing::{info, warn};

/// RAII guard that enters a repository-scoped span.
pub struct RepositorySpan {
    _span: tracing::span::EnteredSpan,
}

impl RepositorySpan {
    pub fn enter(repository: &str) -> Self {
        let span = tracing::info_span!("relgraph.repository", repository = %repository);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_commit_ingested(repository: &str, commit: &str, generation: u64) {
    info!(
        event = "commit.ingested",
        repository = %repository,
        commit = %commit,
        generation = generation,
    );
}

pub fn emit_ref_moved(repository: &str, name: &str, movement: &str, target: Option<&str>) {
    info!(
        event = "ref.moved",
        repository = %repository,
        ref_name = %name,
        movement = %movement,
        target = target.unwrap_or("-"),
    );
}

pub fn emit_build_recorded(artifact: &str, version: &str, commit: &str, success: bool) {
    info!(
        event = "build.recorded",
        artifact = %artifact,
        version = %version,
        commit = %commit,
        success = success,
    );
}

/// Emit a data-quality warning: a build whose commit never arrived.
pub fn emit_orphan_build(
    repository: &str,
    artifact: &str,
    version: &str,
    commit: &str,
    reason: &str,
) {
    warn!(
        event = "build.orphaned",
        repository = %repository,
        artifact = %artifact,
        version = %version,
        commit = %commit,
        reason = %reason,
    );
}

pub fn emit_corrupt_history(repository: &str, commit: &str, parent: &str) {
    tracing::error!(
        event = "repository.corrupt_history",
        repository = %repository,
        commit = %commit,
        parent = %parent,
    );
}

pub fn emit_rejected(repository: &str, subject: &str, reason: &dyn std::fmt::Display) {
    warn!(
        event = "ingest.rejected",
        repository = %repository,
        subject = %subject,
        reason = %reason,
    );
}

pub fn emit_resolution(artifact: &str, request: &str, version: Option<&str>, cached: bool) {
    info!(
        event = "version.resolved",
        artifact = %artifact,
        request = %request,
        version = version.unwrap_or("-"),
        cached = cached,
    );
}
