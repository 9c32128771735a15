//! Storage trait definition for relgraph
//!
//! `MetadataStore` is the transactional interface the engine consumes:
//! insert-if-absent writes, indexed lookups by (artifact, version) and by
//! commit hash, ancestor reachability over the commit DAG, and a generation
//! counter bumped inside every mutating transaction.
//!
//! The trait is async and backend-agnostic. `MemoryMetadataStore` (see the
//! `memory` module) and `SurrealMetadataStore` both satisfy it.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable metadata store.
///
/// Guarantees:
/// - Every mutation is one transaction; readers never see it half-applied.
/// - Each applied mutation bumps the generation exactly once, atomically with
///   its rows. `Unchanged` outcomes leave the generation untouched.
/// - Commits, ref-movement entries and builds are never modified or deleted.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Current generation counter.
    async fn generation(&self) -> StorageResult<Generation>;

    // -- commits -------------------------------------------------------------

    /// Insert a commit if absent. All parents must already be recorded.
    async fn insert_commit(&self, commit: &CommitRecord) -> StorageResult<WriteOutcome>;

    async fn get_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Option<CommitRecord>>;

    async fn contains_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<bool> {
        Ok(self.get_commit(repository, hash).await?.is_some())
    }

    /// Whether `ancestor` is `descendant` or reachable from it via parent links.
    async fn is_ancestor(
        &self,
        repository: &RepositoryId,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> StorageResult<bool>;

    /// Commits reachable from `to` but not from `from`, newest first, at most `limit`.
    async fn commits_between(
        &self,
        repository: &RepositoryId,
        from: Option<&CommitHash>,
        to: &CommitHash,
        limit: usize,
    ) -> StorageResult<Vec<CommitRecord>>;

    // -- refs ----------------------------------------------------------------

    /// Move (or delete) a ref and append a movement log entry.
    ///
    /// A movement whose new target equals the current pointer is a no-op.
    async fn apply_ref_movement(&self, movement: &RefMovement) -> StorageResult<WriteOutcome>;

    async fn get_ref(&self, repository: &RepositoryId, name: &str)
        -> StorageResult<Option<RefRecord>>;

    async fn list_refs(&self, repository: &RepositoryId) -> StorageResult<Vec<RefRecord>>;

    /// Movement log for a ref, oldest first.
    async fn ref_history(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Vec<RefMovementRecord>>;

    // -- artifacts -----------------------------------------------------------

    async fn get_artifact(&self, id: &ArtifactId) -> StorageResult<Option<ArtifactRecord>>;

    /// Soft-deactivate an artifact. Already inactive is a no-op.
    async fn deactivate_artifact(&self, id: &ArtifactId) -> StorageResult<WriteOutcome>;

    // -- builds --------------------------------------------------------------

    /// Record a build, creating its artifact on first sight.
    ///
    /// Re-recording an identical (artifact, commit, version, channel, success,
    /// completed_at) fact returns the existing row as `Unchanged`.
    async fn record_build(&self, build: &NewBuild, policy: BuildPolicy)
        -> StorageResult<BuildWrite>;

    /// Successful build for (artifact, version).
    async fn find_build(
        &self,
        artifact: &ArtifactId,
        version: &str,
    ) -> StorageResult<Option<BuildRecord>>;

    /// All successful builds of an artifact, optionally restricted to a channel.
    async fn successful_builds(
        &self,
        artifact: &ArtifactId,
        channel: Option<&Channel>,
    ) -> StorageResult<Vec<BuildRecord>>;

    /// Builds (successful or not) produced from one commit.
    async fn builds_for_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Vec<BuildRecord>>;

    /// Page through an artifact's builds, newest completion first.
    async fn list_builds(
        &self,
        artifact: &ArtifactId,
        query: &ListBuildsQuery,
    ) -> StorageResult<BuildPage>;
}
