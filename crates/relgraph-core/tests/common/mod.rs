//! Shared fixtures for relgraph-core integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use relgraph_core::reader::{MemoryCommitSource, SourceCommit};
use relgraph_core::BuildNotification;
use relgraph_state::*;

pub fn hash(n: u32) -> CommitHash {
    CommitHash::parse(&format!("{n:040x}")).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn source_commit(n: u32, parents: &[u32]) -> SourceCommit {
    SourceCommit {
        hash: hash(n),
        parents: parents.iter().map(|p| hash(*p)).collect(),
        author: "dev".into(),
        authored_at: at(n as i64),
        summary: format!("commit {n}"),
    }
}

/// Linear chain `1 <- 2 <- ... <- n`.
pub fn chain(source: &MemoryCommitSource, n: u32) {
    source.add_commit(source_commit(1, &[]));
    for i in 2..=n {
        source.add_commit(source_commit(i, &[i - 1]));
    }
}

pub fn record(repository: &str, n: u32, parents: &[u32]) -> CommitRecord {
    CommitRecord {
        repository: RepositoryId::new(repository),
        hash: hash(n),
        parents: parents.iter().map(|p| hash(*p)).collect(),
        author: "dev".into(),
        authored_at: at(n as i64),
        summary: format!("commit {n}"),
    }
}

pub fn notification(repository: &str, commit: u32, version: &str) -> BuildNotification {
    BuildNotification {
        repository: repository.into(),
        artifact: "org:widget".into(),
        display_name: None,
        commit: hash(commit).to_string(),
        version: version.into(),
        channel: Some("stable".into()),
        success: true,
        completed_at: at(100 + commit as i64),
    }
}

pub fn new_build(repository: &str, commit: u32, version: &str, minute: i64) -> NewBuild {
    NewBuild {
        artifact: ArtifactId::parse("org:widget").unwrap(),
        display_name: None,
        repository: RepositoryId::new(repository),
        commit: hash(commit),
        version: version.into(),
        channel: Channel::stable(),
        success: true,
        completed_at: at(minute),
    }
}

pub fn ref_move(
    repository: &str,
    name: &str,
    old: Option<u32>,
    new: Option<u32>,
    movement: RefMovementKind,
) -> RefMovement {
    RefMovement {
        repository: RepositoryId::new(repository),
        name: name.into(),
        kind: RefKind::of(name),
        old_target: old.map(hash),
        new_target: new.map(hash),
        movement,
    }
}

/// Wraps the in-memory store with switchable faults.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryMetadataStore,
    /// Fail every write with a backend error
    pub fail_writes: AtomicBool,
    /// Report a different generation on every read
    pub churn: AtomicBool,
    churn_counter: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn generation(&self) -> StorageResult<Generation> {
        if self.churn.load(Ordering::SeqCst) {
            return Ok(Generation(
                1_000 + self.churn_counter.fetch_add(1, Ordering::SeqCst),
            ));
        }
        self.inner.generation().await
    }

    async fn insert_commit(&self, commit: &CommitRecord) -> StorageResult<WriteOutcome> {
        self.check_write()?;
        self.inner.insert_commit(commit).await
    }

    async fn get_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Option<CommitRecord>> {
        self.inner.get_commit(repository, hash).await
    }

    async fn is_ancestor(
        &self,
        repository: &RepositoryId,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> StorageResult<bool> {
        self.inner.is_ancestor(repository, ancestor, descendant).await
    }

    async fn commits_between(
        &self,
        repository: &RepositoryId,
        from: Option<&CommitHash>,
        to: &CommitHash,
        limit: usize,
    ) -> StorageResult<Vec<CommitRecord>> {
        self.inner.commits_between(repository, from, to, limit).await
    }

    async fn apply_ref_movement(&self, movement: &RefMovement) -> StorageResult<WriteOutcome> {
        self.check_write()?;
        self.inner.apply_ref_movement(movement).await
    }

    async fn get_ref(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Option<RefRecord>> {
        self.inner.get_ref(repository, name).await
    }

    async fn list_refs(&self, repository: &RepositoryId) -> StorageResult<Vec<RefRecord>> {
        self.inner.list_refs(repository).await
    }

    async fn ref_history(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Vec<RefMovementRecord>> {
        self.inner.ref_history(repository, name).await
    }

    async fn get_artifact(&self, id: &ArtifactId) -> StorageResult<Option<ArtifactRecord>> {
        self.inner.get_artifact(id).await
    }

    async fn deactivate_artifact(&self, id: &ArtifactId) -> StorageResult<WriteOutcome> {
        self.check_write()?;
        self.inner.deactivate_artifact(id).await
    }

    async fn record_build(
        &self,
        build: &NewBuild,
        policy: BuildPolicy,
    ) -> StorageResult<BuildWrite> {
        self.check_write()?;
        self.inner.record_build(build, policy).await
    }

    async fn find_build(
        &self,
        artifact: &ArtifactId,
        version: &str,
    ) -> StorageResult<Option<BuildRecord>> {
        self.inner.find_build(artifact, version).await
    }

    async fn successful_builds(
        &self,
        artifact: &ArtifactId,
        channel: Option<&Channel>,
    ) -> StorageResult<Vec<BuildRecord>> {
        self.inner.successful_builds(artifact, channel).await
    }

    async fn builds_for_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Vec<BuildRecord>> {
        self.inner.builds_for_commit(repository, hash).await
    }

    async fn list_builds(
        &self,
        artifact: &ArtifactId,
        query: &ListBuildsQuery,
    ) -> StorageResult<BuildPage> {
        self.inner.list_builds(artifact, query).await
    }
}
