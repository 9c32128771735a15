//! In-memory `MetadataStore`
//!
//! Backs the `memory` store backend and every contract test. All state lives
//! behind one `RwLock`: a mutation is a single write-lock critical section,
//! which gives the same all-or-nothing visibility as a database transaction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::{MetadataStore, StorageResult};

type CommitKey = (RepositoryId, CommitHash);
type RefKey = (RepositoryId, String);

#[derive(Debug, Default)]
struct MemoryState {
    generation: Generation,
    artifacts: HashMap<ArtifactId, ArtifactRecord>,
    commits: HashMap<CommitKey, CommitRecord>,
    refs: HashMap<RefKey, RefRecord>,
    movements: Vec<RefMovementRecord>,
    builds: Vec<BuildRecord>,
}

impl MemoryState {
    fn bump(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }

    fn parents_of(&self, repository: &RepositoryId, hash: &CommitHash) -> Vec<CommitHash> {
        self.commits
            .get(&(repository.clone(), hash.clone()))
            .map(|c| c.parents.clone())
            .unwrap_or_default()
    }

    /// Breadth-first walk over parent links starting at `tip`.
    fn ancestry(&self, repository: &RepositoryId, tip: &CommitHash) -> Vec<CommitHash> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([tip.clone()]);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            if !self
                .commits
                .contains_key(&(repository.clone(), hash.clone()))
            {
                continue;
            }
            queue.extend(self.parents_of(repository, &hash));
            order.push(hash);
        }
        order
    }
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: RwLock<MemoryState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn generation(&self) -> StorageResult<Generation> {
        Ok(self.read()?.generation)
    }

    async fn insert_commit(&self, commit: &CommitRecord) -> StorageResult<WriteOutcome> {
        let mut state = self.write()?;
        let key = (commit.repository.clone(), commit.hash.clone());
        if state.commits.contains_key(&key) {
            return Ok(WriteOutcome::Unchanged(state.generation));
        }
        if commit.parents.contains(&commit.hash) {
            return Err(StorageError::CycleDetected {
                repository: commit.repository.to_string(),
                hash: commit.hash.to_string(),
            });
        }
        for parent in &commit.parents {
            if !state
                .commits
                .contains_key(&(commit.repository.clone(), parent.clone()))
            {
                return Err(StorageError::MissingParent {
                    repository: commit.repository.to_string(),
                    hash: commit.hash.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        state.commits.insert(key, commit.clone());
        Ok(WriteOutcome::Applied(state.bump()))
    }

    async fn get_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Option<CommitRecord>> {
        let state = self.read()?;
        Ok(state
            .commits
            .get(&(repository.clone(), hash.clone()))
            .cloned())
    }

    async fn is_ancestor(
        &self,
        repository: &RepositoryId,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> StorageResult<bool> {
        let state = self.read()?;
        let key = (repository.clone(), ancestor.clone());
        if !state.commits.contains_key(&key) {
            return Ok(false);
        }
        Ok(state
            .ancestry(repository, descendant)
            .iter()
            .any(|h| h == ancestor))
    }

    async fn commits_between(
        &self,
        repository: &RepositoryId,
        from: Option<&CommitHash>,
        to: &CommitHash,
        limit: usize,
    ) -> StorageResult<Vec<CommitRecord>> {
        let state = self.read()?;
        let excluded: HashSet<CommitHash> = from
            .map(|f| state.ancestry(repository, f).into_iter().collect())
            .unwrap_or_default();
        let mut commits: Vec<CommitRecord> = state
            .ancestry(repository, to)
            .into_iter()
            .filter(|h| !excluded.contains(h))
            .filter_map(|h| state.commits.get(&(repository.clone(), h)).cloned())
            .collect();
        commits.sort_by(|a, b| {
            b.authored_at
                .cmp(&a.authored_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        commits.truncate(limit);
        Ok(commits)
    }

    async fn apply_ref_movement(&self, movement: &RefMovement) -> StorageResult<WriteOutcome> {
        let mut state = self.write()?;
        let key = (movement.repository.clone(), movement.name.clone());
        let current = state.refs.get(&key).map(|r| r.target.clone());

        match &movement.new_target {
            Some(target) => {
                if current.as_ref() == Some(target) {
                    return Ok(WriteOutcome::Unchanged(state.generation));
                }
                if !state
                    .commits
                    .contains_key(&(movement.repository.clone(), target.clone()))
                {
                    return Err(StorageError::UnknownCommit {
                        repository: movement.repository.to_string(),
                        hash: target.to_string(),
                    });
                }
            }
            None => {
                if current.is_none() {
                    return Ok(WriteOutcome::Unchanged(state.generation));
                }
            }
        }

        let generation = state.bump();
        let now = Utc::now();
        match &movement.new_target {
            Some(target) => {
                state.refs.insert(
                    key,
                    RefRecord {
                        repository: movement.repository.clone(),
                        name: movement.name.clone(),
                        kind: movement.kind,
                        target: target.clone(),
                        updated_at: now,
                    },
                );
            }
            None => {
                state.refs.remove(&key);
            }
        }
        state.movements.push(RefMovementRecord {
            repository: movement.repository.clone(),
            name: movement.name.clone(),
            kind: movement.kind,
            old_target: current,
            new_target: movement.new_target.clone(),
            movement: movement.movement,
            seq: generation.0,
            recorded_at: now,
        });
        Ok(WriteOutcome::Applied(generation))
    }

    async fn get_ref(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Option<RefRecord>> {
        let state = self.read()?;
        Ok(state
            .refs
            .get(&(repository.clone(), name.to_string()))
            .cloned())
    }

    async fn list_refs(&self, repository: &RepositoryId) -> StorageResult<Vec<RefRecord>> {
        let state = self.read()?;
        let mut refs: Vec<RefRecord> = state
            .refs
            .values()
            .filter(|r| &r.repository == repository)
            .cloned()
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    async fn ref_history(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Vec<RefMovementRecord>> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| &m.repository == repository && m.name == name)
            .cloned()
            .collect())
    }

    async fn get_artifact(&self, id: &ArtifactId) -> StorageResult<Option<ArtifactRecord>> {
        Ok(self.read()?.artifacts.get(id).cloned())
    }

    async fn deactivate_artifact(&self, id: &ArtifactId) -> StorageResult<WriteOutcome> {
        let mut state = self.write()?;
        let generation = state.generation;
        let artifact = state
            .artifacts
            .get_mut(id)
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact: id.to_string(),
            })?;
        if !artifact.active {
            return Ok(WriteOutcome::Unchanged(generation));
        }
        artifact.active = false;
        Ok(WriteOutcome::Applied(state.bump()))
    }

    async fn record_build(
        &self,
        build: &NewBuild,
        policy: BuildPolicy,
    ) -> StorageResult<BuildWrite> {
        let mut state = self.write()?;

        if let Some(artifact) = state.artifacts.get(&build.artifact) {
            if artifact.repository != build.repository {
                return Err(StorageError::RepositoryMismatch {
                    artifact: build.artifact.to_string(),
                    expected: artifact.repository.to_string(),
                    actual: build.repository.to_string(),
                });
            }
            if !artifact.active {
                return Err(StorageError::ArtifactInactive {
                    artifact: build.artifact.to_string(),
                });
            }
        }

        if !state
            .commits
            .contains_key(&(build.repository.clone(), build.commit.clone()))
        {
            return Err(StorageError::UnknownCommit {
                repository: build.repository.to_string(),
                hash: build.commit.to_string(),
            });
        }

        let same_version: Vec<&BuildRecord> = state
            .builds
            .iter()
            .filter(|b| b.artifact == build.artifact && b.version == build.version)
            .collect();
        if let Some(existing) = same_version.iter().find(|b| b.matches(build)) {
            return Ok(BuildWrite {
                outcome: WriteOutcome::Unchanged(state.generation),
                build: (*existing).clone(),
            });
        }
        if build.success {
            if same_version.iter().any(|b| b.success) {
                return Err(StorageError::DuplicateVersion {
                    artifact: build.artifact.to_string(),
                    version: build.version.clone(),
                });
            }
            if !policy.allow_republish && same_version.iter().any(|b| !b.success) {
                return Err(StorageError::RepublishDenied {
                    artifact: build.artifact.to_string(),
                    version: build.version.clone(),
                });
            }
        }

        let now = Utc::now();
        if !state.artifacts.contains_key(&build.artifact) {
            state.artifacts.insert(
                build.artifact.clone(),
                ArtifactRecord {
                    id: build.artifact.clone(),
                    display_name: build
                        .display_name
                        .clone()
                        .unwrap_or_else(|| build.artifact.to_string()),
                    repository: build.repository.clone(),
                    active: true,
                    created_at: now,
                },
            );
        }
        let record = BuildRecord {
            build_id: BuildId::new(),
            artifact: build.artifact.clone(),
            repository: build.repository.clone(),
            commit: build.commit.clone(),
            version: build.version.clone(),
            channel: build.channel.clone(),
            success: build.success,
            completed_at: build.normalized_completed_at(),
            recorded_at: now,
        };
        state.builds.push(record.clone());
        Ok(BuildWrite {
            outcome: WriteOutcome::Applied(state.bump()),
            build: record,
        })
    }

    async fn find_build(
        &self,
        artifact: &ArtifactId,
        version: &str,
    ) -> StorageResult<Option<BuildRecord>> {
        let state = self.read()?;
        Ok(state
            .builds
            .iter()
            .find(|b| b.success && &b.artifact == artifact && b.version == version)
            .cloned())
    }

    async fn successful_builds(
        &self,
        artifact: &ArtifactId,
        channel: Option<&Channel>,
    ) -> StorageResult<Vec<BuildRecord>> {
        let state = self.read()?;
        Ok(state
            .builds
            .iter()
            .filter(|b| b.success && &b.artifact == artifact)
            .filter(|b| channel.map(|c| &b.channel == c).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn builds_for_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Vec<BuildRecord>> {
        let state = self.read()?;
        Ok(state
            .builds
            .iter()
            .filter(|b| &b.repository == repository && &b.commit == hash)
            .cloned()
            .collect())
    }

    async fn list_builds(
        &self,
        artifact: &ArtifactId,
        query: &ListBuildsQuery,
    ) -> StorageResult<BuildPage> {
        let state = self.read()?;
        let mut builds: Vec<BuildRecord> = state
            .builds
            .iter()
            .filter(|b| &b.artifact == artifact)
            .filter(|b| query.include_failed || b.success)
            .filter(|b| query.channel.as_ref().map_or(true, |c| &b.channel == c))
            .filter(|b| query.cursor.map(|c| c.precedes(b)).unwrap_or(true))
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            (b.completed_at, b.build_id).cmp(&(a.completed_at, a.build_id))
        });

        let has_more = builds.len() > query.limit;
        builds.truncate(query.limit);
        let next_cursor = if has_more {
            builds.last().map(BuildRecord::cursor)
        } else {
            None
        };
        Ok(BuildPage {
            builds,
            next_cursor,
        })
    }
}
