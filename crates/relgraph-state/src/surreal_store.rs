//! SurrealDB-backed `MetadataStore`
//!
//! Writes use optimistic concurrency on the generation row: preconditions
//! are read first, then one transaction re-checks that the generation has
//! not moved, applies the rows and stores the bumped generation. A moved
//! generation aborts the transaction and the write is re-evaluated.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::records::*;
use crate::schema::{
    convert_rows, scoped_key, DbArtifact, DbBuild, DbCommit, DbRef, DbRefMovement,
};
use crate::storage_traits::{MetadataStore, StorageResult};

const MAX_WRITE_ATTEMPTS: usize = 8;
const GENERATION_CONFLICT: &str = "generation conflict";

/// Wrap a transaction body with the generation check and bump.
///
/// Binds `$expected` and `$next` must be supplied by the caller.
fn transaction(body: &str) -> String {
    format!(
        "BEGIN TRANSACTION;
         LET $current = (SELECT VALUE counter FROM ONLY generation:current);
         IF $current != $expected {{ THROW \"{GENERATION_CONFLICT}\" }};
         {body}
         UPDATE generation:current SET counter = $next;
         COMMIT TRANSACTION;"
    )
}

fn is_conflict(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains(GENERATION_CONFLICT) || msg.contains("conflict") || msg.contains("can be retried")
}

enum TxOutcome {
    Committed(Generation),
    Conflict,
}

/// SurrealDB implementation of [`MetadataStore`].
#[derive(Clone)]
pub struct SurrealMetadataStore {
    handle: Arc<SurrealHandle>,
    /// Serializes writers within this process; cross-process writers are
    /// caught by the generation check.
    write_lock: Arc<Mutex<()>>,
}

impl SurrealMetadataStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self {
            handle,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn finish(
        result: surrealdb::Result<surrealdb::Response>,
        next: Generation,
    ) -> StorageResult<TxOutcome> {
        match result.and_then(|res| res.check()) {
            Ok(_) => Ok(TxOutcome::Committed(next)),
            Err(e) if is_conflict(&e) => {
                debug!(error = %e, "write transaction conflicted");
                Ok(TxOutcome::Conflict)
            }
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    fn exhausted(op: &str) -> StorageError {
        warn!(op, attempts = MAX_WRITE_ATTEMPTS, "write retries exhausted");
        StorageError::Backend(format!(
            "{op}: generation conflict persisted after {MAX_WRITE_ATTEMPTS} attempts"
        ))
    }

    async fn select_commits(
        &self,
        repository: &RepositoryId,
        hashes: Vec<String>,
    ) -> StorageResult<Vec<DbCommit>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM commits WHERE repository = $repo AND hash IN $hashes")
            .bind(("repo", repository.to_string()))
            .bind(("hashes", hashes))
            .await?;
        Ok(res.take(0)?)
    }

    /// Breadth-first walk over recorded ancestors of `tip`, one query per
    /// frontier. Stops early once `target` is reached.
    async fn walk(
        &self,
        repository: &RepositoryId,
        tip: &CommitHash,
        target: Option<&CommitHash>,
    ) -> StorageResult<(Vec<DbCommit>, bool)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut visited = Vec::new();
        let mut frontier = vec![tip.to_string()];
        seen.insert(tip.to_string());

        while !frontier.is_empty() {
            let rows = self.select_commits(repository, frontier).await?;
            let mut next = Vec::new();
            for row in rows {
                if target.map(|t| t.as_str() == row.hash).unwrap_or(false) {
                    return Ok((visited, true));
                }
                for parent in &row.parents {
                    if seen.insert(parent.clone()) {
                        next.push(parent.clone());
                    }
                }
                visited.push(row);
            }
            frontier = next;
        }
        Ok((visited, false))
    }

    async fn builds_where(
        &self,
        sql: &'static str,
        binds: Vec<(&'static str, String)>,
    ) -> StorageResult<Vec<BuildRecord>> {
        let mut query = self.handle.db().query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows: Vec<DbBuild> = query.await?.take(0)?;
        convert_rows(rows)
    }
}

#[async_trait]
impl MetadataStore for SurrealMetadataStore {
    async fn generation(&self) -> StorageResult<Generation> {
        let mut res = self
            .handle
            .db()
            .query("SELECT VALUE counter FROM ONLY generation:current")
            .await?;
        let counter: Option<u64> = res.take(0)?;
        Ok(Generation(counter.unwrap_or(0)))
    }

    #[instrument(skip(self, commit), fields(repository = %commit.repository, hash = %commit.hash))]
    async fn insert_commit(&self, commit: &CommitRecord) -> StorageResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let expected = self.generation().await?;
            if self.contains_commit(&commit.repository, &commit.hash).await? {
                return Ok(WriteOutcome::Unchanged(expected));
            }
            if commit.parents.contains(&commit.hash) {
                return Err(StorageError::CycleDetected {
                    repository: commit.repository.to_string(),
                    hash: commit.hash.to_string(),
                });
            }
            let wanted: Vec<String> = commit.parents.iter().map(ToString::to_string).collect();
            let found: HashSet<String> = self
                .select_commits(&commit.repository, wanted)
                .await?
                .into_iter()
                .map(|row| row.hash)
                .collect();
            if let Some(parent) = commit.parents.iter().find(|p| !found.contains(p.as_str())) {
                return Err(StorageError::MissingParent {
                    repository: commit.repository.to_string(),
                    hash: commit.hash.to_string(),
                    parent: parent.to_string(),
                });
            }

            let next = expected.next();
            let result = self
                .handle
                .db()
                .query(transaction(
                    "CREATE type::thing('commits', $key) CONTENT $row;",
                ))
                .bind(("expected", expected.0))
                .bind(("next", next.0))
                .bind(("key", scoped_key(&commit.repository, commit.hash.as_str())))
                .bind(("row", DbCommit::from(commit)))
                .await;
            match Self::finish(result, next)? {
                TxOutcome::Committed(generation) => return Ok(WriteOutcome::Applied(generation)),
                TxOutcome::Conflict => continue,
            }
        }
        Err(Self::exhausted("insert_commit"))
    }

    async fn get_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Option<CommitRecord>> {
        let rows = self
            .select_commits(repository, vec![hash.to_string()])
            .await?;
        rows.into_iter().next().map(CommitRecord::try_from).transpose()
    }

    async fn is_ancestor(
        &self,
        repository: &RepositoryId,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> StorageResult<bool> {
        let (_, found) = self.walk(repository, descendant, Some(ancestor)).await?;
        Ok(found)
    }

    async fn commits_between(
        &self,
        repository: &RepositoryId,
        from: Option<&CommitHash>,
        to: &CommitHash,
        limit: usize,
    ) -> StorageResult<Vec<CommitRecord>> {
        let excluded: HashSet<String> = match from {
            Some(from) => self
                .walk(repository, from, None)
                .await?
                .0
                .into_iter()
                .map(|row| row.hash)
                .collect(),
            None => HashSet::new(),
        };
        let (reachable, _) = self.walk(repository, to, None).await?;
        let mut commits: Vec<CommitRecord> = convert_rows(
            reachable
                .into_iter()
                .filter(|row| !excluded.contains(&row.hash))
                .collect::<Vec<_>>(),
        )?;
        commits.sort_by(|a, b| {
            b.authored_at
                .cmp(&a.authored_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        commits.truncate(limit);
        Ok(commits)
    }

    #[instrument(
        skip(self, movement),
        fields(repository = %movement.repository, name = %movement.name)
    )]
    async fn apply_ref_movement(&self, movement: &RefMovement) -> StorageResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = scoped_key(&movement.repository, &movement.name);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let expected = self.generation().await?;
            let current = self
                .get_ref(&movement.repository, &movement.name)
                .await?
                .map(|r| r.target);

            match &movement.new_target {
                Some(target) => {
                    if current.as_ref() == Some(target) {
                        return Ok(WriteOutcome::Unchanged(expected));
                    }
                    if !self.contains_commit(&movement.repository, target).await? {
                        return Err(StorageError::UnknownCommit {
                            repository: movement.repository.to_string(),
                            hash: target.to_string(),
                        });
                    }
                }
                None => {
                    if current.is_none() {
                        return Ok(WriteOutcome::Unchanged(expected));
                    }
                }
            }

            let next = expected.next();
            let now = Utc::now();
            let log_row = DbRefMovement {
                repository: movement.repository.to_string(),
                name: movement.name.clone(),
                kind: movement.kind.as_str().to_string(),
                old_target: current.as_ref().map(ToString::to_string),
                new_target: movement.new_target.as_ref().map(ToString::to_string),
                movement: movement.movement.as_str().to_string(),
                seq: next.0,
                recorded_at: now,
            };

            let result = match &movement.new_target {
                Some(target) => {
                    let ref_row = DbRef {
                        repository: movement.repository.to_string(),
                        name: movement.name.clone(),
                        kind: movement.kind.as_str().to_string(),
                        target: target.to_string(),
                        updated_at: now,
                    };
                    self.handle
                        .db()
                        .query(transaction(
                            "UPSERT type::thing('refs', $key) CONTENT $ref_row;
                             CREATE ref_movements CONTENT $log_row;",
                        ))
                        .bind(("expected", expected.0))
                        .bind(("next", next.0))
                        .bind(("key", key.clone()))
                        .bind(("ref_row", ref_row))
                        .bind(("log_row", log_row))
                        .await
                }
                None => {
                    self.handle
                        .db()
                        .query(transaction(
                            "DELETE type::thing('refs', $key);
                             CREATE ref_movements CONTENT $log_row;",
                        ))
                        .bind(("expected", expected.0))
                        .bind(("next", next.0))
                        .bind(("key", key.clone()))
                        .bind(("log_row", log_row))
                        .await
                }
            };
            match Self::finish(result, next)? {
                TxOutcome::Committed(generation) => return Ok(WriteOutcome::Applied(generation)),
                TxOutcome::Conflict => continue,
            }
        }
        Err(Self::exhausted("apply_ref_movement"))
    }

    async fn get_ref(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Option<RefRecord>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM refs WHERE repository = $repo AND name = $name LIMIT 1")
            .bind(("repo", repository.to_string()))
            .bind(("name", name.to_string()))
            .await?;
        let rows: Vec<DbRef> = res.take(0)?;
        rows.into_iter().next().map(RefRecord::try_from).transpose()
    }

    async fn list_refs(&self, repository: &RepositoryId) -> StorageResult<Vec<RefRecord>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM refs WHERE repository = $repo ORDER BY name ASC")
            .bind(("repo", repository.to_string()))
            .await?;
        let rows: Vec<DbRef> = res.take(0)?;
        convert_rows(rows)
    }

    async fn ref_history(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Vec<RefMovementRecord>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * FROM ref_movements WHERE repository = $repo AND name = $name ORDER BY seq ASC",
            )
            .bind(("repo", repository.to_string()))
            .bind(("name", name.to_string()))
            .await?;
        let rows: Vec<DbRefMovement> = res.take(0)?;
        convert_rows(rows)
    }

    async fn get_artifact(&self, id: &ArtifactId) -> StorageResult<Option<ArtifactRecord>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM artifacts WHERE artifact_id = $id LIMIT 1")
            .bind(("id", id.to_string()))
            .await?;
        let rows: Vec<DbArtifact> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(ArtifactRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(artifact = %id))]
    async fn deactivate_artifact(&self, id: &ArtifactId) -> StorageResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let expected = self.generation().await?;
            let artifact =
                self.get_artifact(id)
                    .await?
                    .ok_or_else(|| StorageError::ArtifactNotFound {
                        artifact: id.to_string(),
                    })?;
            if !artifact.active {
                return Ok(WriteOutcome::Unchanged(expected));
            }

            let next = expected.next();
            let result = self
                .handle
                .db()
                .query(transaction(
                    "UPDATE type::thing('artifacts', $key) SET active = false;",
                ))
                .bind(("expected", expected.0))
                .bind(("next", next.0))
                .bind(("key", id.to_string()))
                .await;
            match Self::finish(result, next)? {
                TxOutcome::Committed(generation) => return Ok(WriteOutcome::Applied(generation)),
                TxOutcome::Conflict => continue,
            }
        }
        Err(Self::exhausted("deactivate_artifact"))
    }

    #[instrument(
        skip(self, build, policy),
        fields(artifact = %build.artifact, version = %build.version)
    )]
    async fn record_build(
        &self,
        build: &NewBuild,
        policy: BuildPolicy,
    ) -> StorageResult<BuildWrite> {
        let _guard = self.write_lock.lock().await;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let expected = self.generation().await?;

            let artifact = self.get_artifact(&build.artifact).await?;
            if let Some(artifact) = &artifact {
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

            if !self.contains_commit(&build.repository, &build.commit).await? {
                return Err(StorageError::UnknownCommit {
                    repository: build.repository.to_string(),
                    hash: build.commit.to_string(),
                });
            }

            let same_version = self
                .builds_where(
                    "SELECT * FROM builds WHERE artifact = $artifact AND build_version = $version",
                    vec![
                        ("artifact", build.artifact.to_string()),
                        ("version", build.version.clone()),
                    ],
                )
                .await?;
            if let Some(existing) = same_version.iter().find(|b| b.matches(build)) {
                return Ok(BuildWrite {
                    outcome: WriteOutcome::Unchanged(expected),
                    build: existing.clone(),
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
            let next = expected.next();
            let build_stmt = "CREATE type::thing('builds', $build_key) CONTENT $build_row;";

            let result = if artifact.is_none() {
                let artifact_row = DbArtifact {
                    artifact_id: build.artifact.to_string(),
                    display_name: build
                        .display_name
                        .clone()
                        .unwrap_or_else(|| build.artifact.to_string()),
                    repository: build.repository.to_string(),
                    active: true,
                    created_at: now,
                };
                self.handle
                    .db()
                    .query(transaction(&format!(
                        "CREATE type::thing('artifacts', $artifact_key) CONTENT $artifact_row;
                         {build_stmt}"
                    )))
                    .bind(("expected", expected.0))
                    .bind(("next", next.0))
                    .bind(("artifact_key", build.artifact.to_string()))
                    .bind(("artifact_row", artifact_row))
                    .bind(("build_key", record.build_id.to_string()))
                    .bind(("build_row", DbBuild::from(&record)))
                    .await
            } else {
                self.handle
                    .db()
                    .query(transaction(build_stmt))
                    .bind(("expected", expected.0))
                    .bind(("next", next.0))
                    .bind(("build_key", record.build_id.to_string()))
                    .bind(("build_row", DbBuild::from(&record)))
                    .await
            };
            match Self::finish(result, next)? {
                TxOutcome::Committed(generation) => {
                    return Ok(BuildWrite {
                        outcome: WriteOutcome::Applied(generation),
                        build: record,
                    })
                }
                TxOutcome::Conflict => continue,
            }
        }
        Err(Self::exhausted("record_build"))
    }

    async fn find_build(
        &self,
        artifact: &ArtifactId,
        version: &str,
    ) -> StorageResult<Option<BuildRecord>> {
        let builds = self
            .builds_where(
                "SELECT * FROM builds WHERE artifact = $artifact AND build_version = $version AND success = true LIMIT 1",
                vec![
                    ("artifact", artifact.to_string()),
                    ("version", version.to_string()),
                ],
            )
            .await?;
        Ok(builds.into_iter().next())
    }

    async fn successful_builds(
        &self,
        artifact: &ArtifactId,
        channel: Option<&Channel>,
    ) -> StorageResult<Vec<BuildRecord>> {
        match channel {
            Some(channel) => {
                self.builds_where(
                    "SELECT * FROM builds WHERE artifact = $artifact AND success = true AND channel = $channel",
                    vec![
                        ("artifact", artifact.to_string()),
                        ("channel", channel.to_string()),
                    ],
                )
                .await
            }
            None => {
                self.builds_where(
                    "SELECT * FROM builds WHERE artifact = $artifact AND success = true",
                    vec![("artifact", artifact.to_string())],
                )
                .await
            }
        }
    }

    async fn builds_for_commit(
        &self,
        repository: &RepositoryId,
        hash: &CommitHash,
    ) -> StorageResult<Vec<BuildRecord>> {
        self.builds_where(
            "SELECT * FROM builds WHERE repository = $repo AND commit_hash = $hash",
            vec![("repo", repository.to_string()), ("hash", hash.to_string())],
        )
        .await
    }

    async fn list_builds(
        &self,
        artifact: &ArtifactId,
        query: &ListBuildsQuery,
    ) -> StorageResult<BuildPage> {
        let mut sql = String::from("SELECT * FROM builds WHERE artifact = $artifact");
        if !query.include_failed {
            sql.push_str(" AND success = true");
        }
        if query.channel.is_some() {
            sql.push_str(" AND channel = $channel");
        }
        if query.cursor.is_some() {
            sql.push_str(
                " AND (completed_at < $cursor_at OR (completed_at = $cursor_at AND build_id < $cursor_id))",
            );
        }
        // One extra row tells whether another page follows.
        sql.push_str(&format!(
            " ORDER BY completed_at DESC, build_id DESC LIMIT {}",
            query.limit + 1
        ));

        let mut request = self
            .handle
            .db()
            .query(sql)
            .bind(("artifact", artifact.to_string()));
        if let Some(channel) = &query.channel {
            request = request.bind(("channel", channel.to_string()));
        }
        if let Some(cursor) = &query.cursor {
            request = request
                .bind(("cursor_at", SurrealDatetime::from(cursor.completed_at)))
                .bind(("cursor_id", cursor.build_id.to_string()));
        }
        let rows: Vec<DbBuild> = request.await?.take(0)?;
        let mut builds: Vec<BuildRecord> = convert_rows(rows)?;

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
