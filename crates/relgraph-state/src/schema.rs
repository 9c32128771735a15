//! Row mappings for the relgraph SurrealDB tables
//!
//! Tables:
//! - artifacts: versionable components (soft-deactivated, never deleted)
//! - commits: commit DAG nodes, keyed by (repository, hash)
//! - refs: materialized current ref pointers
//! - ref_movements: append-only ref-movement log
//! - builds: recorded build facts
//! - generation: single-row mutation counter
//!
//! Rows use plain strings for identifiers; conversion back to the validated
//! record types happens at the boundary in `TryFrom` impls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::records::*;

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Record key for a (repository, name) pair.
pub(crate) fn scoped_key(repository: &RepositoryId, name: &str) -> String {
    format!("{}|{}", repository.as_str(), name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbArtifact {
    pub artifact_id: String,
    pub display_name: String,
    pub repository: String,
    pub active: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbArtifact> for ArtifactRecord {
    type Error = StorageError;

    fn try_from(row: DbArtifact) -> Result<Self, Self::Error> {
        Ok(ArtifactRecord {
            id: ArtifactId::parse(&row.artifact_id)?,
            display_name: row.display_name,
            repository: RepositoryId::new(row.repository),
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbCommit {
    pub repository: String,
    pub hash: String,
    pub parents: Vec<String>,
    pub author: String,
    #[serde(with = "surreal_datetime")]
    pub authored_at: DateTime<Utc>,
    pub summary: String,
}

impl From<&CommitRecord> for DbCommit {
    fn from(commit: &CommitRecord) -> Self {
        DbCommit {
            repository: commit.repository.to_string(),
            hash: commit.hash.to_string(),
            parents: commit.parents.iter().map(ToString::to_string).collect(),
            author: commit.author.clone(),
            authored_at: commit.authored_at,
            summary: commit.summary.clone(),
        }
    }
}

impl TryFrom<DbCommit> for CommitRecord {
    type Error = StorageError;

    fn try_from(row: DbCommit) -> Result<Self, Self::Error> {
        Ok(CommitRecord {
            repository: RepositoryId::new(row.repository),
            hash: CommitHash::parse(&row.hash)?,
            parents: row
                .parents
                .iter()
                .map(|p| CommitHash::parse(p))
                .collect::<Result<_, _>>()?,
            author: row.author,
            authored_at: row.authored_at,
            summary: row.summary,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbRef {
    pub repository: String,
    pub name: String,
    pub kind: String,
    pub target: String,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbRef> for RefRecord {
    type Error = StorageError;

    fn try_from(row: DbRef) -> Result<Self, Self::Error> {
        Ok(RefRecord {
            repository: RepositoryId::new(row.repository),
            kind: RefKind::of(&row.name),
            name: row.name,
            target: CommitHash::parse(&row.target)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbRefMovement {
    pub repository: String,
    pub name: String,
    pub kind: String,
    pub old_target: Option<String>,
    pub new_target: Option<String>,
    pub movement: String,
    pub seq: u64,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<DbRefMovement> for RefMovementRecord {
    type Error = StorageError;

    fn try_from(row: DbRefMovement) -> Result<Self, Self::Error> {
        Ok(RefMovementRecord {
            repository: RepositoryId::new(row.repository),
            kind: RefKind::of(&row.name),
            name: row.name,
            old_target: row.old_target.as_deref().map(CommitHash::parse).transpose()?,
            new_target: row.new_target.as_deref().map(CommitHash::parse).transpose()?,
            movement: RefMovementKind::parse(&row.movement)?,
            seq: row.seq,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbBuild {
    pub build_id: String,
    pub artifact: String,
    pub repository: String,
    pub commit_hash: String,
    pub build_version: String,
    pub channel: String,
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub completed_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl From<&BuildRecord> for DbBuild {
    fn from(build: &BuildRecord) -> Self {
        DbBuild {
            build_id: build.build_id.to_string(),
            artifact: build.artifact.to_string(),
            repository: build.repository.to_string(),
            commit_hash: build.commit.to_string(),
            build_version: build.version.clone(),
            channel: build.channel.to_string(),
            success: build.success,
            completed_at: build.completed_at,
            recorded_at: build.recorded_at,
        }
    }
}

impl TryFrom<DbBuild> for BuildRecord {
    type Error = StorageError;

    fn try_from(row: DbBuild) -> Result<Self, Self::Error> {
        let build_id = Uuid::parse_str(&row.build_id)
            .map_err(|e| StorageError::Serialization(format!("bad build id: {e}")))?;
        Ok(BuildRecord {
            build_id: BuildId(build_id),
            artifact: ArtifactId::parse(&row.artifact)?,
            repository: RepositoryId::new(row.repository),
            commit: CommitHash::parse(&row.commit_hash)?,
            version: row.build_version,
            channel: Channel::parse(&row.channel)?,
            success: row.success,
            completed_at: row.completed_at,
            recorded_at: row.recorded_at,
        })
    }
}

/// Convert a batch of rows, failing on the first malformed one.
pub(crate) fn convert_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>, StorageError>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_key_joins_repository_and_name() {
        let repo = RepositoryId::new("org/repo");
        assert_eq!(scoped_key(&repo, "refs/heads/main"), "org/repo|refs/heads/main");
    }

    #[test]
    fn build_row_rejects_malformed_hash() {
        let row = DbBuild {
            build_id: Uuid::new_v4().to_string(),
            artifact: "org:widget".into(),
            repository: "org/repo".into(),
            commit_hash: "not-hex".into(),
            build_version: "1.0.0".into(),
            channel: "stable".into(),
            success: true,
            completed_at: Utc::now(),
            recorded_at: Utc::now(),
        };
        let err = BuildRecord::try_from(row).unwrap_err();
        assert!(matches!(err, StorageError::InvalidCommitHash { .. }));
    }
}
