//! Error types for relgraph-state

use thiserror::Error;

/// Errors produced by the metadata store and its record types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend connection could not be established
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Backend query or transaction failed
    #[error("store backend error: {0}")]
    Backend(String),

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// Row (de)serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid commit hash: {hash:?}")]
    InvalidCommitHash { hash: String },

    #[error("invalid artifact id: {id:?}")]
    InvalidArtifactId { id: String },

    #[error("invalid promotion channel: {channel:?}")]
    InvalidChannel { channel: String },

    #[error("invalid pagination cursor: {cursor:?}")]
    InvalidCursor { cursor: String },

    /// A build or ref referenced a commit the store has not recorded.
    #[error("commit {hash} is not recorded in repository {repository}")]
    UnknownCommit { repository: String, hash: String },

    /// A commit declared a parent the store has not recorded.
    #[error("commit {hash} in {repository} declares unrecorded parent {parent}")]
    MissingParent {
        repository: String,
        hash: String,
        parent: String,
    },

    /// A commit would introduce a cycle into the parent graph.
    #[error("commit {hash} in {repository} would create a cycle")]
    CycleDetected { repository: String, hash: String },

    /// A successful build already exists for this (artifact, version).
    #[error("artifact {artifact} already has a successful build for version {version}")]
    DuplicateVersion { artifact: String, version: String },

    /// A failed build exists and republishing is disabled.
    #[error("republishing {artifact} {version} over a failed build is not allowed")]
    RepublishDenied { artifact: String, version: String },

    #[error("artifact {artifact} is deactivated")]
    ArtifactInactive { artifact: String },

    #[error("artifact not found: {artifact}")]
    ArtifactNotFound { artifact: String },

    /// The artifact is bound to a different repository than the build claims.
    #[error("artifact {artifact} belongs to {expected}, not {actual}")]
    RepositoryMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },
}

impl StorageError {
    /// Whether the failure is an infrastructure problem (worth retrying)
    /// rather than a rejected write.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Backend(_))
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_classification() {
        assert!(StorageError::Backend("io".into()).is_unavailable());
        assert!(StorageError::Connection("refused".into()).is_unavailable());
        assert!(!StorageError::DuplicateVersion {
            artifact: "a".into(),
            version: "1.0.0".into()
        }
        .is_unavailable());
    }

    #[test]
    fn missing_parent_displays_context() {
        let err = StorageError::MissingParent {
            repository: "org/repo".into(),
            hash: "bbbb".into(),
            parent: "aaaa".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("org/repo"));
        assert!(msg.contains("bbbb"));
        assert!(msg.contains("aaaa"));
    }
}
