//! Error taxonomy for relgraph-core.

use relgraph_state::StorageError;

/// Errors produced while reading a version-control source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcsError {
    /// Transport or process failure; retry with backoff.
    #[error("repository {repository} unavailable: {reason}")]
    RepositoryUnavailable { repository: String, reason: String },

    /// A declared parent could not be resolved after bounded retries.
    #[error("corrupt history in {repository}: commit {commit} has unresolvable parent {parent}")]
    CorruptHistory {
        repository: String,
        commit: String,
        parent: String,
    },

    /// The source returned output that could not be parsed.
    #[error("malformed source output in {repository}: {reason}")]
    Malformed { repository: String, reason: String },
}

impl VcsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VcsError::RepositoryUnavailable { .. })
    }
}

/// Errors surfaced by the ingestion coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StorageError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("repository {0} is halted after corrupt history")]
    RepositoryHalted(String),

    #[error("repository {0} is not registered")]
    UnknownRepository(String),

    #[error("ingestion worker for {0} has stopped")]
    WorkerStopped(String),

    #[error("invalid build notification: {0}")]
    InvalidNotification(String),
}

/// Rejected version, range or resolution expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version expression {input:?}: {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

impl VersionParseError {
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by query operations. "No match" is not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Store failure; transports should answer with a retryable response.
    #[error("store unavailable: {0}")]
    StoreUnavailable(StorageError),

    #[error(transparent)]
    InvalidRequest(#[from] VersionParseError),

    #[error("invalid artifact id: {0:?}")]
    InvalidArtifact(String),

    #[error("invalid commit hash: {0:?}")]
    InvalidCommit(String),

    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("invalid pagination cursor: {0:?}")]
    InvalidCursor(String),

    #[error("invalid channel: {0:?}")]
    InvalidChannel(String),

    /// The store generation kept moving while resolving.
    #[error("store kept changing during resolution ({attempts} attempts)")]
    Contended { attempts: usize },
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::StoreUnavailable(_) | QueryError::Contended { .. }
        )
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidCursor { cursor } => QueryError::InvalidCursor(cursor),
            StorageError::InvalidArtifactId { id } => QueryError::InvalidArtifact(id),
            StorageError::InvalidCommitHash { hash } => QueryError::InvalidCommit(hash),
            StorageError::InvalidChannel { channel } => QueryError::InvalidChannel(channel),
            StorageError::ArtifactNotFound { artifact } => QueryError::UnknownArtifact(artifact),
            other => QueryError::StoreUnavailable(other),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    Env { var: String, value: String },

    #[error("invalid config field {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
