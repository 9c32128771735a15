//! Record types shared by every `MetadataStore` backend.
//!
//! Identifier newtypes validate on construction so that backends can treat
//! their inner strings as canonical keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Name of a version-control repository known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        RepositoryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash of a commit (lowercase hex, 4 to 64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitHash(String);

impl CommitHash {
    pub fn parse(hash: &str) -> StorageResult<Self> {
        let trimmed = hash.trim();
        if trimmed.len() < 4
            || trimmed.len() > 64
            || !trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(StorageError::InvalidCommitHash {
                hash: hash.to_string(),
            });
        }
        Ok(CommitHash(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 8 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl TryFrom<String> for CommitHash {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        CommitHash::parse(&s)
    }
}

impl From<CommitHash> for String {
    fn from(hash: CommitHash) -> Self {
        hash.0
    }
}

impl FromStr for CommitHash {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommitHash::parse(s)
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Artifact coordinates (`group:artifact` or a bare name), lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn parse(id: &str) -> StorageResult<Self> {
        let normalized = id.trim().to_lowercase();
        let valid = !normalized.is_empty()
            && !normalized.chars().any(char::is_whitespace)
            && normalized.split(':').all(|part| !part.is_empty());
        if !valid {
            return Err(StorageError::InvalidArtifactId { id: id.to_string() });
        }
        Ok(ArtifactId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ArtifactId::parse(&s)
    }
}

impl From<ArtifactId> for String {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl FromStr for ArtifactId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactId::parse(s)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Promotion channel (release maturity), e.g. `snapshot` or `stable`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub const SNAPSHOT: &'static str = "snapshot";
    pub const STABLE: &'static str = "stable";

    pub fn parse(channel: &str) -> StorageResult<Self> {
        let normalized = channel.trim().to_lowercase();
        let valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(StorageError::InvalidChannel {
                channel: channel.to_string(),
            });
        }
        Ok(Channel(normalized))
    }

    pub fn snapshot() -> Self {
        Channel(Self::SNAPSHOT.to_string())
    }

    pub fn stable() -> Self {
        Channel(Self::STABLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Channel {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Channel::parse(&s)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of a recorded build row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn new() -> Self {
        BuildId(Uuid::new_v4())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-wide mutation counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Commits and refs
// ---------------------------------------------------------------------------

/// A commit node. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub repository: RepositoryId,
    pub hash: CommitHash,
    /// Ordered parent hashes (empty for root commits)
    pub parents: Vec<CommitHash>,
    pub author: String,
    pub authored_at: DateTime<Utc>,
    /// First line of the commit message
    pub summary: String,
}

/// Branch or tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    /// Classify a full ref name (`refs/tags/...` is a tag, anything else a branch).
    pub fn of(name: &str) -> Self {
        if name.starts_with("refs/tags/") {
            RefKind::Tag
        } else {
            RefKind::Branch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Branch => "branch",
            RefKind::Tag => "tag",
        }
    }
}

/// How a ref moved between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefMovementKind {
    Created,
    FastForward,
    /// Non-fast-forward: the new target does not descend from the old one.
    Rewrite,
    Deleted,
}

impl RefMovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefMovementKind::Created => "created",
            RefMovementKind::FastForward => "fast_forward",
            RefMovementKind::Rewrite => "rewrite",
            RefMovementKind::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "created" => Ok(RefMovementKind::Created),
            "fast_forward" => Ok(RefMovementKind::FastForward),
            "rewrite" => Ok(RefMovementKind::Rewrite),
            "deleted" => Ok(RefMovementKind::Deleted),
            other => Err(StorageError::Serialization(format!(
                "unknown ref movement kind: {other}"
            ))),
        }
    }
}

/// Requested ref movement, as observed by the commit graph reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMovement {
    pub repository: RepositoryId,
    /// Full ref name, e.g. `refs/heads/main`
    pub name: String,
    pub kind: RefKind,
    pub old_target: Option<CommitHash>,
    /// `None` when the ref was deleted
    pub new_target: Option<CommitHash>,
    pub movement: RefMovementKind,
}

/// Materialized current position of a ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub repository: RepositoryId,
    pub name: String,
    pub kind: RefKind,
    pub target: CommitHash,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ref-movement log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMovementRecord {
    pub repository: RepositoryId,
    pub name: String,
    pub kind: RefKind,
    pub old_target: Option<CommitHash>,
    pub new_target: Option<CommitHash>,
    pub movement: RefMovementKind,
    /// Generation of the transaction that appended this entry
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Artifacts and builds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub display_name: String,
    pub repository: RepositoryId,
    /// Soft-deactivation flag; artifacts are never deleted
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A build-completion fact to be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuild {
    pub artifact: ArtifactId,
    /// Display name used if the artifact is created by this build
    pub display_name: Option<String>,
    pub repository: RepositoryId,
    pub commit: CommitHash,
    pub version: String,
    pub channel: Channel,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

impl NewBuild {
    /// Completion time at the precision every backend persists (microseconds).
    pub fn normalized_completed_at(&self) -> DateTime<Utc> {
        self.completed_at.trunc_subsecs(6)
    }
}

/// A recorded build row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub artifact: ArtifactId,
    pub repository: RepositoryId,
    pub commit: CommitHash,
    pub version: String,
    pub channel: Channel,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl BuildRecord {
    /// Whether `build` describes exactly this row (redelivered notification).
    pub fn matches(&self, build: &NewBuild) -> bool {
        self.artifact == build.artifact
            && self.commit == build.commit
            && self.version == build.version
            && self.channel == build.channel
            && self.success == build.success
            && self.completed_at == build.normalized_completed_at()
    }

    pub fn cursor(&self) -> BuildCursor {
        BuildCursor {
            completed_at: self.completed_at,
            build_id: self.build_id,
        }
    }
}

/// Project policy applied when recording builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPolicy {
    /// Allow a successful build to supersede a failed build of the same version
    pub allow_republish: bool,
}

// ---------------------------------------------------------------------------
// Write outcomes and pagination
// ---------------------------------------------------------------------------

/// Result of a mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A transaction committed and bumped the generation to this value
    Applied(Generation),
    /// Nothing changed; the generation is the one observed
    Unchanged(Generation),
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }

    pub fn generation(&self) -> Generation {
        match self {
            WriteOutcome::Applied(g) | WriteOutcome::Unchanged(g) => *g,
        }
    }
}

/// Outcome of `record_build`: the stored row plus whether it was new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildWrite {
    pub outcome: WriteOutcome,
    pub build: BuildRecord,
}

/// Position in a `list_builds` listing (completion time desc, build id desc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCursor {
    pub completed_at: DateTime<Utc>,
    pub build_id: BuildId,
}

impl BuildCursor {
    /// Whether `build` sorts strictly after this cursor.
    pub fn precedes(&self, build: &BuildRecord) -> bool {
        (build.completed_at, build.build_id) < (self.completed_at, self.build_id)
    }
}

impl fmt::Display for BuildCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.completed_at.timestamp_micros(), self.build_id)
    }
}

impl FromStr for BuildCursor {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidCursor {
            cursor: s.to_string(),
        };
        let (micros, id) = s.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let completed_at = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let build_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(BuildCursor {
            completed_at,
            build_id: BuildId(build_id),
        })
    }
}

/// Parameters of a `list_builds` page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListBuildsQuery {
    pub cursor: Option<BuildCursor>,
    pub limit: usize,
    pub include_failed: bool,
    /// Only builds published on this channel
    pub channel: Option<Channel>,
}

impl Default for ListBuildsQuery {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 25,
            include_failed: false,
            channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPage {
    pub builds: Vec<BuildRecord>,
    /// Present when more builds may follow
    pub next_cursor: Option<BuildCursor>,
}
