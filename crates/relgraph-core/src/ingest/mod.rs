//! Ingestion Coordinator
//!
//! Applies reader events and build-completion notifications to the
//! [`MetadataStore`](relgraph_state::MetadataStore). One [`RepositoryIngestor`]
//! owns the sequential logic for a repository; [`IngestionCoordinator`] runs
//! one ingestor per tokio task so repositories proceed concurrently while
//! events within a repository are applied in arrival order.

pub mod coordinator;
pub mod orphans;
pub mod report;
pub mod repository;

use chrono::{DateTime, Utc};
use relgraph_state::{
    ArtifactId, BuildRecord, Channel, CommitHash, NewBuild, RepositoryId, StorageError,
};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub use coordinator::IngestionCoordinator;
pub use orphans::{OrphanBuffer, OrphanEntry};
pub use report::{ChannelReportSink, IngestReport, OrphanReason, ReportSink, TracingReportSink};
pub use repository::{IngestSettings, RepositoryIngestor};

/// A build-completion notification as delivered by a build pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNotification {
    pub repository: String,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub commit: String,
    pub version: String,
    /// Promotion channel; `snapshot` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

impl BuildNotification {
    /// Validate identifiers and produce the store-level build fact.
    pub fn to_new_build(&self) -> Result<NewBuild, IngestError> {
        let invalid = |e: StorageError| IngestError::InvalidNotification(e.to_string());
        let version = self.version.trim();
        if version.is_empty() {
            return Err(IngestError::InvalidNotification(
                "version must not be blank".to_string(),
            ));
        }
        if self.repository.trim().is_empty() {
            return Err(IngestError::InvalidNotification(
                "repository must not be blank".to_string(),
            ));
        }
        let channel = match &self.channel {
            Some(c) => Channel::parse(c).map_err(invalid)?,
            None => Channel::snapshot(),
        };
        Ok(NewBuild {
            artifact: ArtifactId::parse(&self.artifact).map_err(invalid)?,
            display_name: self.display_name.clone(),
            repository: RepositoryId::new(self.repository.trim()),
            commit: CommitHash::parse(&self.commit).map_err(invalid)?,
            version: version.to_string(),
            channel,
            success: self.success,
            completed_at: self.completed_at,
        })
    }
}

/// What happened to a build notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Recorded(BuildRecord),
    /// Identical fact already stored; nothing changed
    AlreadyRecorded(BuildRecord),
    /// Commit not yet known; held in the orphan buffer
    Buffered,
    /// Violates a store invariant; reported and dropped
    Rejected { reason: String },
}

/// Counts for one applied poll batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub commits: usize,
    pub ref_updates: usize,
    pub builds_drained: usize,
    /// `false` when more history remains for the next poll
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Applied(PollSummary),
    /// Skipped after transient failures; retried at the next trigger
    Deferred { attempts: u32, reason: String },
}
