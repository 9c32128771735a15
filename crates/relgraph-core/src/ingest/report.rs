//! Data-quality reports raised during ingestion.

use relgraph_state::{ArtifactId, CommitHash, RepositoryId};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// The commit did not arrive within the orphan timeout
    Timeout,
    /// Evicted to make room in a full buffer
    Overflow,
}

impl OrphanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanReason::Timeout => "timeout",
            OrphanReason::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestReport {
    OrphanBuild {
        repository: RepositoryId,
        artifact: ArtifactId,
        commit: CommitHash,
        version: String,
        reason: OrphanReason,
    },
    CorruptHistory {
        repository: RepositoryId,
        commit: String,
        parent: String,
    },
    BuildRejected {
        repository: RepositoryId,
        artifact: ArtifactId,
        commit: CommitHash,
        version: String,
        reason: String,
    },
    CommitRejected {
        repository: RepositoryId,
        commit: CommitHash,
        reason: String,
    },
}

impl IngestReport {
    pub fn repository(&self) -> &RepositoryId {
        match self {
            IngestReport::OrphanBuild { repository, .. }
            | IngestReport::CorruptHistory { repository, .. }
            | IngestReport::BuildRejected { repository, .. }
            | IngestReport::CommitRejected { repository, .. } => repository,
        }
    }
}

/// Receiver of ingestion reports.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: IngestReport);
}

/// Logs every report as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn report(&self, report: IngestReport) {
        match &report {
            IngestReport::OrphanBuild {
                repository,
                artifact,
                commit,
                version,
                reason,
            } => obs::emit_orphan_build(
                repository.as_str(),
                artifact.as_str(),
                version,
                commit.as_str(),
                reason.as_str(),
            ),
            IngestReport::CorruptHistory {
                repository,
                commit,
                parent,
            } => obs::emit_corrupt_history(repository.as_str(), commit, parent),
            IngestReport::BuildRejected {
                repository,
                artifact,
                version,
                reason,
                ..
            } => obs::emit_rejected(
                repository.as_str(),
                &format!("{artifact}@{version}"),
                reason,
            ),
            IngestReport::CommitRejected {
                repository,
                commit,
                reason,
            } => obs::emit_rejected(repository.as_str(), commit.as_str(), reason),
        }
    }
}

/// Forwards reports to a channel, and optionally to a second sink.
pub struct ChannelReportSink {
    tx: mpsc::UnboundedSender<IngestReport>,
    also: Option<Box<dyn ReportSink>>,
}

impl ChannelReportSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IngestReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, also: None }, rx)
    }

    /// Also log reports through `sink`.
    pub fn with_inner(mut self, sink: impl ReportSink + 'static) -> Self {
        self.also = Some(Box::new(sink));
        self
    }
}

impl ReportSink for ChannelReportSink {
    fn report(&self, report: IngestReport) {
        if let Some(inner) = &self.also {
            inner.report(report.clone());
        }
        // a dropped receiver only means nobody is listening
        let _ = self.tx.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_reports() {
        let (sink, mut rx) = ChannelReportSink::new();
        let sink = sink.with_inner(TracingReportSink);
        sink.report(IngestReport::CorruptHistory {
            repository: RepositoryId::new("core"),
            commit: "bbbb".into(),
            parent: "aaaa".into(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.repository().as_str(), "core");
    }

    #[test]
    fn reports_serialize_with_kind_tag() {
        let report = IngestReport::CommitRejected {
            repository: RepositoryId::new("core"),
            commit: CommitHash::parse("abcd").unwrap(),
            reason: "missing parent".into(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "commit_rejected");
        assert_eq!(json["commit"], "abcd");
    }
}
