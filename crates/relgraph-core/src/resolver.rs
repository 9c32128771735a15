//! Version Resolver
//!
//! Stateless: every call reads the store and computes the build that
//! satisfies a [`ResolutionRequest`]. Candidates are ordered by version
//! precedence, then most recent completion, then build id.

use std::cmp::Ordering;
use std::sync::Arc;

use relgraph_state::{
    ArtifactId, BuildRecord, MetadataStore, RefRecord, RepositoryId, StorageResult,
};
use tracing::{debug, instrument};

use crate::request::ResolutionRequest;
use crate::version::Precedence;

/// A build selected by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub build: BuildRecord,
    /// Ordering fell back to byte-wise comparison for some candidate
    pub approximate: bool,
}

#[derive(Clone)]
pub struct VersionResolver {
    store: Arc<dyn MetadataStore>,
}

impl VersionResolver {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(artifact = %artifact, request = %request))]
    pub async fn resolve(
        &self,
        artifact: &ArtifactId,
        request: &ResolutionRequest,
    ) -> StorageResult<Option<Resolved>> {
        match request {
            ResolutionRequest::Exact(version) => Ok(self
                .store
                .find_build(artifact, version)
                .await?
                .map(|build| Resolved {
                    build,
                    approximate: false,
                })),
            ResolutionRequest::Range(range) => {
                let mut approximate = false;
                let candidates: Vec<BuildRecord> = self
                    .store
                    .successful_builds(artifact, None)
                    .await?
                    .into_iter()
                    .filter(|b| {
                        let m = range.evaluate(&b.version);
                        approximate |= m.matched && m.approximate;
                        m.matched
                    })
                    .collect();
                Ok(select_latest(candidates).map(|mut r| {
                    r.approximate |= approximate;
                    r
                }))
            }
            ResolutionRequest::Latest => {
                let candidates = self.store.successful_builds(artifact, None).await?;
                Ok(select_latest(candidates))
            }
            ResolutionRequest::LatestOnChannel(channel) => {
                let candidates = self.store.successful_builds(artifact, Some(channel)).await?;
                Ok(select_latest(candidates))
            }
            ResolutionRequest::LatestOnRef(name) => self.latest_on_ref(artifact, name).await,
        }
    }

    async fn latest_on_ref(
        &self,
        artifact: &ArtifactId,
        name: &str,
    ) -> StorageResult<Option<Resolved>> {
        let Some(record) = self.store.get_artifact(artifact).await? else {
            return Ok(None);
        };
        let Some(reference) = self.lookup_ref(&record.repository, name).await? else {
            debug!(ref_name = name, "unknown ref");
            return Ok(None);
        };

        let candidates: Vec<BuildRecord> = self
            .store
            .successful_builds(artifact, None)
            .await?
            .into_iter()
            .filter(|b| b.repository == record.repository)
            .collect();
        let (ordered, precedence) = order_descending(candidates);
        for build in ordered {
            if self
                .store
                .is_ancestor(&record.repository, &build.commit, &reference.target)
                .await?
            {
                return Ok(Some(Resolved {
                    build,
                    approximate: precedence.is_approximate(),
                }));
            }
        }
        Ok(None)
    }

    /// Find a ref by name as given, then as a branch, then as a tag.
    pub async fn lookup_ref(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> StorageResult<Option<RefRecord>> {
        for candidate in ref_name_candidates(name) {
            if let Some(found) = self.store.get_ref(repository, &candidate).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// Full ref names tried for a user-supplied name, in order.
pub fn ref_name_candidates(name: &str) -> Vec<String> {
    if name.starts_with("refs/") {
        return vec![name.to_string()];
    }
    vec![
        name.to_string(),
        format!("refs/heads/{name}"),
        format!("refs/tags/{name}"),
    ]
}

fn compare(precedence: Precedence, a: &BuildRecord, b: &BuildRecord) -> Ordering {
    precedence
        .compare(&a.version, &b.version)
        .then_with(|| a.completed_at.cmp(&b.completed_at))
        .then_with(|| a.build_id.cmp(&b.build_id))
}

/// Sort builds best-first and report the precedence mode used.
pub fn order_descending(mut builds: Vec<BuildRecord>) -> (Vec<BuildRecord>, Precedence) {
    let precedence = Precedence::for_versions(builds.iter().map(|b| b.version.as_str()));
    builds.sort_by(|a, b| compare(precedence, b, a));
    (builds, precedence)
}

/// The best build of a candidate set.
pub fn select_latest(builds: Vec<BuildRecord>) -> Option<Resolved> {
    let precedence = Precedence::for_versions(builds.iter().map(|b| b.version.as_str()));
    builds
        .into_iter()
        .max_by(|a, b| compare(precedence, a, b))
        .map(|build| Resolved {
            build,
            approximate: precedence.is_approximate(),
        })
}
