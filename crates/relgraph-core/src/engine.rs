//! Query facade over the resolver, the cache and the store.

use std::cmp::Ordering;
use std::sync::Arc;

use relgraph_state::{
    ArtifactId, BuildCursor, BuildPage, BuildRecord, Channel, CommitHash, CommitRecord, Generation,
    ListBuildsQuery, MetadataStore, RefMovementRecord, RefRecord, RepositoryId, WriteOutcome,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::cache::{fingerprint, ResolutionCache};
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::obs;
use crate::request::ResolutionRequest;
use crate::resolver::{ref_name_candidates, VersionResolver};
use crate::version::Precedence;

/// Resolution attempts before giving up on a store that keeps changing.
pub const MAX_RESOLVE_ATTEMPTS: usize = 4;

pub const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub build: BuildRecord,
    pub approximate: bool,
    /// Store generation the answer was computed at
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Found(Resolution),
    NotFound,
}

impl ResolveOutcome {
    pub fn found(&self) -> Option<&Resolution> {
        match self {
            ResolveOutcome::Found(r) => Some(r),
            ResolveOutcome::NotFound => None,
        }
    }
}

/// A page request as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub include_failed: bool,
    pub channel: Option<String>,
}

/// Commits that went into a version since the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Changelog {
    pub artifact: ArtifactId,
    pub version: String,
    /// Next-lower successful version, if any
    pub base_version: Option<String>,
    /// Newest first
    pub commits: Vec<CommitRecord>,
    pub truncated: bool,
}

pub struct Engine {
    store: Arc<dyn MetadataStore>,
    resolver: VersionResolver,
    cache: ResolutionCache,
    max_page_size: usize,
}

impl Engine {
    pub fn new(store: Arc<dyn MetadataStore>, cache_capacity: usize, max_page_size: usize) -> Self {
        Self {
            resolver: VersionResolver::new(store.clone()),
            store,
            cache: ResolutionCache::new(cache_capacity),
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn MetadataStore>, config: &QueryConfig) -> Self {
        Self::new(store, config.cache_capacity, config.max_page_size)
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Parse and resolve a version expression for an artifact.
    pub async fn resolve_version(
        &self,
        artifact: &str,
        expression: &str,
    ) -> Result<ResolveOutcome, QueryError> {
        let artifact = ArtifactId::parse(artifact)?;
        let request = ResolutionRequest::parse(expression)?;
        self.resolve(&artifact, &request).await
    }

    /// Resolve against a single store generation, using the cache when valid.
    #[instrument(skip_all, fields(artifact = %artifact, request = %request))]
    pub async fn resolve(
        &self,
        artifact: &ArtifactId,
        request: &ResolutionRequest,
    ) -> Result<ResolveOutcome, QueryError> {
        let key = fingerprint(artifact, request);
        let request_text = request.to_string();
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let before = self.store.generation().await?;
            if let Some(hit) = self.cache.get(&key, before) {
                emit(artifact, &request_text, &hit, true);
                return Ok(hit);
            }

            let resolved = self.resolver.resolve(artifact, request).await?;
            let after = self.store.generation().await?;
            if before != after {
                debug!(attempt, %before, %after, "generation moved during resolution");
                continue;
            }

            let outcome = match resolved {
                Some(r) => ResolveOutcome::Found(Resolution {
                    build: r.build,
                    approximate: r.approximate,
                    generation: before,
                }),
                None => ResolveOutcome::NotFound,
            };
            self.cache.put(key, before, outcome.clone());
            emit(artifact, &request_text, &outcome, false);
            return Ok(outcome);
        }
        Err(QueryError::Contended {
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }

    /// Page through an artifact's builds, newest completion first.
    pub async fn list_builds(
        &self,
        artifact: &str,
        page: &PageRequest,
    ) -> Result<BuildPage, QueryError> {
        let artifact = ArtifactId::parse(artifact)?;
        let cursor = page
            .cursor
            .as_deref()
            .map(str::parse::<BuildCursor>)
            .transpose()?;
        let channel = page.channel.as_deref().map(Channel::parse).transpose()?;
        let query = ListBuildsQuery {
            cursor,
            limit: page
                .limit
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, self.max_page_size),
            include_failed: page.include_failed,
            channel,
        };
        Ok(self.store.list_builds(&artifact, &query).await?)
    }

    /// Commits reachable from `version`'s commit but not from the commit of
    /// the next-lower successful version, newest first.
    pub async fn changelog(
        &self,
        artifact: &str,
        version: &str,
        limit: usize,
    ) -> Result<Option<Changelog>, QueryError> {
        let artifact = ArtifactId::parse(artifact)?;
        let Some(build) = self.store.find_build(&artifact, version.trim()).await? else {
            return Ok(None);
        };

        let siblings: Vec<BuildRecord> = self
            .store
            .successful_builds(&artifact, None)
            .await?
            .into_iter()
            .filter(|b| b.repository == build.repository)
            .collect();
        let precedence = Precedence::for_versions(siblings.iter().map(|b| b.version.as_str()));
        let base = siblings
            .into_iter()
            .filter(|b| precedence.compare(&b.version, &build.version) == Ordering::Less)
            .max_by(|a, b| {
                precedence
                    .compare(&a.version, &b.version)
                    .then_with(|| a.completed_at.cmp(&b.completed_at))
            });

        let mut commits = self
            .store
            .commits_between(
                &build.repository,
                base.as_ref().map(|b| &b.commit),
                &build.commit,
                limit.saturating_add(1),
            )
            .await?;
        let truncated = commits.len() > limit;
        commits.truncate(limit);
        Ok(Some(Changelog {
            artifact,
            version: build.version,
            base_version: base.map(|b| b.version),
            commits,
            truncated,
        }))
    }

    /// Movement log of a ref, accepting short names like `main`.
    pub async fn ref_history(
        &self,
        repository: &str,
        name: &str,
    ) -> Result<Vec<RefMovementRecord>, QueryError> {
        let repository = RepositoryId::new(repository);
        for candidate in ref_name_candidates(name) {
            let history = self.store.ref_history(&repository, &candidate).await?;
            if !history.is_empty() {
                return Ok(history);
            }
        }
        Ok(Vec::new())
    }

    pub async fn refs(&self, repository: &str) -> Result<Vec<RefRecord>, QueryError> {
        Ok(self.store.list_refs(&RepositoryId::new(repository)).await?)
    }

    /// Builds produced from one commit, successful or not.
    pub async fn builds_for_commit(
        &self,
        repository: &str,
        commit: &str,
    ) -> Result<Vec<BuildRecord>, QueryError> {
        let commit = CommitHash::parse(commit)?;
        Ok(self
            .store
            .builds_for_commit(&RepositoryId::new(repository), &commit)
            .await?)
    }

    /// Soft-deactivate an artifact. Its builds stay queryable; new build
    /// notifications for it are rejected.
    pub async fn deactivate_artifact(&self, artifact: &str) -> Result<WriteOutcome, QueryError> {
        let artifact = ArtifactId::parse(artifact)?;
        let outcome = self.store.deactivate_artifact(&artifact).await?;
        if outcome.is_applied() {
            info!(artifact = %artifact, generation = %outcome.generation(), "artifact deactivated");
        }
        Ok(outcome)
    }
}

fn emit(artifact: &ArtifactId, request: &str, outcome: &ResolveOutcome, cached: bool) {
    let version = outcome.found().map(|r| r.build.version.as_str());
    obs::emit_resolution(artifact.as_str(), request, version, cached);
}
