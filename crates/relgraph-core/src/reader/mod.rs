//! Commit Graph Reader
//!
//! Turns a version-control source into a restartable stream of
//! `NewCommit` / `RefUpdate` events. Positions advance only when a batch is
//! acknowledged, so re-polling after a failed apply re-emits the same events.
//!
//! Within a batch every `NewCommit` follows all of its parents (already
//! acknowledged or earlier in the batch), and a `RefUpdate` follows every
//! commit it can reach that was not emitted before.

pub mod git_cli;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relgraph_state::{
    CommitHash, CommitRecord, RefKind, RefMovement, RefMovementKind, RepositoryId,
};
use tracing::{debug, instrument, warn};

use crate::error::VcsError;
use crate::retry::RetryPolicy;

pub use git_cli::GitCliSource;
pub use memory::MemoryCommitSource;

/// A commit as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCommit {
    pub hash: CommitHash,
    pub parents: Vec<CommitHash>,
    pub author: String,
    pub authored_at: DateTime<Utc>,
    pub summary: String,
}

impl SourceCommit {
    fn into_record(self, repository: &RepositoryId) -> CommitRecord {
        CommitRecord {
            repository: repository.clone(),
            hash: self.hash,
            parents: self.parents,
            author: self.author,
            authored_at: self.authored_at,
            summary: self.summary,
        }
    }
}

/// Read-only access to one repository's commits and refs.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// Current target of every branch and tag, keyed by full ref name.
    async fn ref_targets(&self) -> Result<BTreeMap<String, CommitHash>, VcsError>;

    /// Commits reachable from `include` but from none of `exclude`,
    /// parents before children, at most `limit`.
    async fn commits_between(
        &self,
        include: &CommitHash,
        exclude: &[CommitHash],
        limit: usize,
    ) -> Result<Vec<SourceCommit>, VcsError>;

    /// One commit by hash; `None` when the source does not have it.
    async fn commit(&self, hash: &CommitHash) -> Result<Option<SourceCommit>, VcsError>;

    /// Whether the source still has `hash` (it may have been pruned).
    async fn has_commit(&self, hash: &CommitHash) -> Result<bool, VcsError> {
        Ok(self.commit(hash).await?.is_some())
    }

    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, VcsError>;
}

/// A normalized reader event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    NewCommit(CommitRecord),
    RefUpdate(RefMovement),
}

/// Opaque acknowledgement token for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollCursor(u64);

#[derive(Debug, Clone)]
pub struct PollBatch {
    pub repository: RepositoryId,
    pub events: Vec<ReaderEvent>,
    pub cursor: PollCursor,
    /// `false` when the commit budget ran out and some ref updates were deferred
    pub complete: bool,
}

#[derive(Debug, Clone, Default)]
struct ReaderState {
    positions: BTreeMap<String, CommitHash>,
    emitted: HashSet<CommitHash>,
    /// Heads of partially emitted histories, used as extra exclusions.
    partial_tips: BTreeSet<CommitHash>,
    /// Positions restored from the store; their whole ancestry is recorded.
    anchors: BTreeSet<CommitHash>,
}

/// Incremental reader over one repository.
pub struct CommitGraphReader {
    repository: RepositoryId,
    source: Arc<dyn CommitSource>,
    max_commits_per_poll: usize,
    retry: RetryPolicy,
    state: ReaderState,
    pending: Option<(PollCursor, ReaderState)>,
    next_cursor: u64,
}

impl CommitGraphReader {
    pub fn new(
        repository: RepositoryId,
        source: Arc<dyn CommitSource>,
        max_commits_per_poll: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            source,
            max_commits_per_poll: max_commits_per_poll.max(1),
            retry,
            state: ReaderState::default(),
            pending: None,
            next_cursor: 0,
        }
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    /// Last acknowledged position of every ref.
    pub fn positions(&self) -> &BTreeMap<String, CommitHash> {
        &self.state.positions
    }

    /// Seed positions from refs already recorded in the store.
    ///
    /// Restored targets and every commit reachable from them count as
    /// emitted. Any unacknowledged batch is discarded.
    pub fn restore(&mut self, positions: impl IntoIterator<Item = (String, CommitHash)>) {
        let mut state = ReaderState::default();
        for (name, target) in positions {
            state.emitted.insert(target.clone());
            state.anchors.insert(target.clone());
            state.positions.insert(name, target);
        }
        self.state = state;
        self.pending = None;
    }

    /// Compute the next batch relative to the last acknowledged state.
    ///
    /// Does not advance any position; see [`CommitGraphReader::acknowledge`].
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn poll(&mut self) -> Result<PollBatch, VcsError> {
        let targets = self.source.ref_targets().await?;
        let mut next = self.state.clone();
        let mut events = Vec::new();
        let mut remaining = self.max_commits_per_poll;
        let mut complete = true;

        let changed = targets
            .iter()
            .any(|(name, target)| next.positions.get(name) != Some(target));
        let mut exclude: BTreeSet<CommitHash> = BTreeSet::new();
        let mut pruned: HashSet<CommitHash> = HashSet::new();
        if changed {
            for hash in next.positions.values().chain(next.partial_tips.iter()) {
                if exclude.contains(hash) || pruned.contains(hash) {
                    continue;
                }
                if self.source.has_commit(hash).await? {
                    exclude.insert(hash.clone());
                } else {
                    pruned.insert(hash.clone());
                }
            }
            if !pruned.is_empty() {
                debug!(count = pruned.len(), "source no longer has some known positions");
                next.anchors.retain(|h| !pruned.contains(h));
                next.partial_tips.retain(|h| !pruned.contains(h));
            }
        }

        for (name, target) in &targets {
            let previous = next.positions.get(name).cloned();
            if previous.as_ref() == Some(target) {
                continue;
            }

            if !next.emitted.contains(target) {
                let mut excluded: Vec<CommitHash> = exclude.iter().cloned().collect();
                let fetched = loop {
                    let page = self
                        .source
                        .commits_between(target, &excluded, remaining + 1)
                        .await?;
                    // a full page of known commits: hide them and fetch past it
                    if page.len() > remaining
                        && page.iter().all(|c| next.emitted.contains(&c.hash))
                    {
                        excluded.extend(heads(&page));
                        continue;
                    }
                    break page;
                };
                let truncated = fetched.len() > remaining;
                let mut emitted_here = Vec::new();
                let mut exhausted = false;

                for commit in fetched.into_iter().take(remaining) {
                    if !self
                        .emit_closure(
                            commit,
                            &mut next,
                            &mut events,
                            &mut remaining,
                            &mut emitted_here,
                        )
                        .await?
                    {
                        exhausted = true;
                        break;
                    }
                }
                if !truncated && !exhausted && !next.emitted.contains(target) {
                    let tip = self.resolve_commit(target, target).await?;
                    exhausted = !self
                        .emit_closure(
                            tip,
                            &mut next,
                            &mut events,
                            &mut remaining,
                            &mut emitted_here,
                        )
                        .await?;
                }
                if truncated || exhausted {
                    debug!(
                        ref_name = %name,
                        emitted = emitted_here.len(),
                        "commit budget exhausted, deferring ref update"
                    );
                    next.partial_tips.extend(heads(&emitted_here));
                    complete = false;
                    break;
                }
            }

            let movement = match &previous {
                None => RefMovementKind::Created,
                Some(old) if pruned.contains(old) => RefMovementKind::Rewrite,
                Some(old) => {
                    if self.source.is_ancestor(old, target).await? {
                        RefMovementKind::FastForward
                    } else {
                        RefMovementKind::Rewrite
                    }
                }
            };
            events.push(ReaderEvent::RefUpdate(RefMovement {
                repository: self.repository.clone(),
                name: name.clone(),
                kind: RefKind::of(name),
                old_target: previous,
                new_target: Some(target.clone()),
                movement,
            }));
            next.positions.insert(name.clone(), target.clone());
            exclude.insert(target.clone());
        }

        let gone: Vec<String> = next
            .positions
            .keys()
            .filter(|name| !targets.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            let old = next.positions.remove(&name);
            events.push(ReaderEvent::RefUpdate(RefMovement {
                repository: self.repository.clone(),
                kind: RefKind::of(&name),
                name,
                old_target: old,
                new_target: None,
                movement: RefMovementKind::Deleted,
            }));
        }

        if complete {
            next.partial_tips.clear();
        }

        let cursor = PollCursor(self.next_cursor);
        self.next_cursor += 1;
        self.pending = Some((cursor, next));
        Ok(PollBatch {
            repository: self.repository.clone(),
            events,
            cursor,
            complete,
        })
    }

    /// Advance positions to those of the batch identified by `cursor`.
    ///
    /// Returns `false` for a cursor that is not the latest batch.
    pub fn acknowledge(&mut self, cursor: PollCursor) -> bool {
        match self.pending.take() {
            Some((pending, state)) if pending == cursor => {
                self.state = state;
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Emit `root` after any of its ancestors missing from `state.emitted`.
    ///
    /// Returns `false` once the commit budget runs out.
    async fn emit_closure(
        &self,
        root: SourceCommit,
        state: &mut ReaderState,
        events: &mut Vec<ReaderEvent>,
        remaining: &mut usize,
        emitted_here: &mut Vec<SourceCommit>,
    ) -> Result<bool, VcsError> {
        let mut visiting: HashSet<CommitHash> = HashSet::new();
        let mut stack: Vec<(SourceCommit, bool)> = vec![(root, false)];

        while let Some((commit, expanded)) = stack.pop() {
            if state.emitted.contains(&commit.hash) {
                continue;
            }
            if !expanded {
                visiting.insert(commit.hash.clone());
                let missing: Vec<CommitHash> = commit
                    .parents
                    .iter()
                    .filter(|p| !state.emitted.contains(*p))
                    .cloned()
                    .collect();
                let child = commit.hash.clone();
                stack.push((commit, true));
                for parent in missing.into_iter().rev() {
                    if visiting.contains(&parent) {
                        return Err(VcsError::CorruptHistory {
                            repository: self.repository.to_string(),
                            commit: child.to_string(),
                            parent: parent.to_string(),
                        });
                    }
                    let resolved = self.resolve_commit(&child, &parent).await?;
                    if self.anchored(&parent, state).await? {
                        state.emitted.insert(parent);
                        continue;
                    }
                    stack.push((resolved, false));
                }
                continue;
            }

            if *remaining == 0 {
                return Ok(false);
            }
            *remaining -= 1;
            visiting.remove(&commit.hash);
            state.emitted.insert(commit.hash.clone());
            emitted_here.push(commit.clone());
            events.push(ReaderEvent::NewCommit(commit.into_record(&self.repository)));
        }
        Ok(true)
    }

    /// Whether `hash` is reachable from a restored position.
    async fn anchored(&self, hash: &CommitHash, state: &ReaderState) -> Result<bool, VcsError> {
        for anchor in &state.anchors {
            if self.source.is_ancestor(hash, anchor).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fetch a commit the batch depends on, retrying with backoff.
    async fn resolve_commit(
        &self,
        child: &CommitHash,
        hash: &CommitHash,
    ) -> Result<SourceCommit, VcsError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_transient = None;
        for attempt in 1..=attempts {
            match self.source.commit(hash).await {
                Ok(Some(commit)) => return Ok(commit),
                Ok(None) => last_transient = None,
                Err(e) if e.is_transient() => last_transient = Some(e),
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
        }
        if let Some(err) = last_transient {
            return Err(err);
        }
        warn!(
            repository = %self.repository,
            commit = %child,
            parent = %hash,
            "parent unresolvable after retries"
        );
        Err(VcsError::CorruptHistory {
            repository: self.repository.to_string(),
            commit: child.to_string(),
            parent: hash.to_string(),
        })
    }
}

/// Commits in `emitted` that no other commit in `emitted` names as a parent.
fn heads(emitted: &[SourceCommit]) -> Vec<CommitHash> {
    let referenced: HashSet<&CommitHash> = emitted.iter().flat_map(|c| c.parents.iter()).collect();
    emitted
        .iter()
        .filter(|c| !referenced.contains(&c.hash))
        .map(|c| c.hash.clone())
        .collect()
}
