//! In-memory commit source for tests and embedding.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use relgraph_state::CommitHash;

use super::{CommitSource, SourceCommit};
use crate::error::VcsError;

#[derive(Default)]
struct SourceState {
    commits: HashMap<CommitHash, SourceCommit>,
    refs: BTreeMap<String, CommitHash>,
    failures_left: u32,
}

/// A commit graph held in memory. Parents need not be present, which lets
/// tests model a corrupt repository.
pub struct MemoryCommitSource {
    name: String,
    state: Mutex<SourceState>,
}

impl MemoryCommitSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SourceState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_commit(&self, commit: SourceCommit) {
        self.lock().commits.insert(commit.hash.clone(), commit);
    }

    pub fn set_ref(&self, name: impl Into<String>, target: CommitHash) {
        self.lock().refs.insert(name.into(), target);
    }

    pub fn delete_ref(&self, name: &str) {
        self.lock().refs.remove(name);
    }

    /// Forget a commit, as `git gc` does for unreachable objects.
    pub fn prune_commit(&self, hash: &CommitHash) {
        self.lock().commits.remove(hash);
    }

    /// Make the next `count` calls fail with `RepositoryUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_left = count;
    }

    fn guard(&self) -> Result<MutexGuard<'_, SourceState>, VcsError> {
        let mut state = self.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(VcsError::RepositoryUnavailable {
                repository: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(state)
    }
}

fn reachable(state: &SourceState, roots: &[CommitHash]) -> HashSet<CommitHash> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<CommitHash> = roots.iter().cloned().collect();
    while let Some(hash) = queue.pop_front() {
        if !seen.insert(hash.clone()) {
            continue;
        }
        if let Some(commit) = state.commits.get(&hash) {
            queue.extend(commit.parents.iter().cloned());
        }
    }
    seen
}

#[async_trait]
impl CommitSource for MemoryCommitSource {
    async fn ref_targets(&self) -> Result<BTreeMap<String, CommitHash>, VcsError> {
        Ok(self.guard()?.refs.clone())
    }

    async fn commits_between(
        &self,
        include: &CommitHash,
        exclude: &[CommitHash],
        limit: usize,
    ) -> Result<Vec<SourceCommit>, VcsError> {
        let state = self.guard()?;
        let hidden = reachable(&state, exclude);
        let wanted: HashSet<CommitHash> = reachable(&state, std::slice::from_ref(include))
            .into_iter()
            .filter(|h| !hidden.contains(h) && state.commits.contains_key(h))
            .collect();

        // Kahn's algorithm; ties broken by author time then hash.
        let mut pending: HashMap<&CommitHash, usize> = HashMap::new();
        let mut children: HashMap<&CommitHash, Vec<&CommitHash>> = HashMap::new();
        for hash in &wanted {
            let commit = &state.commits[hash];
            let in_set: Vec<&CommitHash> =
                commit.parents.iter().filter(|p| wanted.contains(*p)).collect();
            pending.insert(hash, in_set.len());
            for parent in in_set {
                children.entry(parent).or_default().push(hash);
            }
        }
        let key = |h: &CommitHash| (state.commits[h].authored_at, h.clone());
        let mut ready: BTreeSet<_> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(h, _)| key(*h))
            .collect();

        let mut ordered = Vec::new();
        while let Some(next) = ready.pop_first() {
            if ordered.len() == limit {
                break;
            }
            let hash = next.1;
            if let Some(kids) = children.get(&hash) {
                for child in kids {
                    if let Some(n) = pending.get_mut(*child) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(key(*child));
                        }
                    }
                }
            }
            ordered.push(state.commits[&hash].clone());
        }
        Ok(ordered)
    }

    async fn commit(&self, hash: &CommitHash) -> Result<Option<SourceCommit>, VcsError> {
        Ok(self.guard()?.commits.get(hash).cloned())
    }

    async fn is_ancestor(
        &self,
        ancestor: &CommitHash,
        descendant: &CommitHash,
    ) -> Result<bool, VcsError> {
        let state = self.guard()?;
        Ok(reachable(&state, std::slice::from_ref(descendant)).contains(ancestor))
    }
}
