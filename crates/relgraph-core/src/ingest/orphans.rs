//! Bounded buffer for builds whose commit has not been ingested yet.

use std::collections::VecDeque;
use std::time::Duration;

use relgraph_state::{CommitHash, NewBuild};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanEntry {
    pub build: NewBuild,
    pub received_at: Instant,
}

/// FIFO of pending builds with a capacity and a per-entry timeout.
#[derive(Debug)]
pub struct OrphanBuffer {
    capacity: usize,
    timeout: Duration,
    entries: VecDeque<OrphanEntry>,
}

impl OrphanBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            timeout,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer `build`, returning the oldest entry if it had to be evicted.
    ///
    /// A build identical to one already buffered is not added twice.
    pub fn push(&mut self, build: NewBuild, now: Instant) -> Option<OrphanEntry> {
        if self.entries.iter().any(|e| e.build == build) {
            return None;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(OrphanEntry {
            build,
            received_at: now,
        });
        evicted
    }

    /// Remove and return, in arrival order, every build waiting on `commit`.
    pub fn take_for_commit(&mut self, commit: &CommitHash) -> Vec<NewBuild> {
        let (matched, kept): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|e| &e.build.commit == commit);
        self.entries = kept;
        matched.into_iter().map(|e| e.build).collect()
    }

    /// Remove entries that have waited at least the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<OrphanEntry> {
        let timeout = self.timeout;
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|e| now.saturating_duration_since(e.received_at) >= timeout);
        self.entries = kept;
        expired.into_iter().collect()
    }
}
