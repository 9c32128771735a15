//! Process-wide ingestion and query counters.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits them as a
//! single `tracing::info!` event, e.g. once per daemon tick.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    commits_ingested: AtomicU64,
    ref_moves: AtomicU64,
    builds_recorded: AtomicU64,
    orphan_builds: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commits_ingested: AtomicU64::new(0),
            ref_moves: AtomicU64::new(0),
            builds_recorded: AtomicU64::new(0),
            orphan_builds: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn inc_commits_ingested(&self) {
        self.commits_ingested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits_ingested", "counter incremented");
    }

    pub fn inc_ref_moves(&self) {
        self.ref_moves.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "ref_moves", "counter incremented");
    }

    pub fn inc_builds_recorded(&self) {
        self.builds_recorded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_recorded", "counter incremented");
    }

    pub fn inc_orphan_builds(&self) {
        self.orphan_builds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "orphan_builds", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commits_ingested = self.commits_ingested(),
            ref_moves = self.ref_moves(),
            builds_recorded = self.builds_recorded(),
            orphan_builds = self.orphan_builds(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
        );
    }

    pub fn commits_ingested(&self) -> u64 {
        self.commits_ingested.load(Ordering::Relaxed)
    }

    pub fn ref_moves(&self) -> u64 {
        self.ref_moves.load(Ordering::Relaxed)
    }

    pub fn builds_recorded(&self) -> u64 {
        self.builds_recorded.load(Ordering::Relaxed)
    }

    pub fn orphan_builds(&self) -> u64 {
        self.orphan_builds.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.commits_ingested,
            &self.ref_moves,
            &self.builds_recorded,
            &self.orphan_builds,
            &self.cache_hits,
            &self.cache_misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_commits_ingested();
        m.inc_commits_ingested();
        m.inc_ref_moves();
        m.inc_cache_misses();
        assert_eq!(m.commits_ingested(), 2);
        assert_eq!(m.ref_moves(), 1);
        assert_eq!(m.cache_misses(), 1);
        assert_eq!(m.cache_hits(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_builds_recorded();
        m.inc_orphan_builds();
        m.inc_cache_hits();
        m.reset();
        assert_eq!(m.builds_recorded(), 0);
        assert_eq!(m.orphan_builds(), 0);
        assert_eq!(m.cache_hits(), 0);
    }
}
