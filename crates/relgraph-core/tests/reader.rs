//! Commit Graph Reader behaviour against the in-memory source.

mod common;

use std::sync::Arc;

use common::{chain, hash, source_commit};
use relgraph_core::reader::{CommitGraphReader, MemoryCommitSource, ReaderEvent};
use relgraph_core::{RetryPolicy, VcsError};
use relgraph_state::{CommitHash, RefMovementKind, RepositoryId};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
    }
}

fn reader(source: &Arc<MemoryCommitSource>, budget: usize) -> CommitGraphReader {
    CommitGraphReader::new(RepositoryId::new("core"), source.clone(), budget, fast_retry())
}

fn commits(events: &[ReaderEvent]) -> Vec<CommitHash> {
    events
        .iter()
        .filter_map(|e| match e {
            ReaderEvent::NewCommit(c) => Some(c.hash.clone()),
            ReaderEvent::RefUpdate(_) => None,
        })
        .collect()
}

fn movements(events: &[ReaderEvent]) -> Vec<(String, RefMovementKind)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReaderEvent::RefUpdate(m) => Some((m.name.clone(), m.movement)),
            ReaderEvent::NewCommit(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn first_poll_emits_history_parents_first_then_ref() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.set_ref("refs/heads/main", hash(3));

    let mut reader = reader(&source, 100);
    let batch = reader.poll().await.unwrap();
    assert!(batch.complete);
    assert_eq!(commits(&batch.events), vec![hash(1), hash(2), hash(3)]);
    assert!(matches!(batch.events.last(), Some(ReaderEvent::RefUpdate(_))));
    assert_eq!(
        movements(&batch.events),
        vec![("refs/heads/main".to_string(), RefMovementKind::Created)]
    );
}

#[tokio::test]
async fn unacknowledged_batch_is_re_emitted() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 2);
    source.set_ref("refs/heads/main", hash(2));

    let mut reader = reader(&source, 100);
    let first = reader.poll().await.unwrap();
    let again = reader.poll().await.unwrap();
    assert_eq!(first.events, again.events);

    // stale cursor is refused
    assert!(!reader.acknowledge(first.cursor));
    assert!(reader.acknowledge(again.cursor));
    assert_eq!(reader.positions().get("refs/heads/main"), Some(&hash(2)));

    let idle = reader.poll().await.unwrap();
    assert!(idle.events.is_empty());
}

#[tokio::test]
async fn budget_defers_ref_update_until_history_is_complete() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 5);
    source.set_ref("refs/heads/main", hash(5));

    let mut reader = reader(&source, 2);
    let mut seen = Vec::new();
    let mut ref_updates = 0;
    for _ in 0..3 {
        let batch = reader.poll().await.unwrap();
        assert!(batch.events.len() <= 3);
        seen.extend(commits(&batch.events));
        let moves = movements(&batch.events);
        if !batch.complete {
            assert!(moves.is_empty(), "ref update must wait for its commits");
        }
        ref_updates += moves.len();
        assert!(reader.acknowledge(batch.cursor));
    }
    assert_eq!(seen, (1..=5).map(hash).collect::<Vec<_>>());
    assert_eq!(ref_updates, 1);
}

#[tokio::test]
async fn classifies_fast_forward_rewrite_and_delete() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.set_ref("refs/heads/main", hash(3));
    source.set_ref("refs/heads/topic", hash(2));

    let mut reader = reader(&source, 100);
    let batch = reader.poll().await.unwrap();
    reader.acknowledge(batch.cursor);

    // main: 3 -> 5 descends; topic: 2 -> 4 where 4 branches off 1
    source.add_commit(source_commit(4, &[1]));
    source.add_commit(source_commit(5, &[3]));
    source.set_ref("refs/heads/main", hash(5));
    source.set_ref("refs/heads/topic", hash(4));
    let batch = reader.poll().await.unwrap();
    assert_eq!(commits(&batch.events), vec![hash(5), hash(4)]);
    assert_eq!(
        movements(&batch.events),
        vec![
            ("refs/heads/main".to_string(), RefMovementKind::FastForward),
            ("refs/heads/topic".to_string(), RefMovementKind::Rewrite),
        ]
    );
    reader.acknowledge(batch.cursor);

    source.delete_ref("refs/heads/topic");
    let batch = reader.poll().await.unwrap();
    match batch.events.as_slice() {
        [ReaderEvent::RefUpdate(m)] => {
            assert_eq!(m.movement, RefMovementKind::Deleted);
            assert_eq!(m.old_target, Some(hash(4)));
            assert_eq!(m.new_target, None);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn tag_on_known_commit_emits_only_ref_update() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 2);
    source.set_ref("refs/heads/main", hash(2));
    let mut reader = reader(&source, 100);
    let batch = reader.poll().await.unwrap();
    reader.acknowledge(batch.cursor);

    source.set_ref("refs/tags/v1.0.0", hash(1));
    let batch = reader.poll().await.unwrap();
    assert!(commits(&batch.events).is_empty());
    assert_eq!(
        movements(&batch.events),
        vec![("refs/tags/v1.0.0".to_string(), RefMovementKind::Created)]
    );
}

#[tokio::test(start_paused = true)]
async fn unresolvable_parent_is_corrupt_history() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    source.add_commit(source_commit(2, &[99]));
    source.set_ref("refs/heads/main", hash(2));

    let mut reader = reader(&source, 100);
    let err = reader.poll().await.unwrap_err();
    match err {
        VcsError::CorruptHistory { commit, parent, .. } => {
            assert_eq!(commit, hash(2).to_string());
            assert_eq!(parent, hash(99).to_string());
        }
        other => panic!("expected corrupt history, got {other:?}"),
    }
}

#[tokio::test]
async fn source_failure_is_transient() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    source.fail_next(1);

    let mut reader = reader(&source, 100);
    assert!(reader.poll().await.unwrap_err().is_transient());
    assert_eq!(commits(&reader.poll().await.unwrap().events), vec![hash(1)]);
}

#[tokio::test]
async fn pruned_old_tip_is_dropped_from_exclusions() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 2);
    source.set_ref("refs/heads/main", hash(2));
    let mut reader = reader(&source, 100);
    let batch = reader.poll().await.unwrap();
    assert!(reader.acknowledge(batch.cursor));

    source.add_commit(source_commit(3, &[1]));
    source.set_ref("refs/heads/main", hash(3));
    source.prune_commit(&hash(2));

    let batch = reader.poll().await.unwrap();
    assert_eq!(commits(&batch.events), vec![hash(3)]);
    match batch.events.last() {
        Some(ReaderEvent::RefUpdate(m)) => {
            assert_eq!(m.movement, RefMovementKind::Rewrite);
            assert_eq!(m.old_target, Some(hash(2)));
        }
        other => panic!("expected ref update, got {other:?}"),
    }
}

#[tokio::test]
async fn known_history_beyond_the_budget_is_skipped() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 5);
    source.set_ref("refs/heads/main", hash(5));
    let mut reader = reader(&source, 2);
    loop {
        let batch = reader.poll().await.unwrap();
        assert!(reader.acknowledge(batch.cursor));
        if batch.complete {
            break;
        }
    }

    source.add_commit(source_commit(6, &[4]));
    source.set_ref("refs/heads/main", hash(6));
    source.prune_commit(&hash(5));

    let batch = reader.poll().await.unwrap();
    assert!(batch.complete);
    assert_eq!(commits(&batch.events), vec![hash(6)]);
    assert_eq!(
        movements(&batch.events),
        vec![("refs/heads/main".to_string(), RefMovementKind::Rewrite)]
    );
}

#[tokio::test]
async fn restored_positions_skip_recorded_history() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.add_commit(source_commit(4, &[3]));
    source.add_commit(source_commit(5, &[1]));
    source.set_ref("refs/heads/main", hash(4));
    source.set_ref("refs/heads/topic", hash(5));

    let mut reader = reader(&source, 100);
    reader.restore([
        ("refs/heads/main".to_string(), hash(3)),
        ("refs/heads/topic".to_string(), hash(2)),
    ]);
    let batch = reader.poll().await.unwrap();
    assert_eq!(commits(&batch.events), vec![hash(4), hash(5)]);
    assert_eq!(
        movements(&batch.events),
        vec![
            ("refs/heads/main".to_string(), RefMovementKind::FastForward),
            ("refs/heads/topic".to_string(), RefMovementKind::Rewrite),
        ]
    );
}
