//! Ingestion: idempotence, generation accounting, orphan builds and halting.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{chain, hash, notification, record, ref_move, source_commit, FlakyStore};
use relgraph_core::ingest::{
    ChannelReportSink, IngestReport, IngestSettings, OrphanReason, RepositoryIngestor,
};
use relgraph_core::reader::MemoryCommitSource;
use relgraph_core::{
    BuildOutcome, IngestError, IngestionCoordinator, PollOutcome, RetryPolicy, VcsError,
};
use relgraph_state::{
    ArtifactId, Generation, ListBuildsQuery, MemoryMetadataStore, MetadataStore,
    RefMovementKind, RepositoryId,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn settings() -> IngestSettings {
    IngestSettings {
        orphan_timeout: Duration::from_secs(60),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        },
        ..IngestSettings::default()
    }
}

fn ingestor(
    source: &Arc<MemoryCommitSource>,
    store: Arc<dyn MetadataStore>,
    settings: IngestSettings,
) -> (RepositoryIngestor, UnboundedReceiver<IngestReport>) {
    let (sink, rx) = ChannelReportSink::new();
    let ingestor = RepositoryIngestor::new(
        RepositoryId::new("core"),
        source.clone(),
        store,
        Arc::new(sink),
        settings,
    );
    (ingestor, rx)
}

fn widget() -> ArtifactId {
    ArtifactId::parse("org:widget").unwrap()
}

async fn visible_builds(store: &dyn MetadataStore) -> usize {
    store
        .list_builds(&widget(), &ListBuildsQuery::default())
        .await
        .unwrap()
        .builds
        .len()
}

fn applied(outcome: PollOutcome) -> relgraph_core::PollSummary {
    match outcome {
        PollOutcome::Applied(summary) => summary,
        other => panic!("expected applied poll, got {other:?}"),
    }
}

#[tokio::test]
async fn poll_applies_commits_and_refs_with_one_generation_each() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.set_ref("refs/heads/main", hash(3));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());

    let summary = applied(ingestor.poll().await.unwrap());
    assert_eq!((summary.commits, summary.ref_updates), (3, 1));
    assert_eq!(store.generation().await.unwrap(), Generation(4));
    let main = store
        .get_ref(&RepositoryId::new("core"), "refs/heads/main")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(main.target, hash(3));
}

#[tokio::test]
async fn re_ingesting_the_same_history_changes_nothing() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.set_ref("refs/heads/main", hash(3));
    let store = Arc::new(MemoryMetadataStore::new());

    let (mut first, _rx1) = ingestor(&source, store.clone(), settings());
    applied(first.poll().await.unwrap());
    let generation = store.generation().await.unwrap();

    for n in 1..=3 {
        let parents: Vec<u32> = (n > 1).then(|| n - 1).into_iter().collect();
        let outcome = store.insert_commit(&record("core", n, &parents)).await.unwrap();
        assert!(!outcome.is_applied());
    }
    let again = ref_move("core", "refs/heads/main", None, Some(3), RefMovementKind::Created);
    assert!(!store.apply_ref_movement(&again).await.unwrap().is_applied());
    assert_eq!(store.generation().await.unwrap(), generation);

    // a restarted ingestor resumes from the recorded positions
    let (mut second, _rx2) = ingestor(&source, store.clone(), settings());
    let summary = applied(second.poll().await.unwrap());
    assert_eq!((summary.commits, summary.ref_updates), (0, 0));
    assert_eq!(store.generation().await.unwrap(), generation);
    let history = store
        .ref_history(&RepositoryId::new("core"), "refs/heads/main")
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn restart_classifies_moves_made_while_down() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 3);
    source.set_ref("refs/heads/main", hash(3));
    source.set_ref("refs/heads/topic", hash(2));
    let store = Arc::new(MemoryMetadataStore::new());
    let repo = RepositoryId::new("core");

    let (mut first, _rx1) = ingestor(&source, store.clone(), settings());
    applied(first.poll().await.unwrap());
    drop(first);

    // force-push main onto a sibling of 2, delete topic, then gc the old tip
    source.add_commit(source_commit(4, &[1]));
    source.set_ref("refs/heads/main", hash(4));
    source.delete_ref("refs/heads/topic");
    source.prune_commit(&hash(3));

    let (mut second, _rx2) = ingestor(&source, store.clone(), settings());
    let summary = applied(second.poll().await.unwrap());
    assert_eq!((summary.commits, summary.ref_updates), (1, 2));

    let main = store.ref_history(&repo, "refs/heads/main").await.unwrap();
    let last = main.last().unwrap();
    assert_eq!(last.movement, RefMovementKind::Rewrite);
    assert_eq!(last.old_target, Some(hash(3)));
    assert_eq!(last.new_target, Some(hash(4)));

    assert!(store.get_ref(&repo, "refs/heads/topic").await.unwrap().is_none());
    let topic = store.ref_history(&repo, "refs/heads/topic").await.unwrap();
    assert_eq!(topic.last().unwrap().movement, RefMovementKind::Deleted);
}

#[tokio::test]
async fn generation_never_decreases() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());

    let mut last = store.generation().await.unwrap();
    source.add_commit(source_commit(1, &[]));
    for n in 2..=6 {
        source.add_commit(source_commit(n, &[n - 1]));
        source.set_ref("refs/heads/main", hash(n));
        applied(ingestor.poll().await.unwrap());
        let now = store.generation().await.unwrap();
        assert!(now > last);
        last = now;

        ingestor
            .notify_build(notification("core", n, &format!("1.0.{n}")).to_new_build().unwrap())
            .await
            .unwrap();
        let now = store.generation().await.unwrap();
        assert!(now > last);
        last = now;
    }
}

#[tokio::test]
async fn build_for_known_commit_is_recorded_and_redelivery_is_noop() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());
    applied(ingestor.poll().await.unwrap());

    let build = notification("core", 1, "1.0.0").to_new_build().unwrap();
    let first = ingestor.notify_build(build.clone()).await.unwrap();
    let BuildOutcome::Recorded(record) = first else {
        panic!("expected recorded, got {first:?}");
    };
    let generation = store.generation().await.unwrap();
    let again = ingestor.notify_build(build).await.unwrap();
    assert_eq!(again, BuildOutcome::AlreadyRecorded(record));
    assert_eq!(store.generation().await.unwrap(), generation);
}

#[tokio::test]
async fn duplicate_version_is_rejected_and_reported() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 2);
    source.set_ref("refs/heads/main", hash(2));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, mut rx) = ingestor(&source, store.clone(), settings());
    applied(ingestor.poll().await.unwrap());

    ingestor
        .notify_build(notification("core", 1, "1.0.0").to_new_build().unwrap())
        .await
        .unwrap();
    let outcome = ingestor
        .notify_build(notification("core", 2, "1.0.0").to_new_build().unwrap())
        .await
        .unwrap();
    assert!(matches!(outcome, BuildOutcome::Rejected { .. }));
    assert!(matches!(
        rx.try_recv().unwrap(),
        IngestReport::BuildRejected { ref version, .. } if version == "1.0.0"
    ));
}

#[tokio::test]
async fn buffered_build_lands_when_its_commit_arrives() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());
    applied(ingestor.poll().await.unwrap());

    let outcome = ingestor
        .notify_build(notification("core", 2, "1.1.0").to_new_build().unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, BuildOutcome::Buffered);
    assert_eq!(ingestor.orphan_count(), 1);
    assert_eq!(visible_builds(store.as_ref()).await, 0);

    source.add_commit(source_commit(2, &[1]));
    source.set_ref("refs/heads/main", hash(2));
    let summary = applied(ingestor.poll().await.unwrap());
    assert_eq!(summary.builds_drained, 1);
    assert_eq!(ingestor.orphan_count(), 0);
    assert_eq!(visible_builds(store.as_ref()).await, 1);
}

#[tokio::test(start_paused = true)]
async fn orphan_build_expires_and_never_becomes_visible() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, mut rx) = ingestor(&source, store.clone(), settings());
    applied(ingestor.poll().await.unwrap());

    ingestor
        .notify_build(notification("core", 7, "9.9.9").to_new_build().unwrap())
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(ingestor.sweep_orphans(), 0);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(ingestor.sweep_orphans(), 1);

    match rx.try_recv().unwrap() {
        IngestReport::OrphanBuild {
            commit,
            version,
            reason,
            ..
        } => {
            assert_eq!(commit, hash(7));
            assert_eq!(version, "9.9.9");
            assert_eq!(reason, OrphanReason::Timeout);
        }
        other => panic!("expected orphan report, got {other:?}"),
    }

    // the commit showing up later does not resurrect the dropped build
    source.add_commit(source_commit(7, &[1]));
    source.set_ref("refs/heads/main", hash(7));
    let summary = applied(ingestor.poll().await.unwrap());
    assert_eq!(summary.builds_drained, 0);
    assert_eq!(visible_builds(store.as_ref()).await, 0);
}

#[tokio::test]
async fn full_orphan_buffer_evicts_oldest_with_report() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    let store = Arc::new(MemoryMetadataStore::new());
    let settings = IngestSettings {
        orphan_buffer_capacity: 1,
        ..settings()
    };
    let (mut ingestor, mut rx) = ingestor(&source, store, settings);

    for (commit, version) in [(10, "1.0.0"), (11, "1.1.0")] {
        let outcome = ingestor
            .notify_build(notification("core", commit, version).to_new_build().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Buffered);
    }
    assert_eq!(ingestor.orphan_count(), 1);
    assert!(matches!(
        rx.try_recv().unwrap(),
        IngestReport::OrphanBuild {
            reason: OrphanReason::Overflow,
            ref version,
            ..
        } if version == "1.0.0"
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_source_failures_are_retried_then_deferred() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    let store = Arc::new(MemoryMetadataStore::new());
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());

    source.fail_next(2);
    applied(ingestor.poll().await.unwrap());

    source.add_commit(source_commit(2, &[1]));
    source.set_ref("refs/heads/main", hash(2));
    source.fail_next(10);
    match ingestor.poll().await.unwrap() {
        PollOutcome::Deferred { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected deferral, got {other:?}"),
    }
    source.fail_next(0);
    assert_eq!(applied(ingestor.poll().await.unwrap()).commits, 1);
}

#[tokio::test]
async fn store_outage_defers_poll_and_keeps_events_for_retry() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 2);
    source.set_ref("refs/heads/main", hash(2));
    let store = FlakyStore::new();
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());

    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        ingestor.poll().await.unwrap(),
        PollOutcome::Deferred { .. }
    ));
    let err = ingestor
        .notify_build(notification("core", 1, "1.0.0").to_new_build().unwrap())
        .await;
    // commit 1 was never stored, so the build waits rather than failing
    assert_eq!(err.unwrap(), BuildOutcome::Buffered);

    store.fail_writes.store(false, Ordering::SeqCst);
    let summary = applied(ingestor.poll().await.unwrap());
    assert_eq!((summary.commits, summary.ref_updates), (2, 1));
    assert_eq!(summary.builds_drained, 1);
}

#[tokio::test]
async fn store_outage_on_notify_is_returned_to_caller() {
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    let store = FlakyStore::new();
    let (mut ingestor, _rx) = ingestor(&source, store.clone(), settings());
    applied(ingestor.poll().await.unwrap());

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = ingestor
        .notify_build(notification("core", 1, "1.0.0").to_new_build().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Store(ref e) if e.is_unavailable()));
}

#[tokio::test(start_paused = true)]
async fn corrupt_history_halts_only_that_repository() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let (sink, mut rx) = ChannelReportSink::new();
    let coordinator = IngestionCoordinator::new(store.clone(), Arc::new(sink), settings());

    let healthy = Arc::new(MemoryCommitSource::new("healthy"));
    chain(&healthy, 2);
    healthy.set_ref("refs/heads/main", hash(2));
    let broken = Arc::new(MemoryCommitSource::new("broken"));
    broken.add_commit(source_commit(5, &[4]));
    broken.set_ref("refs/heads/main", hash(5));

    coordinator
        .register(RepositoryId::new("healthy"), healthy.clone())
        .await;
    coordinator
        .register(RepositoryId::new("broken"), broken.clone())
        .await;

    let results = coordinator.poll_all().await;
    for (repository, result) in &results {
        match repository.as_str() {
            "healthy" => assert!(matches!(result, Ok(PollOutcome::Applied(_)))),
            "broken" => assert!(matches!(
                result,
                Err(IngestError::Vcs(VcsError::CorruptHistory { .. }))
            )),
            other => panic!("unexpected repository {other}"),
        }
    }
    assert!(matches!(
        rx.recv().await.unwrap(),
        IngestReport::CorruptHistory { ref repository, .. } if repository.as_str() == "broken"
    ));

    let broken_again = coordinator
        .poll_repository(&RepositoryId::new("broken"))
        .await;
    assert!(matches!(broken_again, Err(IngestError::RepositoryHalted(_))));

    let build = coordinator
        .notify_build_completed(notification("healthy", 2, "2.0.0"))
        .await
        .unwrap();
    assert!(matches!(build, BuildOutcome::Recorded(_)));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn coordinator_routes_by_repository() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let (sink, _rx) = ChannelReportSink::new();
    let coordinator = IngestionCoordinator::new(store.clone(), Arc::new(sink), settings());
    let source = Arc::new(MemoryCommitSource::new("core"));
    chain(&source, 1);
    source.set_ref("refs/heads/main", hash(1));
    coordinator.register(RepositoryId::new("core"), source).await;
    assert_eq!(coordinator.repositories().await, vec![RepositoryId::new("core")]);

    let unknown = coordinator
        .notify_build_completed(notification("elsewhere", 1, "1.0.0"))
        .await;
    assert!(matches!(unknown, Err(IngestError::UnknownRepository(_))));

    let mut bad = notification("core", 1, "1.0.0");
    bad.commit = "zz".into();
    assert!(matches!(
        coordinator.notify_build_completed(bad).await,
        Err(IngestError::InvalidNotification(_))
    ));

    let outcome = coordinator
        .poll_repository(&RepositoryId::new("core"))
        .await
        .unwrap();
    assert!(matches!(outcome, PollOutcome::Applied(_)));
    assert_eq!(coordinator.sweep_orphans().await, 0);

    coordinator.shutdown().await;
    assert!(coordinator.repositories().await.is_empty());
    assert!(matches!(
        coordinator.poll_repository(&RepositoryId::new("core")).await,
        Err(IngestError::UnknownRepository(_))
    ));
}
