//! Version resolution, caching and listing through the engine facade.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{hash, new_build, record, ref_move, FlakyStore};
use relgraph_core::request::ResolutionRequest;
use relgraph_core::{Engine, PageRequest, QueryError, ResolveOutcome, VersionResolver};
use relgraph_state::{
    ArtifactId, BuildPolicy, Channel, MemoryMetadataStore, MetadataStore, RefMovementKind,
};

const REPO: &str = "core";

/// `1 <- 2 <- 3` with `refs/heads/main` at 3.
async fn seeded() -> Arc<MemoryMetadataStore> {
    let store = Arc::new(MemoryMetadataStore::new());
    store.insert_commit(&record(REPO, 1, &[])).await.unwrap();
    store.insert_commit(&record(REPO, 2, &[1])).await.unwrap();
    store.insert_commit(&record(REPO, 3, &[2])).await.unwrap();
    store
        .apply_ref_movement(&ref_move(
            REPO,
            "refs/heads/main",
            None,
            Some(3),
            RefMovementKind::Created,
        ))
        .await
        .unwrap();
    store
}

async fn add_build(store: &dyn MetadataStore, commit: u32, version: &str, minute: i64) {
    store
        .record_build(&new_build(REPO, commit, version, minute), BuildPolicy::default())
        .await
        .unwrap();
}

fn engine(store: Arc<dyn MetadataStore>) -> Engine {
    Engine::new(store, 64, 25)
}

async fn resolved_version(engine: &Engine, expr: &str) -> Option<String> {
    match engine.resolve_version("org:widget", expr).await.unwrap() {
        ResolveOutcome::Found(r) => Some(r.build.version),
        ResolveOutcome::NotFound => None,
    }
}

#[tokio::test]
async fn latest_prefers_release_over_its_prerelease() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    add_build(store.as_ref(), 2, "1.2.0", 11).await;
    add_build(store.as_ref(), 3, "1.2.0-rc1", 12).await;
    let engine = engine(store);

    assert_eq!(resolved_version(&engine, "latest").await.as_deref(), Some("1.2.0"));
}

#[tokio::test]
async fn range_selects_highest_inside_bounds() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    add_build(store.as_ref(), 2, "1.1.0", 11).await;
    add_build(store.as_ref(), 3, "2.0.0", 12).await;
    let engine = engine(store);

    for expr in [">=1.0.0 <2.0.0", ">=1.0.0, <2.0.0", "[1.0.0,2.0.0)"] {
        assert_eq!(
            resolved_version(&engine, expr).await.as_deref(),
            Some("1.1.0"),
            "{expr}"
        );
    }
    assert_eq!(resolved_version(&engine, ">2.0.0").await, None);
}

#[tokio::test]
async fn exact_and_channel_requests() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    let mut snapshot = new_build(REPO, 3, "1.1.0-SNAPSHOT", 20);
    snapshot.channel = Channel::snapshot();
    store
        .record_build(&snapshot, BuildPolicy::default())
        .await
        .unwrap();
    let engine = engine(store);

    assert_eq!(resolved_version(&engine, "1.0.0").await.as_deref(), Some("1.0.0"));
    assert_eq!(resolved_version(&engine, "3.0.0").await, None);
    assert_eq!(
        resolved_version(&engine, "latest-stable").await.as_deref(),
        Some("1.0.0")
    );
    assert_eq!(
        resolved_version(&engine, "latest-snapshot").await.as_deref(),
        Some("1.1.0-SNAPSHOT")
    );
    assert_eq!(
        resolved_version(&engine, "latest").await.as_deref(),
        Some("1.1.0-SNAPSHOT")
    );
}

#[tokio::test]
async fn latest_on_ref_follows_reachability_across_rewrites() {
    let store = seeded().await;
    add_build(store.as_ref(), 2, "1.0.0", 10).await;
    let engine = engine(store.clone());

    assert_eq!(
        resolved_version(&engine, "latest-on-main").await.as_deref(),
        Some("1.0.0")
    );
    assert_eq!(
        resolved_version(&engine, "latest-on-refs/heads/main").await.as_deref(),
        Some("1.0.0")
    );
    assert_eq!(resolved_version(&engine, "latest-on-nope").await, None);

    // rewrite main to an unrelated root commit
    store.insert_commit(&record(REPO, 4, &[])).await.unwrap();
    store
        .apply_ref_movement(&ref_move(
            REPO,
            "refs/heads/main",
            Some(3),
            Some(4),
            RefMovementKind::Rewrite,
        ))
        .await
        .unwrap();
    assert_eq!(resolved_version(&engine, "latest-on-main").await, None);

    // a rewrite that still contains 2 keeps the build reachable
    store.insert_commit(&record(REPO, 5, &[2])).await.unwrap();
    store
        .apply_ref_movement(&ref_move(
            REPO,
            "refs/heads/main",
            Some(4),
            Some(5),
            RefMovementKind::Rewrite,
        ))
        .await
        .unwrap();
    assert_eq!(
        resolved_version(&engine, "latest-on-main").await.as_deref(),
        Some("1.0.0")
    );
}

#[tokio::test]
async fn latest_on_ref_picks_highest_reachable_build() {
    let store = seeded().await;
    store.insert_commit(&record(REPO, 9, &[1])).await.unwrap();
    add_build(store.as_ref(), 2, "1.0.0", 10).await;
    add_build(store.as_ref(), 9, "2.0.0", 11).await;
    let engine = engine(store);

    // 9 is on a side branch, not reachable from main
    assert_eq!(
        resolved_version(&engine, "latest-on-main").await.as_deref(),
        Some("1.0.0")
    );
    assert_eq!(resolved_version(&engine, "latest").await.as_deref(), Some("2.0.0"));
}

#[tokio::test]
async fn cached_answer_matches_fresh_resolution_and_invalidates() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    let engine = engine(store.clone());
    let fresh = VersionResolver::new(store.clone());
    let artifact = ArtifactId::parse("org:widget").unwrap();

    let first = engine.resolve_version("org:widget", "latest").await.unwrap();
    assert_eq!(engine.cache().len(), 1);
    let second = engine.resolve_version("org:widget", "latest").await.unwrap();
    assert_eq!(first, second);
    let uncached = fresh
        .resolve(&artifact, &ResolutionRequest::Latest)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.found().unwrap().build, uncached.build);

    // new build bumps the generation; the cached entry must not be served
    add_build(store.as_ref(), 3, "1.1.0", 11).await;
    let third = engine.resolve_version("org:widget", "latest").await.unwrap();
    let third = third.found().unwrap();
    assert_eq!(third.build.version, "1.1.0");
    assert_eq!(third.generation, store.generation().await.unwrap());
}

#[tokio::test]
async fn not_found_is_cached_until_generation_moves() {
    let store = seeded().await;
    let engine = engine(store.clone());
    assert_eq!(
        engine.resolve_version("org:widget", "latest").await.unwrap(),
        ResolveOutcome::NotFound
    );
    assert_eq!(engine.cache().len(), 1);
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    assert_eq!(resolved_version(&engine, "latest").await.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn non_semver_versions_are_flagged_approximate() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    add_build(store.as_ref(), 2, "build-2024-05", 11).await;
    let engine = engine(store);

    let outcome = engine.resolve_version("org:widget", "latest").await.unwrap();
    let resolution = outcome.found().unwrap();
    assert!(resolution.approximate);
    assert_eq!(resolution.build.version, "build-2024-05");
}

#[tokio::test]
async fn invalid_requests_are_errors() {
    let store = seeded().await;
    let engine = engine(store);
    assert!(matches!(
        engine.resolve_version("org:widget", ">=").await,
        Err(QueryError::InvalidRequest(_))
    ));
    assert!(matches!(
        engine.resolve_version("  ", "latest").await,
        Err(QueryError::InvalidArtifact(_))
    ));
}

#[tokio::test]
async fn moving_generation_is_reported_as_contended() {
    let store = FlakyStore::new();
    store.churn.store(true, Ordering::SeqCst);
    let engine = engine(store);
    let err = engine
        .resolve_version("org:widget", "latest")
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Contended { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn list_builds_pages_newest_first() {
    let store = seeded().await;
    add_build(store.as_ref(), 1, "1.0.0", 10).await;
    add_build(store.as_ref(), 2, "1.1.0", 20).await;
    add_build(store.as_ref(), 3, "1.2.0", 30).await;
    let mut failed = new_build(REPO, 3, "1.3.0", 40);
    failed.success = false;
    store
        .record_build(&failed, BuildPolicy::default())
        .await
        .unwrap();
    let engine = Engine::new(store, 64, 2);

    let first = engine
        .list_builds("org:widget", &PageRequest::default())
        .await
        .unwrap();
    let versions: Vec<_> = first.builds.iter().map(|b| b.version.as_str()).collect();
    assert_eq!(versions, ["1.2.0", "1.1.0"]);
    let cursor = first.next_cursor.unwrap().to_string();

    let second = engine
        .list_builds(
            "org:widget",
            &PageRequest {
                cursor: Some(cursor),
                limit: Some(100),
                ..PageRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.builds.len(), 1);
    assert_eq!(second.builds[0].version, "1.0.0");
    assert!(second.next_cursor.is_none());

    let with_failed = engine
        .list_builds(
            "org:widget",
            &PageRequest {
                limit: Some(1),
                include_failed: true,
                ..PageRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(with_failed.builds[0].version, "1.3.0");

    let bad = engine
        .list_builds(
            "org:widget",
            &PageRequest {
                cursor: Some("yesterday".into()),
                ..PageRequest::default()
            },
        )
        .await;
    assert!(matches!(bad, Err(QueryError::InvalidCursor(_))));
}

#[tokio::test]
async fn changelog_lists_commits_since_previous_version() {
    let store = seeded().await;
    store.insert_commit(&record(REPO, 4, &[3])).await.unwrap();
    store.insert_commit(&record(REPO, 5, &[4])).await.unwrap();
    add_build(store.as_ref(), 2, "1.0.0", 10).await;
    add_build(store.as_ref(), 5, "1.1.0", 20).await;
    let engine = engine(store);

    let log = engine
        .changelog("org:widget", "1.1.0", 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.base_version.as_deref(), Some("1.0.0"));
    let hashes: Vec<_> = log.commits.iter().map(|c| c.hash.clone()).collect();
    assert_eq!(hashes, vec![hash(5), hash(4), hash(3)]);
    assert!(!log.truncated);

    let first = engine
        .changelog("org:widget", "1.0.0", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.base_version, None);
    assert_eq!(first.commits.len(), 1);
    assert!(first.truncated);

    assert!(engine
        .changelog("org:widget", "9.9.9", 10)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn ref_history_accepts_short_names() {
    let store = seeded().await;
    let engine = engine(store);
    let history = engine.ref_history(REPO, "main").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].movement, RefMovementKind::Created);
    assert_eq!(engine.refs(REPO).await.unwrap().len(), 1);

    let builds = engine
        .builds_for_commit(REPO, &hash(1).to_string())
        .await
        .unwrap();
    assert!(builds.is_empty());
}

#[tokio::test]
async fn requests_sharing_a_cache_key_resolve_alike() {
    let store = seeded().await;
    add_build(store.as_ref(), 2, "nightly", 10).await;

    let shared = engine(store.clone());
    let plain = resolved_version(&shared, ">=1.0.0").await;
    let prefixed = resolved_version(&shared, ">=v1.0.0").await;
    let fresh = resolved_version(&engine(store), ">=v1.0.0").await;

    assert_eq!(plain.as_deref(), Some("nightly"));
    assert_eq!(prefixed, fresh);
    assert_eq!(prefixed, plain);
}
