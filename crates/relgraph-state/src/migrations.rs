//! SurrealDB schema migrations and initialization
//!
//! Safe to call on every connection: all statements are `IF NOT EXISTS`
//! and the generation row is only seeded when absent.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all relgraph tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing relgraph SurrealDB schema");

    init_artifacts_table(db).await?;
    init_commits_table(db).await?;
    init_refs_tables(db).await?;
    init_builds_table(db).await?;
    init_generation(db).await?;

    info!("relgraph schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &str) -> StorageResult<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StorageError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}

/// ```text
/// TABLE artifacts {
///   artifact_id:  STRING (unique)
///   display_name: STRING
///   repository:   STRING
///   active:       BOOL
///   created_at:   DATETIME
/// }
/// ```
async fn init_artifacts_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing artifacts table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_id ON TABLE artifacts COLUMNS artifact_id UNIQUE;
    "#;
    run(db, "artifacts", sql).await
}

/// Commit nodes are insert-only; (repository, hash) is unique.
async fn init_commits_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing commits table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS commits SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_commit_key ON TABLE commits COLUMNS repository, hash UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_commit_authored ON TABLE commits COLUMNS repository, authored_at;
    "#;
    run(db, "commits", sql).await
}

/// `refs` holds the current pointer; `ref_movements` is the append-only log.
async fn init_refs_tables(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing refs and ref_movements tables");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS refs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_ref_key ON TABLE refs COLUMNS repository, name UNIQUE;

        DEFINE TABLE IF NOT EXISTS ref_movements SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_movement_ref ON TABLE ref_movements COLUMNS repository, name, seq;
    "#;
    run(db, "refs", sql).await
}

/// Build rows are never updated. Uniqueness of successful (artifact, version)
/// pairs is enforced in the write transaction since failed rows may repeat.
async fn init_builds_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing builds table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS builds SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_build_version ON TABLE builds COLUMNS artifact, build_version;
        DEFINE INDEX IF NOT EXISTS idx_build_commit ON TABLE builds COLUMNS repository, commit_hash;
        DEFINE INDEX IF NOT EXISTS idx_build_completed ON TABLE builds COLUMNS artifact, completed_at;
    "#;
    run(db, "builds", sql).await
}

async fn init_generation(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Seeding generation counter");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS generation SCHEMALESS;
        UPSERT generation:current SET counter = counter ?? 0;
    "#;
    run(db, "generation", sql).await
}
