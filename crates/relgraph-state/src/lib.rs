//! relgraph-state: metadata persistence for relgraph
//!
//! Stores the commit DAG, ref pointers and their movement log, artifacts and
//! build records behind the [`MetadataStore`] trait.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: insert-only facts, transactional writes and DAG reachability.
//!
//! ## Key Components
//!
//! - `MetadataStore`: backend-agnostic async storage interface
//! - `MemoryMetadataStore`: in-process backend used by tests and `memory` mode
//! - `SurrealHandle` / `SurrealMetadataStore`: SurrealDB backend
//!   (`mem://`, `surrealkv://`, `ws://`, cloud)

mod error;
mod handle;
pub mod memory;
mod migrations;
pub mod records;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use handle::{CloudConfig, SurrealHandle, DEFAULT_DATABASE, DEFAULT_NAMESPACE};
pub use memory::MemoryMetadataStore;
pub use records::{
    ArtifactId, ArtifactRecord, BuildCursor, BuildId, BuildPage, BuildPolicy, BuildRecord,
    BuildWrite, Channel, CommitHash, CommitRecord, Generation, ListBuildsQuery, NewBuild,
    RefKind, RefMovement, RefMovementKind, RefMovementRecord, RefRecord, RepositoryId,
    WriteOutcome,
};
pub use storage_traits::{MetadataStore, StorageResult};
pub use surreal_store::SurrealMetadataStore;
