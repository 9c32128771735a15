//! relgraph-core: build-metadata resolution engine
//!
//! Reconciles version-control history with recorded artifact builds and
//! answers version queries over the result.
//!
//! ## Layer 1 - Domain
//!
//! Focus: ingestion ordering, version precedence and query consistency.
//!
//! ## Key Components
//!
//! - [`reader::CommitGraphReader`]: incremental, restartable commit/ref events
//! - [`ingest::IngestionCoordinator`]: per-repository workers applying events
//!   and build notifications to the store
//! - [`resolver::VersionResolver`]: exact, range, `latest`, `latest-on-<ref>`
//!   and `latest-<channel>` resolution
//! - [`cache::ResolutionCache`]: generation-checked LRU of resolutions
//! - [`engine::Engine`]: query facade (resolve, list builds, changelog)

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod obs;
pub mod reader;
pub mod request;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod version;

pub use cache::ResolutionCache;
pub use config::{EngineConfig, LogFormat, RepositoryConfig, StoreConfig};
pub use engine::{Changelog, Engine, PageRequest, Resolution, ResolveOutcome};
pub use error::{ConfigError, IngestError, QueryError, VcsError, VersionParseError};
pub use ingest::{
    BuildNotification, BuildOutcome, IngestReport, IngestSettings, IngestionCoordinator,
    PollOutcome, PollSummary, ReportSink,
};
pub use reader::{CommitGraphReader, CommitSource, GitCliSource, MemoryCommitSource};
pub use request::ResolutionRequest;
pub use resolver::VersionResolver;
pub use retry::RetryPolicy;
pub use store::open_store;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
