//! Engine configuration.
//!
//! Loaded from TOML with defaults for every field, then overridden from
//! `RELGRAPH_*` environment variables.
//!
//! ```toml
//! [store]
//! backend = "surreal_kv"
//! path = "/var/lib/relgraph"
//!
//! [[repositories]]
//! id = "core"
//! path = "/srv/git/core.git"
//!
//! [ingest]
//! poll_interval_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use relgraph_state::{BuildPolicy, DEFAULT_DATABASE, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::engine::DEFAULT_PAGE_SIZE;
use crate::error::ConfigError;
use crate::ingest::IngestSettings;
use crate::retry::RetryPolicy;

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub repositories: Vec<RepositoryConfig>,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub log: LogConfig,
}

/// Metadata store backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// SurrealDB endpoint (`mem://`, `ws://host:port`, `wss://...`)
    Surreal {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_database")]
        database: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        root: bool,
    },
    /// Embedded SurrealKV files under `path`
    SurrealKv {
        path: PathBuf,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_database")]
        database: String,
    },
    /// Resolve from `SURREALDB_*` variables, falling back to in-memory
    Env,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub poll_interval_secs: u64,
    pub max_commits_per_poll: usize,
    pub orphan_buffer_capacity: usize,
    pub orphan_timeout_secs: u64,
    pub allow_republish: bool,
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_commits_per_poll: 500,
            orphan_buffer_capacity: 1024,
            orphan_timeout_secs: 600,
            allow_republish: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settings(&self) -> IngestSettings {
        IngestSettings {
            max_commits_per_poll: self.max_commits_per_poll,
            orphan_buffer_capacity: self.orphan_buffer_capacity,
            orphan_timeout: Duration::from_secs(self.orphan_timeout_secs),
            policy: BuildPolicy {
                allow_republish: self.allow_republish,
            },
            retry: self.retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub cache_capacity: usize,
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            max_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

impl EngineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELGRAPH_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// `RELGRAPH_STORE` accepts `memory`, `env`, `surrealkv://<path>` or a
    /// SurrealDB URL.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(store) = lookup("RELGRAPH_STORE") {
            self.store = parse_store(&store);
        }
        override_parsed(
            &lookup,
            "RELGRAPH_POLL_INTERVAL_SECS",
            &mut self.ingest.poll_interval_secs,
        )?;
        override_parsed(
            &lookup,
            "RELGRAPH_MAX_COMMITS_PER_POLL",
            &mut self.ingest.max_commits_per_poll,
        )?;
        override_parsed(
            &lookup,
            "RELGRAPH_ORPHAN_BUFFER_CAPACITY",
            &mut self.ingest.orphan_buffer_capacity,
        )?;
        override_parsed(
            &lookup,
            "RELGRAPH_ORPHAN_TIMEOUT_SECS",
            &mut self.ingest.orphan_timeout_secs,
        )?;
        override_parsed(&lookup, "RELGRAPH_ALLOW_REPUBLISH", &mut self.ingest.allow_republish)?;
        override_parsed(
            &lookup,
            "RELGRAPH_RETRY_MAX_ATTEMPTS",
            &mut self.ingest.retry.max_attempts,
        )?;
        override_parsed(&lookup, "RELGRAPH_CACHE_CAPACITY", &mut self.query.cache_capacity)?;
        override_parsed(&lookup, "RELGRAPH_MAX_PAGE_SIZE", &mut self.query.max_page_size)?;
        override_parsed(&lookup, "RELGRAPH_LOG_FORMAT", &mut self.log.format)?;
        if let Some(level) = lookup("RELGRAPH_LOG_LEVEL") {
            self.log.level = level;
        }
        self.validate()
    }

    /// Reject settings that would stall ingestion or disable bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;
        if ingest.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("ingest.poll_interval_secs", "must be at least 1"));
        }
        if ingest.max_commits_per_poll == 0 {
            return Err(ConfigError::invalid("ingest.max_commits_per_poll", "must be at least 1"));
        }
        if ingest.orphan_buffer_capacity == 0 {
            return Err(ConfigError::invalid("ingest.orphan_buffer_capacity", "must be at least 1"));
        }
        if ingest.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("ingest.retry.max_attempts", "must be at least 1"));
        }
        if ingest.retry.initial_backoff_ms > ingest.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "ingest.retry.initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        if self.query.cache_capacity == 0 {
            return Err(ConfigError::invalid("query.cache_capacity", "must be at least 1"));
        }
        if self.query.max_page_size == 0 {
            return Err(ConfigError::invalid("query.max_page_size", "must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repositories {
            if repo.id.trim().is_empty() {
                return Err(ConfigError::invalid("repositories.id", "must not be blank"));
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(ConfigError::invalid(
                    "repositories.id",
                    format!("duplicate repository {:?}", repo.id),
                ));
            }
        }
        if let StoreConfig::Surreal {
            username, password, ..
        } = &self.store
        {
            if username.is_some() != password.is_some() {
                return Err(ConfigError::invalid(
                    "store",
                    "username and password must be set together",
                ));
            }
        }
        Ok(())
    }
}

fn parse_store(value: &str) -> StoreConfig {
    let value = value.trim();
    match value {
        "memory" => StoreConfig::Memory,
        "env" => StoreConfig::Env,
        _ => match value.strip_prefix("surrealkv://") {
            Some(path) => StoreConfig::SurrealKv {
                path: PathBuf::from(path),
                namespace: default_namespace(),
                database: default_database(),
            },
            None => StoreConfig::Surreal {
                url: value.to_string(),
                namespace: default_namespace(),
                database: default_database(),
                username: None,
                password: None,
                root: false,
            },
        },
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(var) {
        *target = raw.trim().parse().map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
