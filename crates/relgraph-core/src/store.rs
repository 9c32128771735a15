//! Opens the configured metadata store backend.

use std::sync::Arc;

use relgraph_state::{
    CloudConfig, MemoryMetadataStore, MetadataStore, StorageResult, SurrealHandle,
    SurrealMetadataStore,
};
use tracing::info;

use crate::config::StoreConfig;

/// Connect to the backend described by `config`.
pub async fn open_store(config: &StoreConfig) -> StorageResult<Arc<dyn MetadataStore>> {
    let handle = match config {
        StoreConfig::Memory => {
            info!(backend = "memory", "using in-process metadata store");
            return Ok(Arc::new(MemoryMetadataStore::new()));
        }
        StoreConfig::Surreal {
            url,
            namespace,
            database,
            username: Some(username),
            password: Some(password),
            root,
        } => {
            let cloud = CloudConfig::new(url.clone(), username.clone(), password.clone())
                .with_namespace(namespace.clone())
                .with_database(database.clone())
                .with_root(*root);
            SurrealHandle::setup_cloud(cloud).await?
        }
        StoreConfig::Surreal {
            url,
            namespace,
            database,
            ..
        } => SurrealHandle::connect(url, namespace, database).await?,
        StoreConfig::SurrealKv {
            path,
            namespace,
            database,
        } => {
            let url = format!("surrealkv://{}", path.display());
            SurrealHandle::connect(&url, namespace, database).await?
        }
        StoreConfig::Env => SurrealHandle::setup_from_env().await?,
    };
    Ok(Arc::new(SurrealMetadataStore::new(Arc::new(handle))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_starts_at_generation_zero() {
        let store = open_store(&StoreConfig::Memory).await.unwrap();
        assert_eq!(store.generation().await.unwrap().0, 0);
    }

    #[tokio::test]
    async fn surreal_mem_backend_opens() {
        let config = StoreConfig::Surreal {
            url: "mem://".into(),
            namespace: "relgraph".into(),
            database: "store_test".into(),
            username: None,
            password: None,
            root: false,
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.generation().await.unwrap().0, 0);
    }
}
