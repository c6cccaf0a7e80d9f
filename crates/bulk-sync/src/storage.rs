//! Chunk staging area over `object_store`.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::debug;

use crate::config::{StorageConfig, StorageKind};
use crate::core::CopySource;
use crate::error::{Result, SyncError};
use crate::export::chunk;
use crate::planner::Range;

/// Object store plus the naming scheme chunks are written under.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    base_url: String,
    secret: Option<String>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ChunkStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        base_url: impl Into<String>,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        }
    }

    /// Build the configured backend.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.kind {
            StorageKind::Azure => {
                let mut builder = MicrosoftAzureBuilder::new()
                    .with_account(config.account.clone().unwrap_or_default())
                    .with_container_name(config.container.clone().unwrap_or_default());
                if let Some(key) = &config.access_key {
                    builder = builder.with_access_key(key);
                }
                Arc::new(builder.build()?)
            }
            StorageKind::Local => {
                let root = config.root.clone().ok_or_else(|| {
                    SyncError::Config("storage.root is required for local storage".into())
                })?;
                std::fs::create_dir_all(&root)?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            StorageKind::Memory => Arc::new(InMemory::new()),
        };
        Ok(Self::new(
            store,
            config.prefix.clone(),
            config.base_url(),
            config.access_key.clone(),
        ))
    }

    /// Process-local store for tests and dry runs.
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), prefix, "memory://", None)
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn chunk_key(&self, table: &str, range: &Range, sequence: u32) -> String {
        chunk::chunk_key(&self.prefix, table, range, sequence)
    }

    pub fn range_prefix(&self, table: &str, range: &Range) -> String {
        chunk::range_prefix(&self.prefix, table, range)
    }

    /// Wildcard location matching every chunk of `range`.
    pub fn copy_source(&self, table: &str, range: &Range) -> CopySource {
        let prefix = self.range_prefix(table, range);
        CopySource {
            url: format!("{}/{}/*", self.base_url, prefix),
            prefix,
            secret: self.secret.clone(),
        }
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store.put(&Path::from(key), data.into()).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(result.bytes().await?)
    }

    /// Keys under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let metas: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every chunk of `range` whose sequence is `>= keep`.
    pub async fn delete_from_sequence(&self, table: &str, range: &Range, keep: u32) -> Result<usize> {
        let mut deleted = 0;
        for key in self.list(&self.range_prefix(table, range)).await? {
            if chunk::sequence_of(&key).map_or(true, |seq| seq >= keep) {
                debug!("Deleting stale chunk {}", key);
                self.delete(&key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
