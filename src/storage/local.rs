use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{get_object, list_objects, put_object, validate_key, ObjectStore};
use crate::{PipelineError, Result};

/// Filesystem-backed store: `key` maps to `root/key`. Writes go to a staging
/// file that is renamed over the target.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    backend: LocalFileSystem,
}

impl LocalObjectStore {
    /// Creates `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .and_then(|_| std::fs::canonicalize(&root))
            .map_err(|e| PipelineError::Storage(format!("cannot open store root: {}", e)))
            .and_then(|root| {
                let backend = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
                    PipelineError::Storage(format!("cannot open store root: {}", e))
                })?;
                Ok(Self { root, backend })
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Keys under `prefix` ending in `extension`, sorted.
    pub async fn list_keys(&self, prefix: &str, extension: &str) -> Result<Vec<String>> {
        let keys = list_objects(&self.backend, prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|key| {
                let name = key.rsplit('/').next().unwrap_or_default();
                !name.starts_with('.') && name.ends_with(extension)
            })
            .collect())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let len = data.len();
        put_object(&self.backend, key, data).await?;
        debug!(key = %key, bytes = len, "object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        get_object(&self.backend, key).await
    }

    fn locator(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
