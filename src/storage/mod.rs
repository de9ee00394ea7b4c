//! Object storage for partitions and query results.
//!
//! Both stores sit on `object_store` backends. Every `put` is a full
//! replace: readers see either the previous object or the new one, never a
//! partial write.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{memory::InMemory, path::Path, ObjectStore as ObjectBackend, PutPayload};
use tracing::warn;

use crate::{PipelineError, Result};

pub mod local;

pub use local::LocalObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Replace the object at `key` with `data`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// External locator for `key`, returned to API callers.
    fn locator(&self, key: &str) -> String;
}

/// Rejects keys that could escape the store root or name a directory.
pub fn validate_key(key: &str) -> Result<()> {
    let bad_segment = key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if key.is_empty() || key.contains('\\') || bad_segment {
        return Err(PipelineError::Storage(format!("invalid object key {:?}", key)));
    }
    Ok(())
}

fn object_path(key: &str) -> Result<Path> {
    validate_key(key)?;
    Path::parse(key).map_err(|_| PipelineError::Storage(format!("invalid object key {:?}", key)))
}

/// Backend errors carry filesystem paths; those stay in the log and the
/// returned message names only the key.
fn storage_error(operation: &str, key: &str, err: object_store::Error) -> PipelineError {
    match err {
        object_store::Error::NotFound { .. } => {
            PipelineError::Storage(format!("object not found: {}", key))
        }
        other => {
            warn!(operation = %operation, key = %key, error = %other, "object store call failed");
            PipelineError::Storage(format!("{} {} failed", operation, key))
        }
    }
}

async fn put_object(backend: &dyn ObjectBackend, key: &str, data: Bytes) -> Result<()> {
    let path = object_path(key)?;
    backend
        .put(&path, PutPayload::from(data))
        .await
        .map_err(|e| storage_error("write", key, e))?;
    Ok(())
}

async fn get_object(backend: &dyn ObjectBackend, key: &str) -> Result<Bytes> {
    let path = object_path(key)?;
    let result = backend.get(&path).await.map_err(|e| storage_error("read", key, e))?;
    result.bytes().await.map_err(|e| storage_error("read", key, e))
}

/// Sorted keys under `prefix`.
async fn list_objects(backend: &dyn ObjectBackend, prefix: &str) -> Result<Vec<String>> {
    let path = object_path(prefix)?;
    let mut keys: Vec<String> = backend
        .list(Some(&path))
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .map_err(|e| storage_error("list", prefix, e))?;
    keys.sort();
    Ok(keys)
}

/// Process-local store, used by tests and embedded setups.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    name: String,
    backend: InMemory,
}

impl InMemoryObjectStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: InMemory::new(),
        }
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .backend
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| storage_error("list", "", e))?;
        keys.sort();
        Ok(keys)
    }

    pub async fn contains(&self, key: &str) -> bool {
        match object_path(key) {
            Ok(path) => self.backend.head(&path).await.is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        put_object(&self.backend, key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        get_object(&self.backend, key).await
    }

    fn locator(&self, key: &str) -> String {
        format!("memory://{}/{}", self.name, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_validation() {
        for key in ["", "/abs", "a//b", "a/../b", "./a", "a/", "a\\b"] {
            assert!(validate_key(key).is_err(), "{:?} should be rejected", key);
        }
        assert!(validate_key("ec2-metrics/2025/08/27/instance-i-1.csv").is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_put_replaces() {
        let store = InMemoryObjectStore::new("bucket");
        store.put("a/b.csv", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/b.csv", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.get("a/b.csv").await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(store.keys().await.unwrap(), vec!["a/b.csv".to_string()]);
        assert!(store.contains("a/b.csv").await);
        assert_eq!(store.locator("a/b.csv"), "memory://bucket/a/b.csv");

        let missing = store.get("missing").await.unwrap_err();
        assert_eq!(missing.kind(), "StorageError");
        assert_eq!(missing.detail(), "object not found: missing");
    }

    #[test]
    fn test_backend_errors_name_only_the_key() {
        let err = object_store::Error::Generic {
            store: "LocalFileSystem",
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "/srv/metrics/bucket/results/latest.csv: permission denied",
            )),
        };

        let mapped = storage_error("write", "results/latest.csv", err);

        assert_eq!(mapped.kind(), "StorageError");
        assert_eq!(mapped.detail(), "write results/latest.csv failed");
        assert!(!mapped.to_string().contains("/srv"));
    }
}
