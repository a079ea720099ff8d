//! Blob storage for uploads and page renditions.
//!
//! Keys are deterministic (derived from document id, ordinal and encoding
//! kind), so a retried write overwrites the same object instead of leaving
//! orphans behind.

use crate::error::ObjectStoreError;
use crate::model::ObjectLocation;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Object storage contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data`, replacing any existing object at `location`.
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Fetch an object's bytes.
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError>;

    /// Server-side copy.
    async fn copy(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), ObjectStoreError>;
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    content_type: String,
}

/// Object store backed by a concurrent map. Used in tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<ObjectLocation, StoredObject>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, location: &ObjectLocation) -> bool {
        self.objects.contains_key(location)
    }

    pub fn content_type(&self, location: &ObjectLocation) -> Option<String> {
        self.objects.get(location).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        debug!("put {} ({} bytes)", location, data.len());
        self.objects.insert(
            location.clone(),
            StoredObject {
                data: Arc::new(data),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .get(location)
            .map(|o| o.data.as_ref().clone())
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })
    }

    async fn copy(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), ObjectStoreError> {
        let source = self
            .objects
            .get(from)
            .map(|o| o.clone())
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: from.bucket.clone(),
                key: from.key.clone(),
            })?;
        self.objects.insert(to.clone(), source);
        Ok(())
    }
}

// ── Local filesystem ─────────────────────────────────────────────────────

/// Object store rooted at a local directory: `{root}/{bucket}/{key}`.
///
/// Writes go to a temp file first and are renamed into place, so a reader
/// never observes a half-written rendition.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a location to a path, refusing keys that would escape the root.
    pub fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, ObjectStoreError> {
        let mut path = self.root.clone();
        for part in [&location.bucket, &location.key] {
            let rel = Path::new(part.as_str());
            let safe = rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !safe || part.is_empty() {
                return Err(ObjectStoreError::Unavailable(format!(
                    "refusing unsafe object path '{location}'"
                )));
            }
            path.push(rel);
        }
        Ok(path)
    }

    fn io_error(location: &ObjectLocation, source: std::io::Error) -> ObjectStoreError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ObjectStoreError::NotFound {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            }
        } else {
            ObjectStoreError::Io {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                source,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(location, e))?;
        }

        // Atomic write: temp file, then rename. The temp name is unique per
        // call so concurrent puts of one key never share a file.
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Self::io_error(location, e))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Self::io_error(location, e));
        }

        debug!("wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_error(location, e))
    }

    async fn copy(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), ObjectStoreError> {
        let data = self.get(from).await?;
        self.put(to, data, "application/octet-stream").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_put_get_copy() {
        let store = InMemoryObjectStore::new();
        let a = ObjectLocation::new("uploads", "x.pdf");
        let b = ObjectLocation::new("documents", "documents/1/x.pdf");

        store.put(&a, b"%PDF-1.7".to_vec(), "application/pdf").await.unwrap();
        store.copy(&a, &b).await.unwrap();

        assert_eq!(store.get(&b).await.unwrap(), b"%PDF-1.7");
        assert_eq!(store.content_type(&b).as_deref(), Some("application/pdf"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn in_memory_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let err = store
            .get(&ObjectLocation::new("b", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let store = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("renditions", "d/page_0001.png");
        store.put(&loc, vec![1], "image/png").await.unwrap();
        store.put(&loc, vec![2, 2], "image/png").await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap(), vec![2, 2]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let loc = ObjectLocation::new("renditions", "doc/page_0001.jpg");

        store.put(&loc, vec![9; 32], "image/jpeg").await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap(), vec![9; 32]);
        assert!(dir.path().join("renditions/doc/page_0001.jpg").exists());

        let copy = ObjectLocation::new("archive", "page.jpg");
        store.copy(&loc, &copy).await.unwrap();
        assert_eq!(store.get(&copy).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn concurrent_local_puts_of_one_key_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(LocalObjectStore::new(dir.path()));
        let loc = ObjectLocation::new("renditions", "doc/page_0002.png");

        let handles: Vec<_> = (0..16u8)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                let loc = loc.clone();
                tokio::spawn(async move { store.put(&loc, vec![n; 4096], "image/png").await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stored = store.get(&loc).await.unwrap();
        assert_eq!(stored.len(), 4096);
        assert!(stored.iter().all(|b| *b == stored[0]));
        let names: Vec<_> = std::fs::read_dir(dir.path().join("renditions/doc"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("page_0002.png")]);
    }

    #[tokio::test]
    async fn local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .put(&ObjectLocation::new("b", "../escape"), vec![1], "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn local_store_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store.get(&ObjectLocation::new("b", "nope")).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
    }
}
