use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};
use tracing::{debug, warn};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

const FALLBACK_DIR: &str = "blob-fallback";

/// Blob store used for uploads, stage intermediates and index artifacts.
///
/// Objects that the primary backend refuses for size reasons land in a local fallback store.
/// Reads and existence checks consult both, so callers never need to know where a blob went.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    fallback: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
    bucket: String,
    max_object_bytes: usize,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;
        let fallback = create_fallback_backend(cfg).await?;

        Ok(Self {
            store,
            fallback,
            backend_kind,
            local_base,
            bucket: cfg.s3_bucket.clone(),
            max_object_bytes: cfg.blob_max_object_bytes.max(1),
        })
    }

    /// Create a StorageManager with a custom storage backend and an in-memory fallback.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            fallback: Arc::new(InMemory::new()),
            backend_kind,
            local_base: None,
            bucket: "tenders".to_string(),
            max_object_bytes: usize::MAX,
        }
    }

    #[must_use]
    pub fn with_max_object_bytes(mut self, max_object_bytes: usize) -> Self {
        self.max_object_bytes = max_object_bytes.max(1);
        self
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    /// Store bytes at the specified location.
    ///
    /// Oversized payloads, and payloads the backend rejects with a size-limit error, are written
    /// to the fallback store instead.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);

        if data.len() > self.max_object_bytes {
            warn!(
                location,
                bytes = data.len(),
                limit = self.max_object_bytes,
                "object exceeds blob size limit; writing to fallback store"
            );
            return self.put_fallback(&path, data).await;
        }

        let payload = object_store::PutPayload::from_bytes(data.clone());
        match self.store.put(&path, payload).await {
            Ok(_) => Ok(()),
            Err(err) if is_size_limit_error(&err) => {
                warn!(location, error = %err, "blob store refused object size; using fallback");
                self.put_fallback(&path, data).await
            }
            Err(err) => Err(err),
        }
    }

    async fn put_fallback(&self, path: &ObjPath, data: Bytes) -> object_store::Result<()> {
        let payload = object_store::PutPayload::from_bytes(data);
        self.fallback.put(path, payload).await.map(|_| ())
    }

    /// Retrieve bytes from the specified location, consulting the fallback store on a miss.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        match self.store.get(&path).await {
            Ok(result) => result.bytes().await,
            Err(object_store::Error::NotFound { .. }) => {
                let result = self.fallback.get(&path).await?;
                debug!(location, "served object from fallback store");
                result.bytes().await
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`StorageManager::get`] but maps a missing object to `None`.
    pub async fn get_opt(&self, location: &str) -> object_store::Result<Option<Bytes>> {
        match self.get(location).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        if head_exists(&self.store, &path).await? {
            return Ok(true);
        }
        head_exists(&self.fallback, &path).await
    }

    /// Delete a single object from both stores. Missing objects are not an error.
    pub async fn delete(&self, location: &str) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        for store in [&self.store, &self.fallback] {
            match store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Delete all objects below the specified prefix.
    pub async fn delete_prefix(&self, prefix: &str) -> object_store::Result<()> {
        let prefix_path = ObjPath::from(prefix);
        for store in [&self.store, &self.fallback] {
            let locations = store
                .list(Some(&prefix_path))
                .map_ok(|m| m.location)
                .boxed();
            store
                .delete_stream(locations)
                .try_collect::<Vec<_>>()
                .await?;
        }

        if matches!(self.backend_kind, StorageKind::Local) {
            self.cleanup_filesystem_directories(prefix).await;
        }

        Ok(())
    }

    /// List all objects below the specified prefix.
    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        let mut objects: Vec<object_store::ObjectMeta> =
            self.store.list(prefix_path.as_ref()).try_collect().await?;
        let fallback: Vec<object_store::ObjectMeta> =
            self.fallback.list(prefix_path.as_ref()).try_collect().await?;
        objects.extend(fallback);
        Ok(objects)
    }

    /// Best-effort removal of empty directories left behind by the local backend.
    async fn cleanup_filesystem_directories(&self, prefix: &str) {
        let Some(base) = &self.local_base else {
            return;
        };

        let relative = Path::new(prefix);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            warn!(
                prefix = %prefix,
                "Skipping directory cleanup for unsupported prefix components"
            );
            return;
        }

        let mut current = base.join(relative);

        while current.starts_with(base) && current.as_path() != base.as_path() {
            match tokio::fs::remove_dir(&current).await {
                Ok(()) => {}
                Err(err) => match err.kind() {
                    ErrorKind::NotFound => {}
                    ErrorKind::DirectoryNotEmpty => break,
                    _ => debug!(
                        error = %err,
                        path = %current.display(),
                        "Failed to remove directory during cleanup"
                    ),
                },
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }
    }
}

async fn head_exists(store: &DynStore, path: &ObjPath) -> object_store::Result<bool> {
    match store.head(path).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Size-limit rejections are reported as generic errors by most providers.
fn is_size_limit_error(err: &object_store::Error) -> bool {
    let message = err.to_string();
    message.contains("EntityTooLarge")
        || message.to_lowercase().contains("size limit")
        || message.contains("413")
}

async fn ensure_dir(path: &Path) -> object_store::Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| object_store::Error::Generic {
                store: "LocalFileSystem",
                source: e.into(),
            })?;
    }
    Ok(())
}

async fn create_storage_backend(
    cfg: &AppConfig,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match cfg.storage {
        StorageKind::Local => {
            let base = PathBuf::from(&cfg.data_dir);
            ensure_dir(&base).await?;
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => Ok((Arc::new(InMemory::new()), None)),
        StorageKind::S3 => {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(&cfg.s3_bucket);
            if let Some(region) = &cfg.s3_region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &cfg.s3_endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            Ok((Arc::new(builder.build()?), None))
        }
    }
}

async fn create_fallback_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
        StorageKind::Local | StorageKind::S3 => {
            let base = PathBuf::from(&cfg.data_dir).join(FALLBACK_DIR);
            ensure_dir(&base).await?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(base)?))
        }
    }
}

/// Helpers for tests in this and downstream crates.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    pub fn memory_storage() -> StorageManager {
        StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip_and_delete() {
        let storage = testing::memory_storage();
        let location = "tenders/org/tender/raw/hash/file.txt";

        assert!(!storage.exists(location).await.expect("exists"));
        storage
            .put(location, Bytes::from_static(b"hello"))
            .await
            .expect("put");
        assert!(storage.exists(location).await.expect("exists"));
        assert_eq!(storage.get(location).await.expect("get").as_ref(), b"hello");

        storage.delete(location).await.expect("delete");
        assert!(storage.get_opt(location).await.expect("get_opt").is_none());
    }

    #[tokio::test]
    async fn oversized_objects_go_to_fallback_and_remain_readable() {
        let storage = testing::memory_storage().with_max_object_bytes(4);
        let location = "tenders/org/tender/work/hash/pages.json.gz";

        storage
            .put(location, Bytes::from_static(b"larger than four"))
            .await
            .expect("put");

        let primary = ObjPath::from(location);
        assert!(!head_exists(&storage.store, &primary).await.expect("head"));
        assert!(storage.exists(location).await.expect("exists"));
        assert_eq!(
            storage.get(location).await.expect("get").as_ref(),
            b"larger than four"
        );
    }

    #[tokio::test]
    async fn delete_prefix_clears_both_stores() {
        let storage = testing::memory_storage().with_max_object_bytes(3);
        storage
            .put("p/a", Bytes::from_static(b"ab"))
            .await
            .expect("put small");
        storage
            .put("p/b", Bytes::from_static(b"abcdef"))
            .await
            .expect("put large");
        assert_eq!(storage.list(Some("p")).await.expect("list").len(), 2);

        storage.delete_prefix("p").await.expect("delete prefix");
        assert!(storage.list(Some("p")).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn local_backend_persists_under_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            storage: StorageKind::Local,
            ..Default::default()
        };
        let storage = StorageManager::new(&cfg).await.expect("storage");
        storage
            .put("a/b/c.txt", Bytes::from_static(b"x"))
            .await
            .expect("put");
        assert!(dir.path().join("a/b/c.txt").exists());
        storage.delete_prefix("a").await.expect("delete");
        assert!(!dir.path().join("a/b/c.txt").exists());
    }

    #[test]
    fn size_limit_errors_are_recognised() {
        let err = object_store::Error::Generic {
            store: "S3",
            source: "EntityTooLarge: Your proposed upload exceeds the maximum allowed size".into(),
        };
        assert!(is_size_limit_error(&err));
    }
}
