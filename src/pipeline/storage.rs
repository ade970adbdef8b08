//! Blob store capability and its `object_store` adapter.
//!
//! The pipeline only needs put / get / list, so it depends on the narrow
//! [`BlobStore`] trait. [`ObjectStoreBlobs`] backs it with any
//! `object_store` implementation: local filesystem, S3, or in-memory.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::StorageError;

pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// A fetched object: its advertised length plus a body stream.
pub struct BlobObject {
    pub content_length: u64,
    pub body: ByteStream,
}

impl BlobObject {
    /// Drain the body into one buffer.
    pub async fn bytes(self) -> Result<Bytes, StorageError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap_or_default());
        }
        let mut buf = Vec::with_capacity(self.content_length as usize);
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }
}

/// Key-addressed blob storage. Implementations must be safe for concurrent
/// use by many transfer workers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `body` into the object at `key`. Returns the bytes written.
    async fn put(
        &self,
        key: &str,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64, StorageError>;

    async fn get(&self, key: &str) -> Result<BlobObject, StorageError>;

    /// Every key starting with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// [`BlobStore`] over an `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::Local => {
                std::fs::create_dir_all(&config.path).map_err(|e| {
                    StorageError::Unavailable(format!(
                        "failed to create storage directory {}: {e}",
                        config.path
                    ))
                })?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(&config.path)
                    .map_err(|e| {
                        StorageError::Unavailable(format!("failed to create local store: {e}"))
                    })?;
                Arc::new(store)
            }
            StorageBackend::Memory => Arc::new(object_store::memory::InMemory::new()),
            StorageBackend::S3 => {
                use object_store::aws::AmazonS3Builder;
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.path);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                let store = builder.build().map_err(|e| {
                    StorageError::Unavailable(format!("failed to create S3 store: {e}"))
                })?;
                Arc::new(store)
            }
        };
        Ok(Self::new(store))
    }
}

fn object_path(key: &str) -> Result<ObjectPath, StorageError> {
    ObjectPath::parse(key).map_err(|e| StorageError::InvalidKey {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    async fn put(
        &self,
        key: &str,
        mut body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64, StorageError> {
        let path = object_path(key)?;
        // Small bodies become a single PUT, large ones a multipart upload.
        let mut writer = BufWriter::new(Arc::clone(&self.store), path);
        let written = tokio::io::copy(&mut body, &mut writer)
            .await
            .map_err(|e| StorageError::Body {
                key: key.to_string(),
                source: e,
            })?;
        writer
            .shutdown()
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to complete upload of {key}: {e}")))?;
        debug!(key, bytes = written, "object stored");
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<BlobObject, StorageError> {
        let path = object_path(key)?;
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                key: key.to_string(),
            },
            other => StorageError::from(other),
        })?;
        let content_length = result.meta.size as u64;
        let body = result.into_stream().map_err(StorageError::from).boxed();
        Ok(BlobObject {
            content_length,
            body,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let trimmed = prefix.trim_end_matches('/');
        let prefix_path = if trimmed.is_empty() {
            None
        } else {
            Some(object_path(trimmed)?)
        };
        let keys = self
            .store
            .list(prefix_path.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<_>>()
            .await?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put_str(blobs: &ObjectStoreBlobs, key: &str, content: &str) {
        let body = std::io::Cursor::new(content.as_bytes().to_vec());
        blobs.put(key, Box::new(body)).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let blobs = ObjectStoreBlobs::in_memory();
        put_str(&blobs, "abc12/index.html", "<h1>hi</h1>").await;

        let object = blobs.get("abc12/index.html").await.unwrap();
        assert_eq!(object.content_length, 11);
        assert_eq!(object.bytes().await.unwrap(), Bytes::from_static(b"<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let blobs = ObjectStoreBlobs::in_memory();
        let err = blobs.get("abc12/missing.js").await.err().unwrap();
        assert!(matches!(err, StorageError::NotFound { ref key } if key == "abc12/missing.js"));
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_prefix() {
        let blobs = ObjectStoreBlobs::in_memory();
        put_str(&blobs, "abc12/index.html", "a").await;
        put_str(&blobs, "abc12/css/style.css", "b").await;
        put_str(&blobs, "abc123/other.js", "c").await;
        put_str(&blobs, "zzz99/app.js", "d").await;

        let mut keys = blobs.list("abc12/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["abc12/css/style.css", "abc12/index.html"]);
    }

    #[tokio::test]
    async fn test_put_rejects_traversal_key() {
        let blobs = ObjectStoreBlobs::in_memory();
        let body = std::io::Cursor::new(b"x".to_vec());
        let err = blobs.put("abc12/../etc/passwd", Box::new(body)).await.err().unwrap();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_local_backend_writes_under_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            path: dir.path().join("blobs").to_string_lossy().to_string(),
            region: None,
            endpoint: None,
        };
        let blobs = ObjectStoreBlobs::from_config(&config).unwrap();
        put_str(&blobs, "abc12/app.js", "console.log(1)").await;
        assert!(dir.path().join("blobs/abc12/app.js").exists());
        assert_eq!(blobs.list("abc12").await.unwrap(), vec!["abc12/app.js"]);
    }
}
