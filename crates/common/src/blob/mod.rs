//! Blob storage abstraction
//!
//! Uploads generated image bytes to content storage and returns a stable
//! public URL. `S3BlobStore` is the production implementation;
//! `MemoryBlobStore` backs tests and local development.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Object key for a generated photo: `{userId}/{timestampMillis}-{index}.png`.
/// The timestamp+index pair keeps keys collision-free within a batch.
pub fn photo_key(user_id: Uuid, timestamp_millis: i64, index: usize) -> String {
    format!("{}/{}-{}.png", user_id, timestamp_millis, index)
}

/// Trait for blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes under `key` with the given content type; returns the
    /// public URL of the stored object.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
}

impl S3BlobStore {
    pub async fn new(bucket: String, public_base_url: String) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = S3Client::new(&aws_config);

        Self {
            client,
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(client: S3Client, bucket: String, public_base_url: String) -> Self {
        Self {
            client,
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| AppError::Storage {
                message: format!("Failed to upload {}: {}", key, e),
            })?;

        tracing::debug!(key = %key, "Blob uploaded");

        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

/// In-memory blob store for tests and local development
#[derive(Default)]
pub struct MemoryBlobStore {
    uploads: Mutex<Vec<(String, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys and content types seen so far, in upload order
    pub async fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().await.clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, key: &str, _bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.uploads
            .lock()
            .await
            .push((key.to_string(), content_type.to_string()));
        Ok(format!("memory://{}", key))
    }
}

/// Create a blob store based on configuration
pub async fn create_blob_store(
    provider: &str,
    bucket: Option<String>,
    public_base_url: Option<String>,
) -> Arc<dyn BlobStore> {
    match provider {
        "s3" => {
            let bucket = bucket.expect("Storage bucket required");
            let public_base_url = public_base_url.expect("Storage public base URL required");
            Arc::new(S3BlobStore::new(bucket, public_base_url).await)
        }
        "memory" => Arc::new(MemoryBlobStore::new()),
        _ => {
            tracing::warn!(provider = provider, "Unknown storage provider, using memory");
            Arc::new(MemoryBlobStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_key_layout() {
        let user_id = Uuid::nil();
        let key = photo_key(user_id, 1722470400123, 2);
        assert_eq!(
            key,
            "00000000-0000-0000-0000-000000000000/1722470400123-2.png"
        );
    }

    #[test]
    fn test_photo_keys_unique_per_index() {
        let user_id = Uuid::new_v4();
        let a = photo_key(user_id, 1000, 0);
        let b = photo_key(user_id, 1000, 1);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_memory_store_records_uploads() {
        let store = MemoryBlobStore::new();
        let url = store
            .upload("u/1-0.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();

        assert_eq!(url, "memory://u/1-0.png");
        assert_eq!(
            store.uploads().await,
            vec![("u/1-0.png".to_string(), "image/png".to_string())]
        );
    }
}
