//! Reference input resolution
//!
//! Jobs carry URLs, not bytes; workers download them before generating.
//! The trait seam lets tests substitute fixtures for the network.

use async_trait::async_trait;
use portray_common::genapi::ReferenceImage;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to fetch {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("Fetch of {url} returned status {status}")]
    BadStatus { url: String, status: u16 },
}

/// Trait for resolving image URLs into bytes
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ReferenceImage, FetchError>;
}

/// HTTP-backed fetcher
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<ReferenceImage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| "image/png".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Unreachable {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        Ok(ReferenceImage {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

/// Fixture-backed fetcher for tests; unknown URLs fail to resolve
#[derive(Default)]
pub struct StaticImageFetcher {
    images: HashMap<String, ReferenceImage>,
}

impl StaticImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, url: &str, mime_type: &str) -> Self {
        self.images.insert(
            url.to_string(),
            ReferenceImage {
                bytes: vec![0u8; 16],
                mime_type: mime_type.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl ImageFetcher for StaticImageFetcher {
    async fn fetch(&self, url: &str) -> Result<ReferenceImage, FetchError> {
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Unreachable {
                url: url.to_string(),
                message: "no fixture registered".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_fetcher_hits_and_misses() {
        let fetcher = StaticImageFetcher::new()
            .with_image("https://cdn.example.com/ref.png", "image/png");

        let image = fetcher.fetch("https://cdn.example.com/ref.png").await.unwrap();
        assert_eq!(image.mime_type, "image/png");

        assert!(matches!(
            fetcher.fetch("https://cdn.example.com/other.png").await,
            Err(FetchError::Unreachable { .. })
        ));
    }
}
