//! HTTP Download Manager
//!
//! Fetches manifests and update packages into memory. `file://` URLs are read
//! from the local filesystem, which is how packages are tested before upload.

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Default cap on a single download.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Download exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// The `fetch(url) -> bytes` capability.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// Download manager for manifests and update packages
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent("webpatch-updater")
            .timeout(timeout)
            .build()?;
        Ok(Self { client, max_bytes })
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(TransportError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_bytes) {
            return Err(TransportError::TooLarge { limit: self.max_bytes });
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(TransportError::TooLarge { limit: self.max_bytes });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let path = reqwest::Url::parse(url)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?
            .to_file_path()
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        let len = tokio::fs::metadata(&path).await?.len();
        if len > self.max_bytes {
            return Err(TransportError::TooLarge { limit: self.max_bytes });
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        if url.starts_with("file://") {
            self.fetch_file(url).await
        } else {
            self.fetch_http(url).await
        }
    }
}
