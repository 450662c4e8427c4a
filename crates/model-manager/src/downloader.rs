//! Model artifact fetching
//!
//! Artifacts are fetched into memory from `http(s)://`, `file://` or `builtin://`
//! locations, with progress tracking, optional SHA-256 verification and
//! cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use common::error::{Error, Result};
use common::models::ModelDescriptor;
use common::utils::{ensure_not_cancelled, format_bytes};
use config::ConfigManager;

/// Progress information for a download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    /// Artifact key, `engine:model_type@quality`
    pub key: String,
    /// Total bytes, when the source reports a length
    pub total_bytes: Option<u64>,
    /// Bytes received so far
    pub downloaded_bytes: u64,
    /// Download speed in bytes per second
    pub speed_bytes_per_second: u64,
    /// Whether the download is complete
    pub is_complete: bool,
    /// Error message if the download failed
    pub error: Option<String>,
}

impl DownloadProgress {
    fn started(key: &str) -> Self {
        Self {
            key: key.to_string(),
            total_bytes: None,
            downloaded_bytes: 0,
            speed_bytes_per_second: 0,
            is_complete: false,
            error: None,
        }
    }

    /// Completed fraction, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.downloaded_bytes as f64 / total as f64).min(1.0))
    }
}

/// Something that can produce an artifact's bytes
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, descriptor: &ModelDescriptor, cancel: &CancellationToken) -> Result<Bytes>;
}

/// Fetches artifacts by location scheme
pub struct ArtifactFetcher {
    /// HTTP client
    client: Client,

    /// Download progress, keyed by artifact key
    progress: DashMap<String, DownloadProgress>,

    /// Source for `builtin://` locations
    builtin: Option<Arc<dyn ArtifactSource>>,

    /// Whether to verify checksums
    verify_checksums: bool,
}

impl std::fmt::Debug for ArtifactFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactFetcher")
            .field("builtin", &self.builtin.is_some())
            .field("verify_checksums", &self.verify_checksums)
            .finish()
    }
}

impl ArtifactFetcher {
    /// Creates a new artifact fetcher
    pub fn new(config_manager: &ConfigManager) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sketch-orchestrator/", env!("CARGO_PKG_VERSION")))
            .timeout(
                config_manager
                    .get_duration("download.timeout_ms")
                    .unwrap_or(Duration::from_secs(120)),
            )
            .connect_timeout(
                config_manager
                    .get_duration("download.connect_timeout_ms")
                    .unwrap_or(Duration::from_secs(10)),
            )
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            progress: DashMap::new(),
            builtin: None,
            verify_checksums: config_manager.get_bool("download.verify_checksums").unwrap_or(true),
        })
    }

    /// Sets the source used for `builtin://` locations
    pub fn with_builtin_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.builtin = Some(source);
        self
    }

    /// Gets the progress of a download
    pub fn progress(&self, key: &str) -> Option<DownloadProgress> {
        self.progress.get(key).map(|p| p.clone())
    }

    /// Gets the progress of all downloads
    pub fn all_progress(&self) -> Vec<DownloadProgress> {
        self.progress.iter().map(|p| p.value().clone()).collect()
    }

    /// Clears finished entries from the progress list
    pub fn clear_finished(&self) {
        self.progress.retain(|_, p| !p.is_complete && p.error.is_none());
    }

    async fn fetch_http(&self, key: &str, url: &str, cancel: &CancellationToken) -> Result<Bytes> {
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled(format!("download of {} cancelled", key))),
            resp = self.client.get(url).send() => resp.map_err(|e| Error::ModelDownload(format!("{}: {}", url, e)))?,
        };

        if !resp.status().is_success() {
            return Err(Error::ModelDownload(format!("{}: HTTP {}", url, resp.status())));
        }

        let total = resp.content_length();
        if let Some(mut p) = self.progress.get_mut(key) {
            p.total_bytes = total;
        }

        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut stream = resp.bytes_stream();
        let mut last_update = Instant::now();
        let mut last_downloaded = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled(format!("download of {} cancelled", key))),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| Error::ModelDownload(format!("{}: {}", url, e)))?;
            buffer.extend_from_slice(&chunk);

            let downloaded = buffer.len() as u64;
            let now = Instant::now();
            if now.duration_since(last_update) > Duration::from_millis(100) {
                let elapsed = now.duration_since(last_update).as_secs_f64();
                let speed = ((downloaded - last_downloaded) as f64 / elapsed) as u64;
                if let Some(mut p) = self.progress.get_mut(key) {
                    p.downloaded_bytes = downloaded;
                    p.speed_bytes_per_second = speed;
                }
                debug!(
                    "Downloading {}: {} / {} ({}/s)",
                    key,
                    format_bytes(downloaded),
                    total.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    format_bytes(speed)
                );
                last_update = now;
                last_downloaded = downloaded;
            }
        }

        Ok(buffer.freeze())
    }

    async fn fetch_file(&self, key: &str, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::ModelDownload(format!("{}: {}", path, e)))?;
        if let Some(mut p) = self.progress.get_mut(key) {
            p.total_bytes = Some(data.len() as u64);
        }
        Ok(Bytes::from(data))
    }

    fn finish(&self, key: &str, result: &Result<Bytes>) {
        if let Some(mut p) = self.progress.get_mut(key) {
            match result {
                Ok(bytes) => {
                    p.downloaded_bytes = bytes.len() as u64;
                    p.is_complete = true;
                }
                Err(e) => p.error = Some(e.to_string()),
            }
        }
    }
}

#[async_trait]
impl ArtifactSource for ArtifactFetcher {
    async fn fetch(&self, descriptor: &ModelDescriptor, cancel: &CancellationToken) -> Result<Bytes> {
        let key = format!("{}:{}", descriptor.engine, descriptor.cache_key());
        let location = descriptor.source_location.as_str();
        ensure_not_cancelled(cancel, "download")?;

        info!("Fetching artifact {} from {}", key, location);
        self.progress.insert(key.clone(), DownloadProgress::started(&key));

        let result = if location.starts_with("http://") || location.starts_with("https://") {
            self.fetch_http(&key, location, cancel).await
        } else if let Some(path) = location.strip_prefix("file://") {
            self.fetch_file(&key, path).await
        } else if location.starts_with("builtin://") {
            match &self.builtin {
                Some(source) => source.fetch(descriptor, cancel).await,
                None => Err(Error::ModelDownload(format!("no builtin source for {}", location))),
            }
        } else {
            Err(Error::ModelDownload(format!("unsupported artifact location {}", location)))
        };

        let result = result.and_then(|bytes| {
            ensure_not_cancelled(cancel, "download")?;
            match (&descriptor.sha256, self.verify_checksums) {
                (Some(expected), true) => verify_sha256(&bytes, expected).map(|_| bytes),
                _ => Ok(bytes),
            }
        });

        self.finish(&key, &result);
        match &result {
            Ok(bytes) => info!("Fetched artifact {} ({})", key, format_bytes(bytes.len() as u64)),
            Err(e) => error!("Fetching artifact {} failed: {}", key, e),
        }

        result
    }
}

/// Checks bytes against a hex SHA-256 digest
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = hex::encode(Sha256::digest(bytes));
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::ModelDownload(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use common::types::QualityLevel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fetcher() -> ArtifactFetcher {
        let config = ConfigManager::with_overrides(Vec::<(String, String)>::new()).unwrap();
        ArtifactFetcher::new(&config).unwrap()
    }

    fn descriptor(location: &str, sha256: Option<String>) -> ModelDescriptor {
        ModelDescriptor {
            model_type: "edge_net".to_string(),
            engine: "tensor".to_string(),
            quality_level: QualityLevel::Low,
            source_location: location.to_string(),
            approx_size_bytes: 16,
            expected_tensor_shape: Vec::new(),
            sha256,
        }
    }

    struct StaticSource(&'static [u8]);

    #[async_trait]
    impl ArtifactSource for StaticSource {
        async fn fetch(&self, _descriptor: &ModelDescriptor, _cancel: &CancellationToken) -> Result<Bytes> {
            Ok(Bytes::from_static(self.0))
        }
    }

    #[tokio::test]
    async fn test_file_source_with_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"model-bytes").unwrap();
        let digest = hex::encode(Sha256::digest(b"model-bytes"));
        let location = format!("file://{}", file.path().display());

        let fetcher = fetcher();
        let bytes = fetcher
            .fetch(&descriptor(&location, Some(digest)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"model-bytes");

        let progress = fetcher.progress("tensor:edge_net@low").unwrap();
        assert!(progress.is_complete);
        assert_eq!(progress.fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_download_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"tampered").unwrap();
        let location = format!("file://{}", file.path().display());

        let fetcher = fetcher();
        let result = fetcher
            .fetch(&descriptor(&location, Some("00".repeat(32))), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ModelDownload(_))));
        assert!(fetcher.progress("tensor:edge_net@low").unwrap().error.is_some());

        fetcher.clear_finished();
        assert!(fetcher.all_progress().is_empty());
    }

    #[tokio::test]
    async fn test_builtin_delegation() {
        let result = fetcher()
            .fetch(&descriptor("builtin://tensor/edge_net/low", None), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ModelDownload(_))));

        let bytes = fetcher()
            .with_builtin_source(Arc::new(StaticSource(b"synthetic")))
            .fetch(&descriptor("builtin://tensor/edge_net/low", None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"synthetic");
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let token = CancellationToken::new();
        token.cancel();
        let result = fetcher()
            .with_builtin_source(Arc::new(StaticSource(b"x")))
            .fetch(&descriptor("builtin://tensor/edge_net/low", None), &token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let result = fetcher()
            .fetch(&descriptor("ftp://host/model", None), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ModelDownload(_))));
    }

    #[tokio::test]
    async fn test_http_source() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nweights")
                .await
                .unwrap();
        });

        let fetcher = fetcher();
        let location = format!("http://{}/edge_net.bin", addr);
        let bytes = fetcher
            .fetch(&descriptor(&location, None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"weights");
        assert_eq!(fetcher.progress("tensor:edge_net@low").unwrap().total_bytes, Some(7));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let result = fetcher()
            .fetch(&descriptor(&format!("http://{}/missing", addr), None), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ModelDownload(_))));
    }
}
