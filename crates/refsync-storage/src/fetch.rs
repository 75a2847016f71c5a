//! Feed transport: HTTP(S) with retry/backoff, plus `file://` for locally staged feeds.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported feed url {url}")]
    Unsupported { url: String },
    #[error("fetcher is shut down")]
    Shutdown,
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Network {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Network { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|status| classify_status(status) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::Io(_) | Self::Unsupported { .. } | Self::Shutdown => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff, shared by feed downloads and chunk commit retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Streaming sink for a download in progress. Hashes bytes as they are written.
#[derive(Debug)]
pub struct DownloadWriter {
    path: PathBuf,
    file: fs::File,
    hasher: Sha256,
    written: u64,
}

impl DownloadWriter {
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Discard everything written so far; used before each retry attempt.
    pub async fn reset(&mut self) -> std::io::Result<()> {
        if self.written == 0 {
            return Ok(());
        }
        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.hasher = Sha256::new();
        self.written = 0;
        Ok(())
    }

    /// Flush and fsync. Returns `(hex sha256, byte length)`.
    pub async fn finish(mut self) -> std::io::Result<(String, u64)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok((hex::encode(self.hasher.finalize()), self.written))
    }
}

/// "Fetch bytes given a URL."
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_into(&self, url: &str, out: &mut DownloadWriter) -> Result<(), FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent_downloads: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrent_downloads: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared between concurrent runs; the semaphore bounds simultaneous downloads.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    download_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFeedSource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            download_limit: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            backoff: config.backoff,
        })
    }

    async fn fetch_http(&self, url: &str, out: &mut DownloadWriter) -> Result<(), FetchError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let mut attempt = 0usize;
        loop {
            out.reset().await?;
            let err = match self.try_fetch_once(url, out).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if err.is_retryable() && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "feed download failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    async fn try_fetch_once(&self, url: &str, out: &mut DownloadWriter) -> Result<(), FetchError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?
        {
            out.write_chunk(&chunk).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_into(&self, url: &str, out: &mut DownloadWriter) -> Result<(), FetchError> {
        if let Some(local) = url.strip_prefix("file://") {
            return copy_local_file(Path::new(local), out).await;
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FetchError::Unsupported {
                url: url.to_string(),
            });
        }
        let span = info_span!("feed_fetch", url);
        self.fetch_http(url, out).instrument(span).await
    }
}

async fn copy_local_file(path: &Path, out: &mut DownloadWriter) -> Result<(), FetchError> {
    let mut file = fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        out.write_chunk(&buf[..read]).await?;
    }
}
