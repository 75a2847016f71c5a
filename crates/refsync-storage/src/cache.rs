//! Content-stable local cache for a downloaded feed.
//!
//! The cache file is the positional source of truth for a run: the pre-check pass,
//! the reconciler and any restarted attempt all read the same bytes. A sidecar
//! `<cache>.meta.json` ties the file to the run key that produced it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};

use crate::fetch::{DownloadWriter, FeedSource, FetchError};
use crate::{remove_if_exists, sha256_file, temp_path_for, write_atomic};

/// Stable identifier derived from run parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey(String);

impl RunKey {
    pub fn derive(input_url: &str, run_label: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(run_label.unwrap_or_default().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub run_key: String,
    pub url: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: u64,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct FeedCache {
    path: PathBuf,
    run_key: RunKey,
}

impl FeedCache {
    pub fn new(path: impl Into<PathBuf>, run_key: RunKey) -> Self {
        Self {
            path: path.into(),
            run_key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_key(&self) -> &RunKey {
        &self.run_key
    }

    pub fn meta_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".meta.json");
        self.path.with_file_name(name)
    }

    /// Return the cached feed for this run key, downloading it only when no valid copy exists.
    pub async fn ensure(
        &self,
        source: &dyn FeedSource,
        url: &str,
    ) -> Result<CacheHandle, FetchError> {
        if let Some(handle) = self.inspect().await? {
            info!(path = %self.path.display(), hash = %handle.content_hash, "reusing cached feed");
            return Ok(handle);
        }
        self.download(source, url).await
    }

    /// Validate an existing cache file against its sidecar. `None` means "fetch again".
    pub async fn inspect(&self) -> Result<Option<CacheHandle>, FetchError> {
        let meta_path = self.meta_path();
        let meta_text = match fs::read_to_string(&meta_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: CacheMeta = match serde_json::from_str(&meta_text) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "unreadable cache sidecar; refetching");
                return Ok(None);
            }
        };
        if meta.run_key != self.run_key.as_str() {
            info!(path = %self.path.display(), "cache belongs to a different run key; refetching");
            return Ok(None);
        }
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let (content_hash, byte_size) = sha256_file(&self.path).await?;
        if content_hash != meta.content_hash || byte_size != meta.byte_size {
            warn!(
                path = %self.path.display(),
                expected = %meta.content_hash,
                actual = %content_hash,
                "cached feed does not match its sidecar; refetching"
            );
            return Ok(None);
        }

        Ok(Some(CacheHandle {
            path: self.path.clone(),
            content_hash,
            byte_size,
            reused: true,
        }))
    }

    async fn download(
        &self,
        source: &dyn FeedSource,
        url: &str,
    ) -> Result<CacheHandle, FetchError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        // A sidecar left over from another run must not vouch for the new bytes.
        remove_if_exists(&self.meta_path()).await?;

        let temp_path = temp_path_for(&self.path)?;
        let mut writer = DownloadWriter::create(&temp_path).await?;
        let fetched = source.fetch_into(url, &mut writer).await;
        let finished = match fetched {
            Ok(()) => writer.finish().await.map_err(FetchError::from),
            Err(err) => Err(err),
        };
        let (content_hash, byte_size) = match finished {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        let meta = CacheMeta {
            run_key: self.run_key.as_str().to_string(),
            url: url.to_string(),
            content_hash: content_hash.clone(),
            byte_size,
            fetched_at: Utc::now(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|err| FetchError::Io(std::io::Error::other(err)))?;
        write_atomic(&self.meta_path(), &meta_bytes).await?;

        info!(path = %self.path.display(), bytes = byte_size, hash = %content_hash, "feed cached");
        Ok(CacheHandle {
            path: self.path.clone(),
            content_hash,
            byte_size,
            reused: false,
        })
    }

    /// Delete the cached feed and its sidecar.
    pub async fn remove(&self) -> std::io::Result<()> {
        remove_if_exists(&self.path).await?;
        remove_if_exists(&self.meta_path()).await?;
        Ok(())
    }
}
