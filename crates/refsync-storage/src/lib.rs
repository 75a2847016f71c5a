//! Feed retrieval, content-stable caching, checkpoints and persistence engines for refsync.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

pub mod cache;
pub mod checkpoint;
pub mod entity_store;
pub mod fetch;
pub mod pg;

pub use cache::{CacheHandle, CacheMeta, FeedCache, RunKey};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use entity_store::{CommitReceipt, EntityStore, MemoryEntityStore, Mutation, StoreError};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, DownloadWriter, FeedSource,
    FetchError, HttpClientConfig, HttpFeedSource, RetryDisposition,
};
pub use pg::PgEntityStore;

pub const CRATE_NAME: &str = "refsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a file without loading it into memory. Returns `(hex digest, byte length)`.
pub async fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Sibling temp path in the same directory, so the final rename never crosses filesystems.
pub(crate) fn temp_path_for(path: &Path) -> io::Result<std::path::PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    Ok(parent.join(format!(".{}.tmp", Uuid::new_v4())))
}

/// Replace `path` with `bytes` via temp-file write, fsync and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let temp_path = temp_path_for(path)?;

    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
