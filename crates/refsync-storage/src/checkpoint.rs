//! Durable chunk checkpoints, stored as a JSON file replaced atomically on every save.

use std::path::{Path, PathBuf};

use refsync_core::Checkpoint;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::{remove_if_exists, write_atomic};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint at {path} is unreadable: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_err(err)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| CheckpointError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Load the checkpoint only if it was written for this run key and cache content.
    pub async fn load_matching(
        &self,
        run_key: &str,
        content_hash: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.load().await? {
            Some(checkpoint) if checkpoint.matches(run_key, content_hash) => Ok(Some(checkpoint)),
            Some(checkpoint) => {
                warn!(
                    path = %self.path.display(),
                    rows_consumed = checkpoint.rows_consumed,
                    "checkpoint was written for a different feed; starting from the beginning"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::Decode {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|err| self.io_err(err))
    }

    pub async fn clear(&self) -> Result<(), CheckpointError> {
        remove_if_exists(&self.path)
            .await
            .map(|_| ())
            .map_err(|err| self.io_err(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load_matching() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("feed.checkpoint.json"));
        assert!(store.load().await.expect("empty").is_none());

        let mut checkpoint = Checkpoint::fresh("run-a", "hash-a");
        checkpoint.rows_consumed = 1_000;
        checkpoint.chunks_committed = 2;
        store.save(&checkpoint).await.expect("save");

        let loaded = store
            .load_matching("run-a", "hash-a")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.rows_consumed, 1_000);
        assert!(store
            .load_matching("run-a", "hash-b")
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn garbage_checkpoint_is_a_decode_error() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        fs::write(store.path(), b"{\"rows_cons").await.expect("write");
        assert!(matches!(
            store.load().await,
            Err(CheckpointError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("cp.json"));
        store
            .save(&Checkpoint::fresh("k", "h"))
            .await
            .expect("save");
        store.clear().await.expect("clear");
        store.clear().await.expect("clear again");
        assert!(store.load().await.expect("load").is_none());
    }
}
