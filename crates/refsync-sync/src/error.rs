use std::path::PathBuf;

use refsync_adapters::{ParseError, SchemaError, TransformError};
use refsync_core::StepStatus;
use refsync_storage::{CheckpointError, FetchError, StoreError};
use thiserror::Error;

use crate::config::{ConfigError, ErrorPolicy};

/// A failure attributable to a single feed row.
#[derive(Debug, Error)]
pub enum RowError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl RowError {
    pub fn line(&self) -> u64 {
        match self {
            Self::Parse(err) => err.line(),
            Self::Transform(err) => err.line(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("row {line} rejected under {policy}: {source}", line = .source.line())]
    Row {
        policy: ErrorPolicy,
        #[source]
        source: RowError,
    },
    #[error("{observed:.3} of persisted entities would go missing, above threshold {threshold:.3}")]
    ThresholdAbort { observed: f64, threshold: f64 },
    #[error("commit of chunk {chunk} failed: {source}")]
    Commit {
        chunk: u64,
        #[source]
        source: StoreError,
    },
    #[error("loading persisted entities: {0}")]
    Load(#[source] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("reading cached feed {path}: {source}")]
    CacheRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("status sink `{sink}` failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("cleanup failed: {0}")]
    Cleanup(#[source] std::io::Error),
}

impl SyncError {
    /// Stable machine-readable reason recorded in run reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_invalid",
            Self::Schema(_) => "schema_invalid",
            Self::Fetch(_) => "download_failed",
            Self::Row {
                source: RowError::Parse(_),
                ..
            } => "parse_error",
            Self::Row {
                source: RowError::Transform(_),
                ..
            } => "transform_error",
            Self::ThresholdAbort { .. } => "threshold_exceeded",
            Self::Commit { .. } => "commit_failed",
            Self::Load(_) => "store_load_failed",
            Self::Checkpoint(_) => "checkpoint_io",
            Self::CacheRead { .. } => "cache_read_failed",
            Self::Cancelled => "cancelled",
            Self::Sink { .. } => "status_sink_failed",
            Self::Cleanup(_) => "cleanup_failed",
        }
    }

    pub fn step_status(&self) -> StepStatus {
        match self {
            Self::ThresholdAbort { .. } => StepStatus::AbortedThreshold,
            _ => StepStatus::Failed,
        }
    }
}
