//! Chunked reconciliation of a reference-data feed into a persistent entity store.
//!
//! A run downloads (or reuses) a cached copy of the feed, optionally pre-checks it
//! against the persisted identity set, streams it through the reconciler in
//! checkpointed chunks, publishes the observed status of every identity, and only
//! then removes the cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use refsync_storage::{
    EntityStore, HttpClientConfig, HttpFeedSource, MemoryEntityStore, PgEntityStore,
};
use tracing::warn;

pub mod config;
pub mod error;
pub mod gate;
pub mod index;
pub mod observer;
pub mod pipeline;
pub mod publish;
pub mod reconcile;

pub use config::{ConfigError, ErrorPolicy, RunConfig, RunConfigFile, RunMode, StalePolicy};
pub use error::{RowError, SyncError};
pub use gate::{precheck, GateDecision, GateReport, IdentitySet};
pub use index::{ApplyOutcome, Applied, IdentityIndex, IndexEntry, StatusCounts};
pub use observer::{ChunkCommitted, ObserverSet, RunObserver, RunStarted, TracingObserver};
pub use pipeline::{ReconcilePipeline, RunReport, StepRecord};
pub use publish::{
    write_run_report, JsonStatusSink, ParquetStatusSink, StatusPublisher, StatusRow, StatusSink,
    StatusSnapshot,
};
pub use reconcile::{ChunkedReconciler, ReconcileSettings, ReconcileSummary};

/// Connect the configured persistence engine. Without `database_url` the run is
/// reconciled against an empty in-memory store.
pub async fn store_from_config(config: &RunConfig) -> Result<Arc<dyn EntityStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgEntityStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; reconciling against an in-memory store");
            Ok(Arc::new(MemoryEntityStore::new()))
        }
    }
}

/// Build the production pipeline: HTTP/file source, configured store, JSON and Parquet status sinks.
pub async fn pipeline_from_config(config: RunConfig) -> Result<ReconcilePipeline> {
    let source = HttpFeedSource::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
    .context("building feed http client")?;
    let store = store_from_config(&config).await?;
    let reports_dir = config.reports_dir.clone();

    let pipeline = ReconcilePipeline::new(config, Arc::new(source), store)?
        .with_status_sink(Box::new(JsonStatusSink::new(reports_dir.clone())))
        .with_status_sink(Box::new(ParquetStatusSink::new(reports_dir)));
    Ok(pipeline)
}
