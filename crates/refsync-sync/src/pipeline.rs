//! The run orchestrator: download, precheck, process, report, cleanup.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use refsync_adapters::{parser_for_schema, ColumnMapper, FeedParser, RowIter, RowMapper};
use refsync_core::{Checkpoint, RunMetrics, RunStatus, StepName, StepStatus};
use refsync_storage::{CacheHandle, CheckpointStore, EntityStore, FeedCache, FeedSource};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ErrorPolicy, RunConfig, RunMode, StalePolicy};
use crate::error::SyncError;
use crate::gate::{identities, precheck, GateDecision, GateReport};
use crate::index::IdentityIndex;
use crate::observer::{ObserverSet, RunObserver, RunStarted, TracingObserver};
use crate::publish::{write_run_report, StatusPublisher, StatusSink};
use crate::reconcile::{read_blocking, ChunkedReconciler, ReconcileSettings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: StepName,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything a caller needs to know about one run, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_key: String,
    pub input_url: String,
    pub mode: RunMode,
    pub error_policy: ErrorPolicy,
    pub stale_policy: StalePolicy,
    pub status: RunStatus,
    pub failed_step: Option<StepName>,
    pub reason: Option<String>,
    pub reason_code: Option<String>,
    pub steps: Vec<StepRecord>,
    pub metrics: RunMetrics,
    pub gate: Option<GateReport>,
    pub cache_reused: bool,
    pub resumed_from_row: u64,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

struct StepFailure {
    step: StepName,
    error: SyncError,
}

/// Mutable state threaded through the steps of one run.
struct RunContext {
    run_id: Uuid,
    run_key: String,
    status: RunStatus,
    index: Option<IdentityIndex>,
    cache: Option<CacheHandle>,
    metrics: RunMetrics,
    steps: Vec<StepRecord>,
    gate: Option<GateReport>,
    resumed_from: u64,
}

impl RunContext {
    fn new(run_id: Uuid, run_key: String) -> Self {
        Self {
            run_id,
            run_key,
            status: RunStatus::Pending,
            index: None,
            cache: None,
            metrics: RunMetrics::started(Utc::now()),
            steps: Vec::new(),
            gate: None,
            resumed_from: 0,
        }
    }

    fn record<T>(
        &mut self,
        step: StepName,
        started_at: DateTime<Utc>,
        outcome: Result<T, SyncError>,
    ) -> Result<T, StepFailure> {
        let finished_at = Utc::now();
        match outcome {
            Ok(value) => {
                self.steps.push(StepRecord {
                    step,
                    status: StepStatus::Completed,
                    started_at,
                    finished_at,
                    detail: None,
                });
                Ok(value)
            }
            Err(error) => {
                self.steps.push(StepRecord {
                    step,
                    status: error.step_status(),
                    started_at,
                    finished_at,
                    detail: Some(error.to_string()),
                });
                Err(StepFailure { step, error })
            }
        }
    }

    fn absorb_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.metrics.rows_read = checkpoint.rows_consumed;
        self.metrics.chunks_committed = checkpoint.chunks_committed;
        self.metrics.skipped = checkpoint.skipped;
        self.metrics.diff.inserted = checkpoint.inserted;
        self.metrics.diff.updated = checkpoint.updated;
        self.metrics.diff.modified = checkpoint.modified;
    }
}

pub struct ReconcilePipeline {
    config: RunConfig,
    source: Arc<dyn FeedSource>,
    store: Arc<dyn EntityStore>,
    parser: Box<dyn FeedParser>,
    mapper: Box<dyn RowMapper>,
    observers: ObserverSet,
    publisher: StatusPublisher,
    cancel: CancellationToken,
    cache: FeedCache,
    checkpoints: CheckpointStore,
}

impl ReconcilePipeline {
    pub fn new(
        config: RunConfig,
        source: Arc<dyn FeedSource>,
        store: Arc<dyn EntityStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let parser = parser_for_schema(&config.schema)?;
        let mapper = Box::new(ColumnMapper::from_schema(&config.schema));
        let cache = FeedCache::new(config.download_cache.clone(), config.run_key());
        let checkpoints = CheckpointStore::new(config.checkpoint_path.clone());
        let mut observers = ObserverSet::default();
        observers.push(Box::new(TracingObserver));
        Ok(Self {
            config,
            source,
            store,
            parser,
            mapper,
            observers,
            publisher: StatusPublisher::new(),
            cancel: CancellationToken::new(),
            cache,
            checkpoints,
        })
    }

    pub fn with_parser(mut self, parser: Box<dyn FeedParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_mapper(mut self, mapper: Box<dyn RowMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_status_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.publisher.push(sink);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn feed_cache(&self) -> &FeedCache {
        &self.cache
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Execute one full run. Failures are reported in the returned [`RunReport`].
    pub async fn run_once(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let run_key = self.cache.run_key().to_string();
        let span = info_span!("reconcile_run", %run_id, run_key = %run_key, mode = %self.config.mode);
        self.run_with_id(run_id, run_key).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid, run_key: String) -> RunReport {
        let mut ctx = RunContext::new(run_id, run_key);
        self.transition(&mut ctx, RunStatus::Running);
        self.observers.on_run_start(&RunStarted {
            run_id,
            run_key: ctx.run_key.clone(),
            input_url: self.config.input_url.clone(),
            mode: self.config.mode,
            error_policy: self.config.error_policy,
        });

        let failure = self.execute(&mut ctx).await.err();
        ctx.metrics.finished_at = Some(Utc::now());

        let (failed_step, reason, reason_code) = match &failure {
            None => {
                self.transition(&mut ctx, RunStatus::Completed);
                (None, None, None)
            }
            Some(StepFailure { step, error: err }) => {
                self.transition(&mut ctx, err.step_status().into());
                error!(
                    step = %step,
                    reason_code = err.reason_code(),
                    error = %err,
                    "run did not complete; cache and checkpoint retained"
                );
                (
                    Some(*step),
                    Some(err.to_string()),
                    Some(err.reason_code().to_string()),
                )
            }
        };

        if ctx.metrics.skipped > 0 {
            warn!(
                skipped = ctx.metrics.skipped,
                "rows were skipped under best-effort; see warnings above for line numbers"
            );
        }

        let report = RunReport {
            run_id,
            run_key: ctx.run_key,
            input_url: self.config.input_url.clone(),
            mode: self.config.mode,
            error_policy: self.config.error_policy,
            stale_policy: self.config.stale_policy,
            status: ctx.status,
            failed_step,
            reason,
            reason_code,
            steps: ctx.steps,
            metrics: ctx.metrics,
            gate: ctx.gate,
            cache_reused: ctx.cache.as_ref().is_some_and(|c| c.reused),
            resumed_from_row: ctx.resumed_from,
        };

        match write_run_report(&self.config.reports_dir, &report) {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(err) => warn!(error = %err, "could not write run report"),
        }
        self.observers.on_run_end(&report);
        report
    }

    fn transition(&self, ctx: &mut RunContext, next: RunStatus) {
        if let Err(err) = ctx.status.transition(next) {
            warn!(error = %err, "ignoring run status transition");
        }
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StepFailure> {
        let started = Utc::now();
        let outcome = self
            .download()
            .instrument(info_span!("step", name = %StepName::Download))
            .await;
        let handle = ctx.record(StepName::Download, started, outcome)?;
        ctx.cache = Some(handle.clone());

        if self.config.mode.runs_precheck() {
            let started = Utc::now();
            let outcome = self
                .precheck_step(ctx, &handle)
                .instrument(info_span!("step", name = %StepName::Precheck))
                .await;
            ctx.record(StepName::Precheck, started, outcome)?;
        }

        let started = Utc::now();
        let outcome = self
            .process_step(ctx, &handle)
            .instrument(info_span!("step", name = %StepName::Process))
            .await;
        ctx.record(StepName::Process, started, outcome)?;

        let started = Utc::now();
        let outcome =
            info_span!("step", name = %StepName::Report).in_scope(|| self.report_step(ctx));
        ctx.record(StepName::Report, started, outcome)?;

        let started = Utc::now();
        let outcome = self
            .cleanup()
            .instrument(info_span!("step", name = %StepName::Cleanup))
            .await;
        ctx.record(StepName::Cleanup, started, outcome)?;
        Ok(())
    }

    async fn download(&self) -> Result<CacheHandle, SyncError> {
        let handle = self
            .cache
            .ensure(self.source.as_ref(), &self.config.input_url)
            .await?;
        info!(
            path = %handle.path.display(),
            bytes = handle.byte_size,
            reused = handle.reused,
            "feed cached"
        );
        Ok(handle)
    }

    async fn load_index(&self, ctx: &mut RunContext) -> Result<IdentityIndex, SyncError> {
        match ctx.index.take() {
            Some(index) => Ok(index),
            None => IdentityIndex::load(self.store.as_ref())
                .await
                .map_err(SyncError::Load),
        }
    }

    fn open_rows(&self, path: &Path) -> Result<RowIter<'_>, SyncError> {
        let file = File::open(path).map_err(|source| SyncError::CacheRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.parser.rows(Box::new(BufReader::new(file))))
    }

    fn gate(&self, handle: &CacheHandle, index: &IdentityIndex) -> Result<GateReport, SyncError> {
        let existing = index.live_identities();
        let rows = self.open_rows(&handle.path)?;
        Ok(read_blocking(|| {
            precheck(
                identities(rows, self.mapper.as_ref()),
                &existing,
                self.config.delete_threshold_fraction,
            )
        }))
    }

    async fn precheck_step(
        &self,
        ctx: &mut RunContext,
        handle: &CacheHandle,
    ) -> Result<(), SyncError> {
        let index = self.load_index(ctx).await?;
        let gated = self.gate(handle, &index);
        ctx.index = Some(index);
        let report = gated?;
        let decision = report.decision;
        ctx.gate = Some(report);
        match decision {
            GateDecision::Proceed => Ok(()),
            GateDecision::Abort { observed_fraction } => Err(SyncError::ThresholdAbort {
                observed: observed_fraction,
                threshold: self.config.delete_threshold_fraction,
            }),
        }
    }

    async fn process_step(
        &self,
        ctx: &mut RunContext,
        handle: &CacheHandle,
    ) -> Result<(), SyncError> {
        let mut index = self.load_index(ctx).await?;
        let mut checkpoint = self
            .checkpoints
            .load_matching(&ctx.run_key, &handle.content_hash)
            .await?
            .unwrap_or_else(|| Checkpoint::fresh(ctx.run_key.clone(), handle.content_hash.clone()));
        ctx.resumed_from = checkpoint.rows_consumed;
        if checkpoint.rows_consumed > 0 {
            info!(
                rows_consumed = checkpoint.rows_consumed,
                chunks_committed = checkpoint.chunks_committed,
                "resuming from checkpoint"
            );
        }

        let rows = self.open_rows(&handle.path)?;
        let rows: RowIter<'_> = if self.config.mode.materializes_rows() {
            let materialized: Vec<_> = read_blocking(|| rows.collect());
            info!(rows = materialized.len(), "feed parsed into memory");
            Box::new(materialized.into_iter())
        } else {
            rows
        };

        let reconciler = ChunkedReconciler::new(
            self.store.as_ref(),
            self.mapper.as_ref(),
            &self.checkpoints,
            &self.observers,
            &self.cancel,
            ReconcileSettings::from_config(&self.config),
            ctx.run_id,
        );
        let outcome = reconciler.run(rows, &mut index, &mut checkpoint).await;
        ctx.absorb_checkpoint(&checkpoint);
        ctx.metrics.diff.untouched = index.counts().untouched;
        let summary = outcome?;

        ctx.metrics.diff = summary.diff;
        ctx.index = Some(index);
        Ok(())
    }

    fn report_step(&self, ctx: &mut RunContext) -> Result<(), SyncError> {
        let Some(mut index) = ctx.index.take() else {
            return Ok(());
        };
        let snapshot = self
            .publisher
            .publish(ctx.run_id, ctx.metrics.diff, &mut index)?;
        info!(
            identities = snapshot.entries.len(),
            sinks = self.publisher.sink_names().len(),
            "status map published"
        );
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SyncError> {
        self.cache.remove().await.map_err(SyncError::Cleanup)?;
        self.checkpoints.clear().await?;
        info!(path = %self.cache.path().display(), "cache and checkpoint removed");
        Ok(())
    }

    /// Download (or reuse) the feed and evaluate the gate without touching the store.
    pub async fn precheck_only(&self) -> Result<GateReport, SyncError> {
        let handle = self.download().await?;
        let index = IdentityIndex::load(self.store.as_ref())
            .await
            .map_err(SyncError::Load)?;
        self.gate(&handle, &index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use refsync_storage::{DownloadWriter, FetchError, MemoryEntityStore};
    use tempfile::tempdir;

    struct InlineFeed(&'static str);

    #[async_trait]
    impl FeedSource for InlineFeed {
        async fn fetch_into(&self, _url: &str, out: &mut DownloadWriter) -> Result<(), FetchError> {
            out.write_chunk(self.0.as_bytes()).await?;
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl FeedSource for Unreachable {
        async fn fetch_into(&self, url: &str, _out: &mut DownloadWriter) -> Result<(), FetchError> {
            Err(FetchError::Timeout { url: url.to_string() })
        }
    }

    fn config(dir: &Path) -> RunConfig {
        let mut config = RunConfig::new("https://feeds.test/iso.jsonl", dir.join("iso.jsonl"));
        config.reports_dir = dir.join("reports");
        config
    }

    #[tokio::test]
    async fn completed_run_records_every_step_and_cleans_up() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryEntityStore::new());
        let pipeline = ReconcilePipeline::new(
            config(dir.path()),
            Arc::new(InlineFeed("{\"domain\":\"iso\",\"code\":\"USD\"}\n")),
            store.clone(),
        )
        .expect("pipeline");

        let report = pipeline.run_once().await;
        assert!(report.is_completed(), "{report:?}");
        let steps: Vec<StepName> = report.steps.iter().map(|s| s.step).collect();
        assert_eq!(
            steps,
            [StepName::Download, StepName::Process, StepName::Report, StepName::Cleanup]
        );
        assert_eq!(report.metrics.diff.inserted, 1);
        assert!(report.metrics.finished_at.is_some());
        assert!(!dir.path().join("iso.jsonl").exists());
        assert!(!pipeline.checkpoint_store().path().exists());
        assert!(dir
            .path()
            .join("reports")
            .join(report.run_id.to_string())
            .join("run_report.json")
            .exists());
    }

    #[tokio::test]
    async fn download_failure_is_reported_against_download_step() {
        let dir = tempdir().expect("tempdir");
        let pipeline = ReconcilePipeline::new(
            config(dir.path()),
            Arc::new(Unreachable),
            Arc::new(MemoryEntityStore::new()),
        )
        .expect("pipeline");

        let report = pipeline.run_once().await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_step, Some(StepName::Download));
        assert_eq!(report.reason_code.as_deref(), Some("download_failed"));
        assert_eq!(report.steps.len(), 1);
    }
}
