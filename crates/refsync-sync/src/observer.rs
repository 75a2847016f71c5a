//! Run lifecycle hooks. Implementors see chunk commits as they land.

use refsync_storage::CommitReceipt;
use tracing::info;
use uuid::Uuid;

use crate::config::{ErrorPolicy, RunMode};
use crate::pipeline::RunReport;

#[derive(Debug, Clone)]
pub struct RunStarted {
    pub run_id: Uuid,
    pub run_key: String,
    pub input_url: String,
    pub mode: RunMode,
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkCommitted {
    pub run_id: Uuid,
    pub chunk_index: u64,
    pub rows_in_chunk: u64,
    pub rows_consumed: u64,
    pub receipt: CommitReceipt,
}

pub trait RunObserver: Send + Sync {
    fn on_run_start(&self, _event: &RunStarted) {}

    fn on_chunk_committed(&self, _event: &ChunkCommitted) {}

    fn on_run_end(&self, _report: &RunReport) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_run_start(&self, event: &RunStarted) {
        info!(
            run_id = %event.run_id,
            run_key = %event.run_key,
            input_url = %event.input_url,
            mode = %event.mode,
            error_policy = %event.error_policy,
            "reconciliation run started"
        );
    }

    fn on_chunk_committed(&self, event: &ChunkCommitted) {
        info!(
            run_id = %event.run_id,
            chunk = event.chunk_index,
            rows = event.rows_in_chunk,
            rows_consumed = event.rows_consumed,
            inserted = event.receipt.inserted,
            updated = event.receipt.updated,
            "chunk committed"
        );
    }

    fn on_run_end(&self, report: &RunReport) {
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            failed_step = ?report.failed_step,
            rows_read = report.metrics.rows_read,
            chunks = report.metrics.chunks_committed,
            inserted = report.metrics.diff.inserted,
            updated = report.metrics.diff.updated,
            untouched = report.metrics.diff.untouched,
            deleted_or_stale = report.metrics.diff.deleted_or_stale,
            skipped = report.metrics.skipped,
            "reconciliation run finished"
        );
    }
}

/// Fans every event out to a list of observers, in registration order.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn RunObserver>>,
}

impl ObserverSet {
    pub fn push(&mut self, observer: Box<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RunObserver for ObserverSet {
    fn on_run_start(&self, event: &RunStarted) {
        for observer in &self.observers {
            observer.on_run_start(event);
        }
    }

    fn on_chunk_committed(&self, event: &ChunkCommitted) {
        for observer in &self.observers {
            observer.on_chunk_committed(event);
        }
    }

    fn on_run_end(&self, report: &RunReport) {
        for observer in &self.observers {
            observer.on_run_end(report);
        }
    }
}
