//! Post-run status publication and report files.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use refsync_core::{DiffStats, Identity, ObservedStatus};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncError;
use crate::index::IdentityIndex;
use crate::pipeline::RunReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub identity: Identity,
    pub status: ObservedStatus,
}

/// Final observed status of every identity the run knew about, in identity order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub run_id: Uuid,
    pub diff: DiffStats,
    pub entries: Vec<StatusRow>,
}

impl StatusSnapshot {
    pub fn count(&self, status: ObservedStatus) -> usize {
        self.entries.iter().filter(|row| row.status == status).count()
    }
}

/// A downstream consumer of the status map. Sinks run after the main loop, in order.
pub trait StatusSink: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, snapshot: &StatusSnapshot) -> Result<()>;
}

#[derive(Default)]
pub struct StatusPublisher {
    sinks: Vec<Box<dyn StatusSink>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Box<dyn StatusSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Drain `index` into a snapshot and hand it to every sink.
    ///
    /// The index is empty afterwards whether or not a sink fails.
    pub fn publish(
        &self,
        run_id: Uuid,
        diff: DiffStats,
        index: &mut IdentityIndex,
    ) -> Result<StatusSnapshot, SyncError> {
        let entries = index
            .take_entries()
            .into_iter()
            .map(|entry| StatusRow {
                identity: entry.identity,
                status: entry.status,
            })
            .collect();
        let snapshot = StatusSnapshot {
            run_id,
            diff,
            entries,
        };

        for sink in &self.sinks {
            sink.publish(&snapshot).map_err(|source| SyncError::Sink {
                sink: sink.name().to_string(),
                source,
            })?;
            debug!(sink = sink.name(), rows = snapshot.entries.len(), "status published");
        }
        Ok(snapshot)
    }
}

fn run_dir(reports_dir: &Path, run_id: Uuid) -> Result<PathBuf> {
    let dir = reports_dir.join(run_id.to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

/// Writes `<reports_dir>/<run_id>/status.json`.
#[derive(Debug, Clone)]
pub struct JsonStatusSink {
    reports_dir: PathBuf,
}

impl JsonStatusSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }
}

impl StatusSink for JsonStatusSink {
    fn name(&self) -> &str {
        "json"
    }

    fn publish(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let path = run_dir(&self.reports_dir, snapshot.run_id)?.join("status.json");
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing status snapshot")?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "status snapshot written");
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/status.parquet` with one row per identity.
#[derive(Debug, Clone)]
pub struct ParquetStatusSink {
    reports_dir: PathBuf,
}

impl ParquetStatusSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }
}

impl StatusSink for ParquetStatusSink {
    fn name(&self) -> &str {
        "parquet"
    }

    fn publish(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let path = run_dir(&self.reports_dir, snapshot.run_id)?.join("status.parquet");
        write_status_parquet(&path, &snapshot.entries)
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_status_parquet(path: &Path, rows: &[StatusRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("code", DataType::Utf8, false),
        ArrowField::new("qualifier", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
    ]));

    let domains = StringArray::from(
        rows.iter()
            .map(|r| r.identity.domain.as_str())
            .collect::<Vec<_>>(),
    );
    let codes = StringArray::from(rows.iter().map(|r| r.identity.code.as_str()).collect::<Vec<_>>());
    let qualifiers = StringArray::from(
        rows.iter()
            .map(|r| r.identity.qualifier.as_str())
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(rows.iter().map(|r| r.status.as_str()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(domains),
            Arc::new(codes),
            Arc::new(qualifiers),
            Arc::new(statuses),
        ],
    )
    .context("building status record batch")?;
    write_parquet(path, batch)
}

/// Writes `<reports_dir>/<run_id>/run_report.json` and returns its path.
pub fn write_run_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let path = run_dir(reports_dir, report.run_id)?.join("run_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
