//! Chunked read/transform/apply loop with per-chunk commit and checkpoint.

use chrono::Utc;
use refsync_adapters::{RowIter, RowMapper};
use refsync_core::{Checkpoint, DiffStats};
use refsync_storage::{BackoffPolicy, CheckpointStore, CommitReceipt, EntityStore, Mutation};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ErrorPolicy, RunConfig, StalePolicy};
use crate::error::{RowError, SyncError};
use crate::index::{ApplyOutcome, IdentityIndex};
use crate::observer::{ChunkCommitted, RunObserver};

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub commit_interval: usize,
    pub error_policy: ErrorPolicy,
    pub stale_policy: StalePolicy,
    pub commit_backoff: BackoffPolicy,
}

impl ReconcileSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            commit_interval: config.commit_interval.max(1),
            error_policy: config.error_policy,
            stale_policy: config.stale_policy,
            commit_backoff: BackoffPolicy {
                max_retries: config.commit_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Totals for one run, cumulative across resumed attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub rows_read: u64,
    pub chunks_committed: u64,
    pub skipped: u64,
    pub resumed_from: u64,
    pub diff: DiffStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChunkDelta {
    rows: u64,
    inserted: u64,
    updated: u64,
    modified: u64,
    skipped: u64,
}

impl ChunkDelta {
    fn fold_into(&self, checkpoint: &mut Checkpoint) {
        checkpoint.rows_consumed += self.rows;
        checkpoint.inserted += self.inserted;
        checkpoint.updated += self.updated;
        checkpoint.modified += self.modified;
        checkpoint.skipped += self.skipped;
    }
}

pub struct ChunkedReconciler<'a> {
    store: &'a dyn EntityStore,
    mapper: &'a dyn RowMapper,
    checkpoints: &'a CheckpointStore,
    observer: &'a dyn RunObserver,
    cancel: &'a CancellationToken,
    settings: ReconcileSettings,
    run_id: Uuid,
}

impl<'a> ChunkedReconciler<'a> {
    pub fn new(
        store: &'a dyn EntityStore,
        mapper: &'a dyn RowMapper,
        checkpoints: &'a CheckpointStore,
        observer: &'a dyn RunObserver,
        cancel: &'a CancellationToken,
        settings: ReconcileSettings,
        run_id: Uuid,
    ) -> Self {
        Self {
            store,
            mapper,
            checkpoints,
            observer,
            cancel,
            settings,
            run_id,
        }
    }

    /// Drive `rows` to completion against `index`, advancing `checkpoint` after every commit.
    ///
    /// Rows already covered by `checkpoint.rows_consumed` are skipped without being
    /// re-applied. On error, `checkpoint` holds the last durable progress.
    pub async fn run(
        &self,
        rows: RowIter<'_>,
        index: &mut IdentityIndex,
        checkpoint: &mut Checkpoint,
    ) -> Result<ReconcileSummary, SyncError> {
        let mut rows = rows;
        let resumed_from = checkpoint.rows_consumed;
        if resumed_from > 0 {
            read_blocking(|| self.replay(&mut rows, index, resumed_from));
        }
        let mut rows = rows.peekable();

        let deferred = self.settings.error_policy == ErrorPolicy::AllOrNothing;
        let mut held: Vec<Mutation> = Vec::new();
        let mut held_progress = checkpoint.clone();
        let interval = self.settings.commit_interval;

        loop {
            if read_blocking(|| rows.peek().is_none()) {
                break;
            }
            if self.cancel.is_cancelled() {
                info!(rows_consumed = checkpoint.rows_consumed, "cancellation requested at chunk boundary");
                return Err(SyncError::Cancelled);
            }

            let items: Vec<_> = read_blocking(|| rows.by_ref().take(interval).collect());
            let mut mutations = Vec::with_capacity(interval);
            let mut delta = ChunkDelta::default();
            for item in items {
                delta.rows += 1;
                let candidate = item
                    .map_err(RowError::from)
                    .and_then(|row| self.mapper.map(&row).map_err(RowError::from));
                match candidate {
                    Ok(candidate) => {
                        let applied = index.apply(candidate, Utc::now());
                        match applied.outcome {
                            ApplyOutcome::Inserted => delta.inserted += 1,
                            ApplyOutcome::Updated { changed } => {
                                delta.updated += 1;
                                if changed {
                                    delta.modified += 1;
                                }
                            }
                        }
                        mutations.push(applied.mutation);
                    }
                    Err(err) if self.settings.error_policy == ErrorPolicy::BestEffort => {
                        warn!(line = err.line(), error = %err, "skipping row");
                        delta.skipped += 1;
                    }
                    Err(err) => {
                        return Err(SyncError::Row {
                            policy: self.settings.error_policy,
                            source: err,
                        });
                    }
                }
            }

            if deferred {
                held.append(&mut mutations);
                delta.fold_into(&mut held_progress);
                debug!(held = held.len(), "chunk held for final commit");
            } else {
                let chunk_index = checkpoint.chunks_committed + 1;
                let receipt = self.commit_with_retry(chunk_index, &mutations).await?;

                let mut next = checkpoint.clone();
                delta.fold_into(&mut next);
                next.chunks_committed = chunk_index;
                next.saved_at = Utc::now();
                self.checkpoints.save(&next).await?;
                *checkpoint = next;

                self.observer.on_chunk_committed(&ChunkCommitted {
                    run_id: self.run_id,
                    chunk_index,
                    rows_in_chunk: delta.rows,
                    rows_consumed: checkpoint.rows_consumed,
                    receipt,
                });
            }
        }

        let stale = self.stale_mutations(index);
        let untouched = index.counts().untouched;
        let deleted_or_stale = if deferred {
            held.extend(stale);
            let chunk_index = checkpoint.chunks_committed + 1;
            let receipt = self.commit_with_retry(chunk_index, &held).await?;
            held_progress.chunks_committed = chunk_index;
            held_progress.saved_at = Utc::now();
            *checkpoint = held_progress;
            self.observer.on_chunk_committed(&ChunkCommitted {
                run_id: self.run_id,
                chunk_index,
                rows_in_chunk: checkpoint.rows_consumed - resumed_from,
                rows_consumed: checkpoint.rows_consumed,
                receipt,
            });
            receipt.marked_stale + receipt.deleted
        } else if stale.is_empty() {
            0
        } else {
            let receipt = self
                .commit_with_retry(checkpoint.chunks_committed + 1, &stale)
                .await?;
            receipt.marked_stale + receipt.deleted
        };

        if deleted_or_stale > 0 {
            info!(
                deleted_or_stale,
                policy = ?self.settings.stale_policy,
                "applied stale policy to untouched entities"
            );
        }

        Ok(ReconcileSummary {
            rows_read: checkpoint.rows_consumed,
            chunks_committed: checkpoint.chunks_committed,
            skipped: checkpoint.skipped,
            resumed_from,
            diff: DiffStats {
                inserted: checkpoint.inserted,
                updated: checkpoint.updated,
                modified: checkpoint.modified,
                untouched,
                deleted_or_stale,
            },
        })
    }

    /// Walk past rows an earlier attempt already committed. Only rows that mapped
    /// successfully were applied then, so only those are marked as seen.
    fn replay(&self, rows: &mut RowIter<'_>, index: &mut IdentityIndex, count: u64) {
        let mut replayed = 0u64;
        for item in rows.by_ref().take(count as usize) {
            replayed += 1;
            if let Ok(Ok(candidate)) = item.map(|row| self.mapper.map(&row)) {
                index.mark_replayed(&candidate.identity);
            }
        }
        if replayed < count {
            warn!(replayed, expected = count, "feed ended before checkpoint position");
        } else {
            info!(rows = replayed, "resumed past committed rows");
        }
    }

    fn stale_mutations(&self, index: &IdentityIndex) -> Vec<Mutation> {
        let now = Utc::now();
        match self.settings.stale_policy {
            StalePolicy::Keep => Vec::new(),
            StalePolicy::MarkStale => index
                .untouched()
                .into_iter()
                .map(|identity| Mutation::MarkStale { identity, at: now })
                .collect(),
            StalePolicy::Delete => index.untouched().into_iter().map(Mutation::Delete).collect(),
        }
    }

    async fn commit_with_retry(
        &self,
        chunk: u64,
        mutations: &[Mutation],
    ) -> Result<CommitReceipt, SyncError> {
        let backoff = self.settings.commit_backoff;
        let mut attempt = 0usize;
        loop {
            match self.store.commit(mutations).await {
                Ok(receipt) => {
                    debug!(chunk, mutations = mutations.len(), ?receipt, "commit succeeded");
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(chunk, attempt, ?delay, error = %err, "commit failed; retrying");
                    if self.cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(SyncError::Commit { chunk, source }),
            }
        }
    }
}

/// Run a blocking read of the cached feed. On a multi-threaded runtime the worker is
/// handed over with `block_in_place`; a current-thread runtime reads inline.
pub(crate) fn read_blocking<T>(read: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(read),
        _ => read(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_adapters::{parser_for_schema, ColumnMapper, FeedParser, FeedSchema};
    use refsync_core::{Identity, PersistedEntity};
    use refsync_storage::MemoryEntityStore;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn feed(parser: &dyn FeedParser) -> RowIter<'_> {
        parser.rows(Box::new(Cursor::new(FEED.as_bytes())))
    }

    fn settings(interval: usize, policy: ErrorPolicy) -> ReconcileSettings {
        ReconcileSettings {
            commit_interval: interval,
            error_policy: policy,
            stale_policy: StalePolicy::Keep,
            commit_backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
        }
    }

    const FEED: &str = concat!(
        "{\"domain\":\"iso\",\"code\":\"USD\",\"name\":\"Dollar\"}\n",
        "{\"domain\":\"iso\",\"code\":\"EUR\",\"name\":\"Euro\"}\n",
        "{\"domain\":\"iso\",\"code\":\"JPY\",\"name\":\"Yen\"}\n",
    );

    #[tokio::test]
    async fn commits_in_chunks_and_checkpoints_each_one() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let store = MemoryEntityStore::new();
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        let observer = crate::observer::NoopObserver;
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings(2, ErrorPolicy::StopOnError),
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::new();
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        let summary = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .expect("run");

        assert_eq!(summary.chunks_committed, 2);
        assert_eq!(summary.diff.inserted, 3);
        assert_eq!(store.len(), 3);
        let saved = checkpoints.load().await.expect("load").expect("saved");
        assert_eq!(saved.rows_consumed, 3);
        assert_eq!(saved.chunks_committed, 2);
    }

    #[tokio::test]
    async fn stale_policy_marks_untouched_entities() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let old = PersistedEntity {
            identity: Identity::new("iso", "DEM", ""),
            attributes: Default::default(),
            stale: false,
            first_seen_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = MemoryEntityStore::with_entities([old.clone()]);
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        let observer = crate::observer::NoopObserver;
        let mut settings = settings(10, ErrorPolicy::StopOnError);
        settings.stale_policy = StalePolicy::MarkStale;
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings,
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::from_entities([old]);
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        let summary = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .expect("run");

        assert_eq!(summary.diff.untouched, 1);
        assert_eq!(summary.diff.deleted_or_stale, 1);
        let dem = store
            .get(&Identity::new("iso", "DEM", ""))
            .await
            .expect("get")
            .expect("kept");
        assert!(dem.stale);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_chunk() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let store = MemoryEntityStore::new();
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let observer = crate::observer::NoopObserver;
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings(2, ErrorPolicy::StopOnError),
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::new();
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        let err = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(store.is_empty());
        assert_eq!(checkpoint.rows_consumed, 0);
    }

    /// Requests a stop as soon as the given chunk has been committed.
    struct StopAfterChunk {
        chunk: u64,
        cancel: CancellationToken,
    }

    impl RunObserver for StopAfterChunk {
        fn on_chunk_committed(&self, event: &ChunkCommitted) {
            if event.chunk_index == self.chunk {
                self.cancel.cancel();
            }
        }
    }

    #[tokio::test]
    async fn stop_after_final_full_chunk_still_completes() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let old = PersistedEntity::from_candidate(
            refsync_core::CandidateEntity {
                identity: Identity::new("iso", "DEM", ""),
                attributes: Default::default(),
                source_line: 0,
            },
            Utc::now(),
        );
        let store = MemoryEntityStore::with_entities([old.clone()]);
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        let observer = StopAfterChunk {
            chunk: 1,
            cancel: cancel.clone(),
        };
        let mut settings = settings(3, ErrorPolicy::StopOnError);
        settings.stale_policy = StalePolicy::MarkStale;
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings,
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::from_entities([old]);
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        let summary = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .expect("every row was committed before the stop");

        assert!(cancel.is_cancelled());
        assert_eq!(summary.chunks_committed, 1);
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.diff.deleted_or_stale, 1);
        let dem = store
            .get(&Identity::new("iso", "DEM", ""))
            .await
            .expect("get")
            .expect("kept");
        assert!(dem.stale);
    }

    #[tokio::test]
    async fn stop_with_rows_left_ends_cancelled() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let store = MemoryEntityStore::new();
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        let observer = StopAfterChunk {
            chunk: 1,
            cancel: cancel.clone(),
        };
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings(2, ErrorPolicy::StopOnError),
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::new();
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        let err = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(store.len(), 2);
        assert_eq!(checkpoint.rows_consumed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunk_reads_run_on_multi_thread_runtime() {
        let dir = tempdir().expect("tempdir");
        let schema = FeedSchema::default();
        let parser = parser_for_schema(&schema).expect("parser");
        let mapper = ColumnMapper::from_schema(&schema);
        let store = MemoryEntityStore::new();
        let checkpoints = CheckpointStore::new(dir.path().join("cp.json"));
        let cancel = CancellationToken::new();
        let observer = crate::observer::NoopObserver;
        let reconciler = ChunkedReconciler::new(
            &store,
            &mapper,
            &checkpoints,
            &observer,
            &cancel,
            settings(2, ErrorPolicy::StopOnError),
            Uuid::new_v4(),
        );

        let mut index = IdentityIndex::new();
        let mut checkpoint = Checkpoint::fresh("key", "hash");
        checkpoint.rows_consumed = 1;
        let summary = reconciler
            .run(feed(parser.as_ref()), &mut index, &mut checkpoint)
            .await
            .expect("run");

        assert_eq!(summary.resumed_from, 1);
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.diff.inserted, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn read_blocking_runs_inline_without_a_runtime() {
        assert_eq!(read_blocking(|| 7), 7);
    }
}
