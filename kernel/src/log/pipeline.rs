// Batched Commit Pipeline
//
// Coalesces append requests from many aggregates into bulk loads.
//
// Producers push onto an unbounded queue and never block. A single drain
// worker, elected by compare-and-swap on `draining`, empties the queue in
// debounced rounds and commits each merged batch:
//
//   batch of 1      -> single-row insert
//   batch of many   -> bulk load into the current partition
//   bulk rejected   -> every row retried as its own insert
//
// Each request's completion signal is resolved exactly once with
// Committed, Duplicate (unique key conflict) or the storage fault.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::now_millis;
use super::partition::PartitionResolver;
use super::store::{EventLogBackend, LogRow, StoreError};
use crate::config::PipelineConfig;

/// Non-error result of a durable append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// `(aggregate_id, version)` or `(aggregate_id, token)` already exists.
    Duplicate,
}

type Completion = oneshot::Sender<Result<CommitOutcome, StoreError>>;

struct BatchItem {
    row: LogRow,
    done: Completion,
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub batches: u64,
    pub bulk_loads: u64,
    pub bulk_fallbacks: u64,
    pub single_inserts: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    bulk_loads: AtomicU64,
    bulk_fallbacks: AtomicU64,
    single_inserts: AtomicU64,
    committed: AtomicU64,
    duplicates: AtomicU64,
    faults: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            batches: self.batches.load(Ordering::Relaxed),
            bulk_loads: self.bulk_loads.load(Ordering::Relaxed),
            bulk_fallbacks: self.bulk_fallbacks.load(Ordering::Relaxed),
            single_inserts: self.single_inserts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

pub struct CommitPipeline {
    shared: Arc<Shared>,
}

struct Shared {
    config: PipelineConfig,
    backend: Arc<dyn EventLogBackend>,
    partitions: Arc<PartitionResolver>,
    queue: Sender<BatchItem>,
    pending: Receiver<BatchItem>,
    draining: AtomicBool,
    counters: Counters,
}

impl CommitPipeline {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn EventLogBackend>,
        partitions: Arc<PartitionResolver>,
    ) -> Self {
        let (queue, pending) = unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                partitions,
                queue,
                pending,
                draining: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Enqueue one row and wait until the drain worker resolves it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn submit(&self, row: LogRow) -> Result<CommitOutcome, StoreError> {
        let (done, outcome) = oneshot::channel();
        self.shared
            .queue
            .send(BatchItem { row, done })
            .map_err(|_| StoreError::PipelineClosed)?;
        Shared::trigger(&self.shared);

        outcome.await.map_err(|_| StoreError::PipelineClosed)?
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Shared {
    fn try_acquire(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Start a drain worker unless one is already running.
    fn trigger(shared: &Arc<Self>) {
        if shared.try_acquire() {
            let worker = Arc::clone(shared);
            tokio::spawn(async move { worker.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            while let Some(batch) = self.collect().await {
                self.commit(batch).await;
            }
            self.draining.store(false, Ordering::SeqCst);
            // The release must be visible before the queue is re-read, or a
            // producer can both miss the flag and be missed here.
            fence(Ordering::SeqCst);

            // An item pushed between the last empty poll and the release saw
            // the flag still set; pick it up here rather than strand it.
            if self.pending.is_empty() || !self.try_acquire() {
                break;
            }
        }
    }

    /// Drain the queue, then keep merging late arrivals for a bounded
    /// number of debounce rounds.
    async fn collect(&self) -> Option<Vec<BatchItem>> {
        let mut batch: Vec<BatchItem> = self.pending.try_iter().collect();
        if batch.is_empty() {
            return None;
        }

        let debounce = self.config.debounce();
        sleep(debounce).await;
        for _ in 0..self.config.max_extra_rounds {
            let merged = batch.len();
            batch.extend(self.pending.try_iter());
            if batch.len() == merged {
                break;
            }
            sleep(debounce).await;
        }

        Some(batch)
    }

    async fn commit(&self, batch: Vec<BatchItem>) {
        Counters::bump(&self.counters.batches);
        let (rows, completions): (Vec<LogRow>, Vec<Completion>) =
            batch.into_iter().map(|item| (item.row, item.done)).unzip();

        if rows.len() > 1 && rows.len() >= self.config.bulk_threshold {
            match self.bulk_load(&rows).await {
                Ok(()) => {
                    Counters::bump(&self.counters.bulk_loads);
                    debug!(batch_size = rows.len(), "bulk loaded batch");
                    for done in completions {
                        self.resolve(done, Ok(CommitOutcome::Committed));
                    }
                    return;
                }
                Err(err) => {
                    Counters::bump(&self.counters.bulk_fallbacks);
                    warn!(
                        batch_size = rows.len(),
                        error = %err,
                        "bulk load rejected, retrying rows individually"
                    );
                }
            }
        }

        for (row, done) in rows.iter().zip(completions) {
            let outcome = self.insert(row).await;
            self.resolve(done, outcome);
        }
    }

    async fn bulk_load(&self, rows: &[LogRow]) -> Result<(), StoreError> {
        let partition = self.partitions.resolve(now_millis()).await?;
        self.backend.bulk_load(&partition, rows).await
    }

    async fn insert(&self, row: &LogRow) -> Result<CommitOutcome, StoreError> {
        Counters::bump(&self.counters.single_inserts);
        let partition = self.partitions.resolve(row.timestamp).await?;
        match self.backend.insert(&partition, row).await {
            Ok(()) => Ok(CommitOutcome::Committed),
            Err(err) if err.is_unique_violation() => Ok(CommitOutcome::Duplicate),
            Err(err) => Err(err),
        }
    }

    fn resolve(&self, done: Completion, outcome: Result<CommitOutcome, StoreError>) {
        let counter = match &outcome {
            Ok(CommitOutcome::Committed) => &self.counters.committed,
            Ok(CommitOutcome::Duplicate) => &self.counters.duplicates,
            Err(_) => &self.counters.faults,
        };
        Counters::bump(counter);

        // The caller may have gone away; the row is durable either way.
        let _ = done.send(outcome);
    }
}
