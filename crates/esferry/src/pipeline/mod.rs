//! Extract/load pipeline.
//!
//! One producer per slice fills a bounded shared queue; a pool of bulk
//! workers (or a single dump writer) drains it. Each repeat round gets a
//! fresh queue.

pub mod batch;
pub mod bulk;
pub mod dump;
pub mod scroll;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{BulkOptions, OutputFileConfig};
use crate::connectors::{BulkSink, ScrollRequest, ScrollSource};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressSnapshot};
use crate::transform::Transformer;

use self::bulk::BulkWorker;
use self::scroll::{spawn_slice, SliceCompletion};

/// Bounded queue between slice producers and consumers.
///
/// Producers block when it is full. It closes once every sender is gone.
pub struct DocQueue {
    tx: Sender<Document>,
    rx: QueueReceiver,
}

impl DocQueue {
    /// Creates a queue holding at most `capacity` documents.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: QueueReceiver(Arc::new(Mutex::new(rx))),
        }
    }

    /// Splits into the producing and consuming halves.
    #[must_use]
    pub fn split(self) -> (Sender<Document>, QueueReceiver) {
        (self.tx, self.rx)
    }
}

/// Consuming half of a [`DocQueue`], shared by every worker.
#[derive(Clone)]
pub struct QueueReceiver(Arc<Mutex<mpsc::Receiver<Document>>>);

impl QueueReceiver {
    /// Waits for the next document; `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<Document> {
        self.0.lock().await.recv().await
    }
}

/// Where a round's documents go.
#[derive(Clone)]
pub enum Output {
    /// A cluster, through the bulk worker pool.
    Bulk(Arc<dyn BulkSink>),
    /// A local file, through a single dump writer.
    File(OutputFileConfig),
}

/// Totals of a migration run.
#[derive(Debug, Default, Clone)]
pub struct MigrationStats {
    /// Documents pulled from the source.
    pub scrolled: u64,
    /// Documents accepted by the destination.
    pub written: u64,
    /// Bulk requests sent.
    pub bulk_requests: u64,
    /// Bulk requests that failed and were dropped.
    pub failed_batches: u64,
    /// Items rejected inside successful bulk requests.
    pub failed_items: u64,
    /// Documents that stopped a worker.
    pub malformed: u64,
    /// Rounds completed.
    pub rounds: usize,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl MigrationStats {
    fn from_snapshot(snapshot: ProgressSnapshot, rounds: usize, duration_secs: f64) -> Self {
        Self {
            scrolled: snapshot.scrolled,
            written: snapshot.written,
            bulk_requests: snapshot.bulk_requests,
            failed_batches: snapshot.failed_batches,
            failed_items: snapshot.failed_items,
            malformed: snapshot.malformed,
            rounds,
            duration_secs,
        }
    }

    /// Documents written per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.written as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Migration pipeline.
pub struct Pipeline {
    source: Arc<dyn ScrollSource>,
    output: Output,
    request: ScrollRequest,
    slices: usize,
    bulk: BulkOptions,
    transformer: Arc<Transformer>,
    repeat_times: usize,
    progress: Arc<Progress>,
}

impl Pipeline {
    /// Creates a pipeline reading `request` (unsliced) from `source`.
    pub fn new(
        source: Arc<dyn ScrollSource>,
        output: Output,
        request: ScrollRequest,
        bulk: BulkOptions,
        transformer: Transformer,
    ) -> Self {
        Self {
            source,
            output,
            request,
            slices: 1,
            bulk,
            transformer: Arc::new(transformer),
            repeat_times: 1,
            progress: Progress::new(),
        }
    }

    /// Reads with `slices` parallel cursors.
    #[must_use]
    pub fn with_slices(mut self, slices: usize) -> Self {
        self.slices = slices.max(1);
        self
    }

    /// Replays the whole source `times` times.
    #[must_use]
    pub fn with_repeat(mut self, times: usize) -> Self {
        self.repeat_times = times.max(1);
        self
    }

    /// Reports into shared counters instead of private ones.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Counters updated by this pipeline.
    #[must_use]
    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Runs every round.
    ///
    /// # Errors
    ///
    /// Returns an error if the dump file cannot be written. Cursor and bulk
    /// failures are logged and do not abort the run.
    pub async fn run(&self) -> Result<MigrationStats> {
        let start = Instant::now();
        info!(
            "Starting migration of {} ({} slices, {} rounds)",
            self.request.indexes, self.slices, self.repeat_times
        );

        for round in 1..=self.repeat_times {
            if self.repeat_times > 1 {
                info!("Round {}/{}", round, self.repeat_times);
            }
            self.run_round().await?;
        }

        let stats = MigrationStats::from_snapshot(
            self.progress.snapshot(),
            self.repeat_times,
            start.elapsed().as_secs_f64(),
        );
        info!(
            "Migration complete: {} scrolled, {} written, {} failed batches in {:.2}s ({:.0} docs/sec)",
            stats.scrolled,
            stats.written,
            stats.failed_batches,
            stats.duration_secs,
            stats.throughput()
        );
        Ok(stats)
    }

    async fn run_round(&self) -> Result<()> {
        let (tx, rx) = DocQueue::new(self.bulk.queue_capacity).split();
        let completion = SliceCompletion::new(self.slices, tx);

        let producers: Vec<_> = (0..self.slices)
            .map(|slice| {
                spawn_slice(
                    self.source.clone(),
                    self.request.clone().with_slice(slice, self.slices),
                    completion.clone(),
                    self.progress.clone(),
                )
            })
            .collect();

        let consumers: Vec<_> = match &self.output {
            Output::Bulk(sink) => (0..self.bulk.workers)
                .map(|id| {
                    let worker = BulkWorker::new(
                        id,
                        rx.clone(),
                        sink.clone(),
                        self.transformer.clone(),
                        &self.bulk,
                        self.progress.clone(),
                    );
                    tokio::spawn(async move {
                        worker.run().await;
                        Ok::<_, Error>(())
                    })
                })
                .collect(),
            Output::File(config) => {
                let config = config.clone();
                let progress = self.progress.clone();
                let rx = rx.clone();
                vec![tokio::spawn(async move {
                    dump::write_dump(rx, &config, &progress).await.map(|_| ())
                })]
            }
        };
        drop(rx);

        for producer in producers {
            if let Err(e) = producer.await {
                error!("Slice producer crashed: {}", e);
            }
        }

        let mut outcome = Ok(());
        for consumer in consumers {
            match consumer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => outcome = Err(e),
                Err(e) => error!("Consumer crashed: {}", e),
            }
        }

        if completion.finished() < self.slices {
            warn!(
                "{} of {} slices did not report completion",
                self.slices - completion.finished(),
                self.slices
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_stats_throughput() {
        let stats = MigrationStats {
            written: 1000,
            duration_secs: 2.0,
            ..MigrationStats::default()
        };

        assert!((stats.throughput() - 500.0).abs() < 0.001);
    }

    #[test]
    fn test_migration_stats_zero_duration() {
        let stats = MigrationStats::default();
        assert_eq!(stats.throughput(), 0.0);
    }

    #[tokio::test]
    async fn test_queue_blocks_when_full() {
        let (tx, rx) = DocQueue::new(2).split();
        tx.send(Document::default()).await.unwrap();
        tx.send(Document::default()).await.unwrap();

        assert!(tx.try_send(Document::default()).is_err());

        rx.recv().await.unwrap();
        assert!(tx.try_send(Document::default()).is_ok());
    }

    #[tokio::test]
    async fn test_queue_closes_when_senders_drop() {
        let (tx, rx) = DocQueue::new(4).split();
        let second = tx.clone();
        tx.send(Document::default()).await.unwrap();
        drop(tx);
        drop(second);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
