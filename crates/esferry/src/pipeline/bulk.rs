//! Bulk workers: drain the shared queue into size-bounded bulk requests.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::BulkOptions;
use crate::connectors::BulkSink;
use crate::document::Document;
use crate::pipeline::batch::{encode, BatchBuffer, BulkAction};
use crate::pipeline::QueueReceiver;
use crate::progress::Progress;
use crate::transform::Transformer;

/// Why a batch is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    /// The next document would cross the byte bound.
    Full,
    /// No document arrived within the idle timeout.
    Idle,
    /// No document arrived within the task timeout.
    Abandoned,
    /// The queue is closed and empty.
    Drained,
    /// A document lacked a required field.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Reading,
    Flushing(FlushReason),
    Done(WorkerExit),
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue was closed and fully drained.
    Drained,
    /// The task timeout elapsed without input.
    Abandoned,
    /// A malformed document ended the stream for this worker.
    Malformed,
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// How the worker ended.
    pub exit: WorkerExit,
    /// Documents read from the queue.
    pub documents: u64,
    /// Bulk requests attempted.
    pub flushes: u64,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// One consumer of the shared queue. Owns its batch buffer.
pub struct BulkWorker {
    id: usize,
    queue: QueueReceiver,
    sink: Arc<dyn BulkSink>,
    transformer: Arc<Transformer>,
    buffer: BatchBuffer,
    idle_timeout: Duration,
    task_timeout: Option<Duration>,
    sleep_after_bulk: Option<Duration>,
    progress: Arc<Progress>,
}

impl BulkWorker {
    /// Creates worker `id`.
    pub fn new(
        id: usize,
        queue: QueueReceiver,
        sink: Arc<dyn BulkSink>,
        transformer: Arc<Transformer>,
        options: &BulkOptions,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            transformer,
            buffer: BatchBuffer::new(options.bulk_size_bytes()),
            idle_timeout: options.idle_timeout(),
            task_timeout: options.task_timeout(),
            sleep_after_bulk: options.sleep_after_bulk(),
            progress,
        }
    }

    /// Consumes documents until the queue closes, the task timeout fires, or
    /// a malformed document arrives. Always flushes what is buffered first.
    pub async fn run(mut self) -> WorkerReport {
        let mut state = WorkerState::Reading;
        let mut carry: Option<String> = None;
        let mut documents = 0;
        let mut flushes = 0;
        let mut idle_deadline = Instant::now() + self.idle_timeout;
        let mut task_deadline = self.task_timeout.map(|t| Instant::now() + t);

        let exit = loop {
            state = match state {
                WorkerState::Reading => {
                    tokio::select! {
                        doc = self.queue.recv() => match doc {
                            None => WorkerState::Flushing(FlushReason::Drained),
                            Some(doc) => {
                                documents += 1;
                                idle_deadline = Instant::now() + self.idle_timeout;
                                task_deadline = self.task_timeout.map(|t| Instant::now() + t);
                                self.accept(doc, &mut carry)
                            }
                        },
                        () = sleep_until(idle_deadline) => {
                            idle_deadline = Instant::now() + self.idle_timeout;
                            if self.buffer.is_empty() {
                                WorkerState::Reading
                            } else {
                                debug!("Worker {}: idle, flushing {} documents", self.id, self.buffer.operations());
                                WorkerState::Flushing(FlushReason::Idle)
                            }
                        }
                        () = until(task_deadline) => WorkerState::Flushing(FlushReason::Abandoned),
                    }
                }
                WorkerState::Flushing(reason) => {
                    if !self.buffer.is_empty() {
                        flushes += 1;
                        self.flush().await;
                    }
                    if let Some(encoded) = carry.take() {
                        self.buffer.push_encoded(&encoded);
                    }
                    match reason {
                        FlushReason::Full | FlushReason::Idle => WorkerState::Reading,
                        FlushReason::Drained => WorkerState::Done(WorkerExit::Drained),
                        FlushReason::Abandoned => WorkerState::Done(WorkerExit::Abandoned),
                        FlushReason::Malformed => WorkerState::Done(WorkerExit::Malformed),
                    }
                }
                WorkerState::Done(exit) => break exit,
            };
        };

        match exit {
            WorkerExit::Drained => debug!("Worker {} drained the queue", self.id),
            WorkerExit::Abandoned => warn!(
                "Worker {} saw no documents for {:?}, stopping",
                self.id, self.task_timeout
            ),
            WorkerExit::Malformed => warn!("Worker {} stopped on a malformed document", self.id),
        }
        info!(
            "Worker {} done: {} documents, {} bulk requests",
            self.id, documents, flushes
        );

        WorkerReport {
            exit,
            documents,
            flushes,
        }
    }

    /// Validates, transforms and buffers one document.
    fn accept(&mut self, doc: Document, carry: &mut Option<String>) -> WorkerState {
        if let Some(field) = self.transformer.missing_field(&doc) {
            error!(
                "Worker {}: document {:?} in {:?} has no {}, ending stream",
                self.id, doc.id, doc.index, field
            );
            self.progress.inc_malformed();
            return WorkerState::Flushing(FlushReason::Malformed);
        }

        let doc = self.transformer.apply(doc);
        let encoded = match encode(&BulkAction::Index(doc)) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Worker {}: {}, ending stream", self.id, e);
                self.progress.inc_malformed();
                return WorkerState::Flushing(FlushReason::Malformed);
            }
        };

        if encoded.len() > self.buffer.max_bytes() {
            warn!(
                "Worker {}: document of {} bytes exceeds the {} byte bulk bound, sent on its own",
                self.id,
                encoded.len(),
                self.buffer.max_bytes()
            );
        }
        if self.buffer.would_overflow(encoded.len()) {
            *carry = Some(encoded);
            WorkerState::Flushing(FlushReason::Full)
        } else {
            self.buffer.push_encoded(&encoded);
            WorkerState::Reading
        }
    }

    /// Sends the buffer. Failures are logged and the batch is dropped.
    async fn flush(&mut self) {
        let body = self.buffer.take();
        self.progress.inc_bulk_requests();

        match self.sink.bulk(&body).await {
            Ok(summary) => {
                let failed = summary.failed_items as u64;
                self.progress
                    .add_written((body.operations as u64).saturating_sub(failed));
                if failed > 0 {
                    self.progress.add_failed_items(failed);
                }
            }
            Err(e) => {
                error!(
                    "Worker {}: bulk of {} documents ({} bytes) failed, batch dropped: {}",
                    self.id,
                    body.operations,
                    body.len(),
                    e
                );
                self.progress.inc_failed_batches();
            }
        }

        if let Some(pause) = self.sleep_after_bulk {
            sleep(pause).await;
        }
    }
}
