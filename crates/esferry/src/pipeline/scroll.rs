//! Slice producers: drain one cursor each into the shared queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connectors::{ScrollRequest, ScrollSource};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::progress::Progress;

/// Tracks finished slices and closes the queue after the last one.
///
/// Holds the original queue sender; every slice works with a clone. The
/// last slice to finish drops the original, so the queue closes exactly
/// once every producer is done.
#[derive(Debug)]
pub struct SliceCompletion {
    total: usize,
    finished: AtomicUsize,
    sender: Mutex<Option<Sender<Document>>>,
}

impl SliceCompletion {
    /// Creates the tracker for `total` slices.
    pub fn new(total: usize, sender: Sender<Document>) -> Arc<Self> {
        Arc::new(Self {
            total,
            finished: AtomicUsize::new(0),
            sender: Mutex::new(Some(sender)),
        })
    }

    /// A sender for one producer, `None` once the queue is closed.
    pub fn sender(&self) -> Option<Sender<Document>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records one finished slice. Returns true for the last one.
    pub fn finish(&self) -> bool {
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if done < self.total {
            return false;
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("All {} slices finished, queue closed for writing", self.total);
        true
    }

    /// Number of slices finished so far.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }
}

/// Marks the slice finished even if the producer panics.
struct FinishGuard(Arc<SliceCompletion>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn push_page(
    tx: &Sender<Document>,
    documents: Vec<Document>,
    progress: &Progress,
) -> Result<u64> {
    let mut sent = 0;
    for doc in documents {
        tx.send(doc).await.map_err(|_| Error::QueueClosed)?;
        progress.add_scrolled(1);
        sent += 1;
    }
    Ok(sent)
}

/// Follows a cursor until an empty page or a failed advance.
async fn drain(
    source: &dyn ScrollSource,
    keep_alive: &str,
    scroll_id: &mut String,
    first_page: Vec<Document>,
    tx: &Sender<Document>,
    progress: &Progress,
) -> Result<u64> {
    let mut sent = push_page(tx, first_page, progress).await?;
    loop {
        let page = match source.next_page(scroll_id, keep_alive).await {
            Ok(page) => page,
            Err(e) => {
                error!("Scroll advance failed after {} documents: {}", sent, e);
                return Ok(sent);
            }
        };
        if !page.scroll_id.is_empty() {
            *scroll_id = page.scroll_id;
        }
        if page.documents.is_empty() {
            return Ok(sent);
        }
        sent += push_page(tx, page.documents, progress).await?;
    }
}

/// Streams every document of one slice into `tx`.
///
/// Returns the number of documents queued.
///
/// # Errors
///
/// Returns an error when the cursor cannot be opened or the queue is closed
/// by the consumers. A failed advance only ends the slice early.
pub async fn scroll_slice(
    source: &dyn ScrollSource,
    request: &ScrollRequest,
    tx: &Sender<Document>,
    progress: &Progress,
) -> Result<u64> {
    let page = source.open_scroll(request).await?;
    progress.add_scroll_total(page.total_hits);

    let mut scroll_id = page.scroll_id;
    let outcome = if page.total_hits == 0 {
        Ok(0)
    } else {
        drain(
            source,
            &request.keep_alive,
            &mut scroll_id,
            page.documents,
            tx,
            progress,
        )
        .await
    };

    if let Err(e) = source.clear_scroll(&scroll_id).await {
        warn!("Failed to release scroll cursor: {}", e);
    }
    outcome
}

/// Spawns the producer for one slice.
pub fn spawn_slice(
    source: Arc<dyn ScrollSource>,
    request: ScrollRequest,
    completion: Arc<SliceCompletion>,
    progress: Arc<Progress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = FinishGuard(completion.clone());
        let slice = request.slice.map_or(0, |s| s.id);
        let Some(tx) = completion.sender() else {
            return;
        };

        match scroll_slice(source.as_ref(), &request, &tx, &progress).await {
            Ok(sent) => info!(
                "Slice {} of {} finished: {} documents",
                slice, request.indexes, sent
            ),
            Err(e) => error!("Slice {} of {} stopped: {}", slice, request.indexes, e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::MemoryCluster;
    use crate::connectors::{ScrollPage, ScrollSource};
    use crate::document::payload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn seeded(n: usize) -> Arc<MemoryCluster> {
        let cluster = MemoryCluster::new();
        for i in 0..n {
            cluster.insert("logs", &i.to_string(), payload(json!({"n": i})));
        }
        Arc::new(cluster)
    }

    #[test]
    fn test_completion_closes_after_last_slice() {
        let (tx, mut rx) = mpsc::channel::<Document>(1);
        let completion = SliceCompletion::new(3, tx);

        assert!(!completion.finish());
        assert!(!completion.finish());
        assert!(completion.sender().is_some());
        assert!(completion.finish());

        assert_eq!(completion.finished(), 3);
        assert!(completion.sender().is_none());
        assert!(rx.try_recv().is_err());
        assert!(rx.blocking_recv().is_none());
    }

    #[tokio::test]
    async fn test_slices_deliver_every_document_once() {
        let cluster = seeded(120);
        let (tx, mut rx) = mpsc::channel(16);
        let completion = SliceCompletion::new(4, tx);
        let progress = Progress::new();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                spawn_slice(
                    cluster.clone(),
                    ScrollRequest::new("logs", 7).with_slice(i, 4),
                    completion.clone(),
                    progress.clone(),
                )
            })
            .collect();

        let mut ids = HashSet::new();
        let mut received = 0;
        while let Some(doc) = rx.recv().await {
            received += 1;
            ids.insert(doc.id.unwrap());
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(received, 120);
        assert_eq!(ids.len(), 120);
        assert_eq!(progress.snapshot().scrolled, 120);
        assert_eq!(progress.snapshot().scroll_total, 120);
        assert_eq!(cluster.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_counts_as_finished() {
        let cluster = seeded(3);
        let (tx, mut rx) = mpsc::channel(16);
        let completion = SliceCompletion::new(2, tx);
        let progress = Progress::new();

        spawn_slice(
            cluster.clone(),
            ScrollRequest::new("missing", 10),
            completion.clone(),
            progress.clone(),
        )
        .await
        .unwrap();
        spawn_slice(
            cluster.clone(),
            ScrollRequest::new("logs", 10),
            completion.clone(),
            progress.clone(),
        )
        .await
        .unwrap();

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
        assert_eq!(completion.finished(), 2);
    }

    struct FlakySource {
        inner: MemoryCluster,
    }

    #[async_trait]
    impl ScrollSource for FlakySource {
        async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage> {
            self.inner.open_scroll(request).await
        }

        async fn next_page(&self, _scroll_id: &str, _keep_alive: &str) -> Result<ScrollPage> {
            Err(Error::cluster("flaky", "next scroll page", 500, "node left"))
        }

        async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
            self.inner.clear_scroll(scroll_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_advance_keeps_first_page_and_releases_cursor() {
        let inner = MemoryCluster::new();
        for i in 0..10 {
            inner.insert("logs", &i.to_string(), payload(json!({})));
        }
        let source = FlakySource { inner };
        let (tx, mut rx) = mpsc::channel(100);
        let progress = Progress::new();

        let sent = scroll_slice(&source, &ScrollRequest::new("logs", 4), &tx, &progress)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(sent, 4);
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);
        assert_eq!(source.inner.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_empty_slice_finishes_without_advancing() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create_index("empty");
        let (tx, mut rx) = mpsc::channel(1);
        let progress = Progress::new();

        let sent = scroll_slice(
            cluster.as_ref(),
            &ScrollRequest::new("empty", 10),
            &tx,
            &progress,
        )
        .await
        .unwrap();
        drop(tx);

        assert_eq!(sent, 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(cluster.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_stops_producer() {
        let cluster = seeded(5);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = scroll_slice(
            cluster.as_ref(),
            &ScrollRequest::new("logs", 10),
            &tx,
            &Progress::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::QueueClosed));
        assert_eq!(cluster.open_cursors(), 0);
    }
}
