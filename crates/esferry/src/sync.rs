//! Incremental sync: merge-join two id-ordered cursors and write the difference.
//!
//! Both sides are scrolled sorted by id. Documents seen on one side wait in a
//! pending map until the other side either produces the same id (compare) or
//! provably moves past it (add or delete). Neither index is ever held in full.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::connectors::{BulkSink, ScrollPage, ScrollRequest, ScrollSource};
use crate::document::Document;
use crate::error::Result;
use crate::pipeline::batch::{encode, BatchBuffer, BulkAction};
use crate::progress::Progress;

/// Default type for typed destinations when the source document has none.
const DEFAULT_TYPE: &str = "_doc";

/// Operations produced by one round of the diff.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiffOutput {
    /// Source documents missing from the destination.
    pub adds: Vec<Document>,
    /// Source documents whose destination copy differs.
    pub updates: Vec<Document>,
    /// Destination documents missing from the source (only with deletion enabled).
    pub deletes: Vec<Document>,
}

impl DiffOutput {
    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Merge-join state between a source and a destination cursor.
///
/// Pure bookkeeping: callers feed it pages and write out what it returns.
/// An id never sits in both pending maps at once.
#[derive(Debug)]
pub struct DiffState {
    enable_delete: bool,
    last_source_id: Option<String>,
    last_dest_id: Option<String>,
    pending_source: BTreeMap<String, Document>,
    pending_dest: BTreeMap<String, Document>,
    source_exhausted: bool,
    dest_exhausted: bool,
    need_source: bool,
    need_dest: bool,
    output: DiffOutput,
    added: u64,
    updated: u64,
    deleted: u64,
    orphaned: u64,
}

impl DiffState {
    /// Fresh state; both sides need their first page.
    #[must_use]
    pub fn new(enable_delete: bool) -> Self {
        Self {
            enable_delete,
            last_source_id: None,
            last_dest_id: None,
            pending_source: BTreeMap::new(),
            pending_dest: BTreeMap::new(),
            source_exhausted: false,
            dest_exhausted: false,
            need_source: true,
            need_dest: true,
            output: DiffOutput::default(),
            added: 0,
            updated: 0,
            deleted: 0,
            orphaned: 0,
        }
    }

    /// Whether the source cursor should be advanced next.
    #[must_use]
    pub fn need_source(&self) -> bool {
        self.need_source
    }

    /// Whether the destination cursor should be advanced next.
    #[must_use]
    pub fn need_dest(&self) -> bool {
        self.need_dest
    }

    /// Last id read from the source.
    #[must_use]
    pub fn last_source_id(&self) -> Option<&str> {
        self.last_source_id.as_deref()
    }

    /// Last id read from the destination.
    #[must_use]
    pub fn last_dest_id(&self) -> Option<&str> {
        self.last_dest_id.as_deref()
    }

    /// Source documents waiting for the destination to catch up.
    #[must_use]
    pub fn pending_source(&self) -> usize {
        self.pending_source.len()
    }

    /// Destination documents waiting for the source to catch up.
    #[must_use]
    pub fn pending_dest(&self) -> usize {
        self.pending_dest.len()
    }

    fn classify_update(&mut self, source: Document, dest: &Document) {
        if source.source != dest.source {
            self.output.updates.push(source);
            self.updated += 1;
        }
    }

    fn add(&mut self, source: Document) {
        self.output.adds.push(source);
        self.added += 1;
    }

    fn drop_dest(&mut self, dest: Document) {
        if self.enable_delete {
            self.output.deletes.push(dest);
            self.deleted += 1;
        } else {
            self.orphaned += 1;
        }
    }

    /// Takes in one destination page. A page shorter than `page_size` exhausts the side.
    pub fn observe_dest(&mut self, page: Vec<Document>, page_size: usize) {
        if page.len() < page_size {
            self.dest_exhausted = true;
        }
        for doc in page {
            let Some(id) = doc.id.clone() else {
                warn!("Skipping destination document without _id");
                continue;
            };
            if let Some(source) = self.pending_source.remove(&id) {
                self.classify_update(source, &doc);
            } else {
                self.pending_dest.insert(id.clone(), doc);
            }
            self.last_dest_id = Some(id);
        }
    }

    /// Takes in one source page. A page shorter than `page_size` exhausts the side.
    pub fn observe_source(&mut self, page: Vec<Document>, page_size: usize) {
        if page.len() < page_size {
            self.source_exhausted = true;
        }
        for doc in page {
            let Some(id) = doc.id.clone() else {
                warn!("Skipping source document without _id");
                continue;
            };
            match self.last_dest_id.as_deref() {
                None => self.add(doc),
                Some(last_dest) => {
                    if let Some(dest) = self.pending_dest.remove(&id) {
                        self.classify_update(doc, &dest);
                    } else if id.as_str() < last_dest {
                        self.add(doc);
                    } else {
                        self.pending_source.insert(id.clone(), doc);
                    }
                }
            }
            self.last_source_id = Some(id);
        }
    }

    /// Settles pending entries the other side can no longer produce.
    pub fn resolve_pending(&mut self) {
        let settled_source = if self.dest_exhausted {
            mem::take(&mut self.pending_source)
        } else {
            split_below(&mut self.pending_source, self.last_dest_id.as_deref())
        };
        for (_, doc) in settled_source {
            self.add(doc);
        }

        let settled_dest = if self.source_exhausted {
            mem::take(&mut self.pending_dest)
        } else {
            split_below(&mut self.pending_dest, self.last_source_id.as_deref())
        };
        for (_, doc) in settled_dest {
            self.drop_dest(doc);
        }
    }

    /// Decides which sides advance next. Returns false once both are exhausted.
    pub fn plan_next(&mut self) -> bool {
        let (need_source, need_dest) = match (self.source_exhausted, self.dest_exhausted) {
            (true, true) => (false, false),
            (true, false) => (false, true),
            (false, true) => (true, false),
            (false, false) => match self.last_source_id.cmp(&self.last_dest_id) {
                std::cmp::Ordering::Less => (true, false),
                std::cmp::Ordering::Greater => (false, true),
                std::cmp::Ordering::Equal => (true, true),
            },
        };
        self.need_source = need_source;
        self.need_dest = need_dest;
        need_source || need_dest
    }

    /// Flushes everything still pending: source entries as adds, destination
    /// entries as deletes (or orphans).
    pub fn finish(&mut self) {
        for (_, doc) in mem::take(&mut self.pending_source) {
            self.add(doc);
        }
        for (_, doc) in mem::take(&mut self.pending_dest) {
            self.drop_dest(doc);
        }
        self.need_source = false;
        self.need_dest = false;
    }

    /// Takes the operations accumulated since the last call.
    pub fn take_output(&mut self) -> DiffOutput {
        mem::take(&mut self.output)
    }
}

/// Removes and returns the entries strictly below `bound`.
fn split_below(
    pending: &mut BTreeMap<String, Document>,
    bound: Option<&str>,
) -> BTreeMap<String, Document> {
    match bound {
        Some(bound) => {
            let kept = pending.split_off(bound);
            mem::replace(pending, kept)
        }
        None => BTreeMap::new(),
    }
}

/// A cursor that never yields anything.
///
/// Stands in for a destination index that does not exist or stopped
/// answering, so every remaining source document becomes an add.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCursor;

#[async_trait]
impl ScrollSource for EmptyCursor {
    async fn open_scroll(&self, _request: &ScrollRequest) -> Result<ScrollPage> {
        Ok(ScrollPage::default())
    }

    async fn next_page(&self, _scroll_id: &str, _keep_alive: &str) -> Result<ScrollPage> {
        Ok(ScrollPage::default())
    }

    async fn clear_scroll(&self, _scroll_id: &str) -> Result<()> {
        Ok(())
    }
}

/// One side of the join: a cursor plus its unread first page.
struct Side {
    cursor: Arc<dyn ScrollSource>,
    keep_alive: String,
    scroll_id: String,
    first_page: Option<Vec<Document>>,
    total_hits: u64,
    seen: u64,
}

impl Side {
    async fn open(cursor: Arc<dyn ScrollSource>, request: &ScrollRequest) -> Result<Self> {
        let page = cursor.open_scroll(request).await?;
        Ok(Self {
            cursor,
            keep_alive: request.keep_alive.clone(),
            scroll_id: page.scroll_id,
            first_page: Some(page.documents),
            total_hits: page.total_hits,
            seen: 0,
        })
    }

    fn empty(request: &ScrollRequest, seen: u64) -> Self {
        Self {
            cursor: Arc::new(EmptyCursor),
            keep_alive: request.keep_alive.clone(),
            scroll_id: String::new(),
            first_page: None,
            total_hits: 0,
            seen,
        }
    }

    async fn fetch(&mut self) -> Result<Vec<Document>> {
        let documents = match self.first_page.take() {
            Some(documents) => documents,
            None => {
                let page = self.cursor.next_page(&self.scroll_id, &self.keep_alive).await?;
                if !page.scroll_id.is_empty() {
                    self.scroll_id = page.scroll_id;
                }
                page.documents
            }
        };
        self.seen += documents.len() as u64;
        Ok(documents)
    }

    async fn release(&self, label: &str) {
        if let Err(e) = self.cursor.clear_scroll(&self.scroll_id).await {
            warn!("Failed to release {} cursor: {}", label, e);
        }
    }
}

/// Totals of a sync run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncStats {
    /// Documents written because the destination lacked them.
    pub added: u64,
    /// Documents rewritten because their payload differed.
    pub updated: u64,
    /// Destination documents deleted.
    pub deleted: u64,
    /// Destination-only documents left in place because deletion is disabled.
    pub orphaned: u64,
    /// Documents read from the source.
    pub source_docs: u64,
    /// Documents read from the destination.
    pub dest_docs: u64,
    /// Bulk requests sent.
    pub bulk_requests: u64,
    /// Bulk requests that failed and were dropped.
    pub failed_batches: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
}

/// Drives [`DiffState`] over a source and a destination index.
pub struct SyncEngine {
    source: Arc<dyn ScrollSource>,
    dest: Arc<dyn ScrollSource>,
    sink: Arc<dyn BulkSink>,
    source_request: ScrollRequest,
    dest_request: ScrollRequest,
    target_index: String,
    enable_delete: bool,
    bulk_size: usize,
    sleep_after_bulk: Option<Duration>,
    progress: Arc<Progress>,
}

impl SyncEngine {
    /// Creates an engine converging `dest_request.indexes` on the documents of `source_request`.
    ///
    /// Both requests are forced unsliced and sorted; an unset sort field
    /// falls back to each side's id field.
    pub fn new(
        source: Arc<dyn ScrollSource>,
        dest: Arc<dyn ScrollSource>,
        sink: Arc<dyn BulkSink>,
        mut source_request: ScrollRequest,
        mut dest_request: ScrollRequest,
    ) -> Self {
        source_request.slice = None;
        dest_request.slice = None;
        if source_request.sort_field.is_none() {
            source_request.sort_field = Some(source.default_sort_field().to_string());
        }
        if dest_request.sort_field.is_none() {
            dest_request.sort_field = Some(dest.default_sort_field().to_string());
        }
        let target_index = dest_request.indexes.clone();
        Self {
            source,
            dest,
            sink,
            source_request,
            dest_request,
            target_index,
            enable_delete: false,
            bulk_size: 5 * 1024 * 1024,
            sleep_after_bulk: None,
            progress: Progress::new(),
        }
    }

    /// Deletes destination-only documents instead of counting them as orphans.
    #[must_use]
    pub fn with_delete(mut self, enable_delete: bool) -> Self {
        self.enable_delete = enable_delete;
        self
    }

    /// Caps each bulk request at `bytes`.
    #[must_use]
    pub fn with_bulk_size(mut self, bytes: usize) -> Self {
        self.bulk_size = bytes.max(1);
        self
    }

    /// Pauses after every round that wrote something.
    #[must_use]
    pub fn with_sleep_after_bulk(mut self, pause: Option<Duration>) -> Self {
        self.sleep_after_bulk = pause;
        self
    }

    /// Reports into shared counters instead of private ones.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Counters updated by this engine.
    #[must_use]
    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Runs the diff to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cursor fails. Destination cursor
    /// failures fall back to an empty cursor; bulk failures are counted.
    pub async fn run(&self) -> Result<SyncStats> {
        let start = Instant::now();
        info!(
            "Syncing {} into {} (delete {})",
            self.source_request.indexes,
            self.target_index,
            if self.enable_delete { "on" } else { "off" }
        );

        let mut source = Side::open(self.source.clone(), &self.source_request).await?;
        info!("Source total: {}", source.total_hits);
        self.progress.add_scroll_total(source.total_hits);

        let mut dest = match Side::open(self.dest.clone(), &self.dest_request).await {
            Ok(side) => {
                info!("Destination total: {}", side.total_hits);
                side
            }
            Err(e) => {
                warn!(
                    "Cannot scroll destination {}, every source document will be added: {}",
                    self.target_index, e
                );
                Side::empty(&self.dest_request, 0)
            }
        };

        let mut state = DiffState::new(self.enable_delete);
        let mut stats = SyncStats::default();
        let outcome = self
            .drive(&mut source, &mut dest, &mut state, &mut stats)
            .await;

        source.release("source").await;
        dest.release("destination").await;
        outcome?;

        stats.added = state.added;
        stats.updated = state.updated;
        stats.deleted = state.deleted;
        stats.orphaned = state.orphaned;
        stats.source_docs = source.seen;
        stats.dest_docs = dest.seen;
        stats.duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Sync {}({}) to {}({}) complete: add={}, update={}, delete={}, orphaned={} in {:.2}s",
            self.source_request.indexes,
            stats.source_docs,
            self.target_index,
            stats.dest_docs,
            stats.added,
            stats.updated,
            stats.deleted,
            stats.orphaned,
            stats.duration_secs
        );
        Ok(stats)
    }

    async fn drive(
        &self,
        source: &mut Side,
        dest: &mut Side,
        state: &mut DiffState,
        stats: &mut SyncStats,
    ) -> Result<()> {
        loop {
            if state.need_dest() {
                let page = match dest.fetch().await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!("Destination cursor failed, treating the rest as empty: {}", e);
                        dest.release("destination").await;
                        *dest = Side::empty(&self.dest_request, dest.seen);
                        Vec::new()
                    }
                };
                state.observe_dest(page, self.dest_request.page_size);
            }

            if state.need_source() {
                let page = source.fetch().await?;
                self.progress.add_scrolled(page.len() as u64);
                state.observe_source(page, self.source_request.page_size);
            }

            state.resolve_pending();
            let output = state.take_output();
            let wrote = !output.is_empty();
            self.write(output, stats).await?;

            debug!(
                "last source id {:?}, last destination id {:?}, pending {}/{}",
                state.last_source_id(),
                state.last_dest_id(),
                state.pending_source(),
                state.pending_dest()
            );

            if !state.plan_next() {
                break;
            }
            if wrote {
                if let Some(pause) = self.sleep_after_bulk {
                    tokio::time::sleep(pause).await;
                }
            }
        }

        state.finish();
        let output = state.take_output();
        self.write(output, stats).await
    }

    fn upsert(&self, doc: Document) -> BulkAction {
        let doc_type = self
            .sink
            .requires_type()
            .then(|| doc.doc_type.clone().unwrap_or_else(|| DEFAULT_TYPE.to_string()));
        BulkAction::Index(Document {
            index: Some(self.target_index.clone()),
            doc_type,
            routing: doc.routing.clone().filter(|r| !r.is_empty()),
            ..doc
        })
    }

    fn delete(&self, doc: Document) -> BulkAction {
        let doc_type = self
            .sink
            .requires_type()
            .then(|| doc.doc_type.unwrap_or_else(|| DEFAULT_TYPE.to_string()));
        BulkAction::delete(self.target_index.clone(), doc_type, doc.id.unwrap_or_default())
    }

    async fn write(&self, output: DiffOutput, stats: &mut SyncStats) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }
        debug!(
            "Writing {} adds, {} updates, {} deletes",
            output.adds.len(),
            output.updates.len(),
            output.deletes.len()
        );

        let actions = output
            .adds
            .into_iter()
            .chain(output.updates)
            .map(|doc| self.upsert(doc))
            .chain(output.deletes.into_iter().map(|doc| self.delete(doc)));

        let mut buffer = BatchBuffer::new(self.bulk_size);
        for action in actions {
            let encoded = encode(&action)?;
            if buffer.would_overflow(encoded.len()) {
                self.flush(&mut buffer, stats).await;
            }
            buffer.push_encoded(&encoded);
        }
        self.flush(&mut buffer, stats).await;
        Ok(())
    }

    async fn flush(&self, buffer: &mut BatchBuffer, stats: &mut SyncStats) {
        let body = buffer.take();
        if body.is_empty() {
            return;
        }
        stats.bulk_requests += 1;
        self.progress.inc_bulk_requests();
        match self.sink.bulk(&body).await {
            Ok(summary) => {
                self.progress.add_failed_items(summary.failed_items as u64);
                self.progress
                    .add_written(summary.operations.saturating_sub(summary.failed_items) as u64);
            }
            Err(e) => {
                error!("Sync bulk of {} operations failed: {}", body.operations, e);
                stats.failed_batches += 1;
                self.progress.inc_failed_batches();
            }
        }
    }
}
