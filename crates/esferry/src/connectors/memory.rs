//! In-memory cluster.
//!
//! Behaves like a single-node cluster for scrolls and bulk requests, so the
//! pipeline and the sync engine can be exercised without a server.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::connectors::{BulkSink, BulkSummary, ScrollPage, ScrollRequest, ScrollSource};
use crate::document::{Document, Payload};
use crate::error::{Error, Result};
use crate::pipeline::batch::BulkBody;

const HOST: &str = "memory://";

struct Cursor {
    documents: Vec<Document>,
    position: usize,
    page_size: usize,
}

impl Cursor {
    fn next_chunk(&mut self) -> Vec<Document> {
        let end = (self.position + self.page_size).min(self.documents.len());
        let chunk = self.documents[self.position..end].to_vec();
        self.position = end;
        chunk
    }
}

#[derive(Default)]
struct State {
    indexes: BTreeMap<String, BTreeMap<String, Document>>,
    cursors: HashMap<String, Cursor>,
    cursor_seq: u64,
    bulk_calls: usize,
    failing_bulks: usize,
}

/// A cluster held in memory.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    requires_type: bool,
}

impl MemoryCluster {
    /// Creates an empty typeless cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cluster that, like pre-8 servers, rejects untyped writes.
    #[must_use]
    pub fn typed() -> Self {
        Self {
            requires_type: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an empty index if it does not exist.
    pub fn create_index(&self, name: &str) {
        self.state().indexes.entry(name.to_string()).or_default();
    }

    /// Stores a document, creating its index as needed.
    pub fn insert(&self, index: &str, id: &str, source: Payload) {
        self.insert_document(Document::new(index, id, source));
    }

    /// Stores a complete document. Documents without index or id are ignored.
    pub fn insert_document(&self, doc: Document) {
        let (Some(index), Some(id)) = (doc.index.clone(), doc.id.clone()) else {
            return;
        };
        self.state().indexes.entry(index).or_default().insert(id, doc);
    }

    /// Documents of an index in ascending id order.
    #[must_use]
    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.state()
            .indexes
            .get(index)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Payloads of an index keyed by id.
    #[must_use]
    pub fn payloads(&self, index: &str) -> BTreeMap<String, Payload> {
        self.state()
            .indexes
            .get(index)
            .map(|docs| {
                docs.iter()
                    .filter_map(|(id, doc)| doc.source.clone().map(|s| (id.clone(), s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of documents in an index.
    #[must_use]
    pub fn count(&self, index: &str) -> usize {
        self.state().indexes.get(index).map_or(0, BTreeMap::len)
    }

    /// Whether an index exists.
    #[must_use]
    pub fn has_index(&self, index: &str) -> bool {
        self.state().indexes.contains_key(index)
    }

    /// Number of bulk requests received, failed ones included.
    #[must_use]
    pub fn bulk_calls(&self) -> usize {
        self.state().bulk_calls
    }

    /// Number of cursors not yet released.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.state().cursors.len()
    }

    /// Makes the next `n` bulk requests fail with a 503.
    pub fn fail_next_bulks(&self, n: usize) {
        self.state().failing_bulks = n;
    }

    fn resolve(state: &State, expression: &str) -> Vec<String> {
        let mut names: Vec<String> = expression
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .flat_map(|pattern| {
                state
                    .indexes
                    .keys()
                    .filter(move |name| matches_pattern(pattern, name))
                    .cloned()
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern {
        "_all" | "*" => true,
        p => match p.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == p,
        },
    }
}

fn slice_of(id: &str, max: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % max as u64) as usize
}

fn project(doc: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut projected = doc.clone();
    projected.source = doc.source.as_ref().map(|source| {
        source
            .iter()
            .filter(|(k, _)| fields.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    });
    projected
}

#[async_trait]
impl ScrollSource for MemoryCluster {
    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage> {
        let mut state = self.state();
        let names = Self::resolve(&state, &request.indexes);
        if names.is_empty() {
            return Err(Error::cluster(
                HOST,
                format!("open scroll on {}", request.indexes),
                404,
                "index_not_found_exception",
            ));
        }

        let mut documents: Vec<Document> = names
            .iter()
            .filter_map(|name| state.indexes.get(name))
            .flat_map(BTreeMap::values)
            .filter(|doc| {
                request
                    .slice
                    .map_or(true, |s| slice_of(doc.id_str(), s.max) == s.id)
            })
            .map(|doc| project(doc, &request.fields))
            .collect();
        if request.sort_field.is_some() {
            documents.sort_by(|a, b| a.id_str().cmp(b.id_str()));
        }

        let total_hits = documents.len() as u64;
        let mut cursor = Cursor {
            documents,
            position: 0,
            page_size: request.page_size.max(1),
        };
        let first = cursor.next_chunk();

        state.cursor_seq += 1;
        let scroll_id = format!("mem-{}", state.cursor_seq);
        state.cursors.insert(scroll_id.clone(), cursor);

        Ok(ScrollPage {
            scroll_id,
            total_hits,
            documents: first,
        })
    }

    async fn next_page(&self, scroll_id: &str, _keep_alive: &str) -> Result<ScrollPage> {
        let mut state = self.state();
        let cursor = state.cursors.get_mut(scroll_id).ok_or_else(|| {
            Error::cluster(HOST, "next scroll page", 404, "search_context_missing_exception")
        })?;
        let total_hits = cursor.documents.len() as u64;
        Ok(ScrollPage {
            scroll_id: scroll_id.to_string(),
            total_hits,
            documents: cursor.next_chunk(),
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        self.state().cursors.remove(scroll_id);
        Ok(())
    }
}

#[async_trait]
impl BulkSink for MemoryCluster {
    async fn bulk(&self, body: &BulkBody) -> Result<BulkSummary> {
        if body.is_empty() {
            return Ok(BulkSummary::default());
        }

        let mut state = self.state();
        state.bulk_calls += 1;
        if state.failing_bulks > 0 {
            state.failing_bulks -= 1;
            return Err(Error::cluster(HOST, "bulk", 503, "injected failure"));
        }

        let mut failed_items = 0;
        let mut lines = body.payload.lines().filter(|l| !l.trim().is_empty());
        while let Some(line) = lines.next() {
            let action: Value = serde_json::from_str(line)?;
            let (kind, meta) = action
                .as_object()
                .and_then(|obj| obj.iter().next())
                .ok_or_else(|| Error::Decode(format!("bad bulk action line: {}", line)))?;
            let field = |name: &str| meta.get(name).and_then(Value::as_str).map(str::to_string);
            let index = field("_index")
                .ok_or_else(|| Error::Decode(format!("bulk action without _index: {}", line)))?;
            let doc_type = field("_type");

            match kind.as_str() {
                "index" => {
                    let source_line = lines
                        .next()
                        .ok_or_else(|| Error::Decode("index action without a body".to_string()))?;
                    let source: Payload = serde_json::from_str(source_line)?;
                    if self.requires_type && doc_type.is_none() {
                        failed_items += 1;
                        continue;
                    }
                    let id = field("_id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let doc = Document {
                        index: Some(index.clone()),
                        doc_type,
                        id: Some(id.clone()),
                        source: Some(source),
                        routing: field("routing"),
                    };
                    state.indexes.entry(index).or_default().insert(id, doc);
                }
                "delete" => {
                    let id = field("_id")
                        .ok_or_else(|| Error::Decode(format!("delete without _id: {}", line)))?;
                    if let Some(docs) = state.indexes.get_mut(&index) {
                        docs.remove(&id);
                    }
                }
                other => {
                    return Err(Error::Decode(format!("unsupported bulk action '{}'", other)));
                }
            }
        }

        Ok(BulkSummary {
            operations: body.operations,
            errors: failed_items > 0,
            failed_items,
        })
    }

    fn requires_type(&self) -> bool {
        self.requires_type
    }
}
