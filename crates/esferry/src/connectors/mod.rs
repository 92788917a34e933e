//! Cursor and write abstractions, plus their cluster, file and in-memory implementations.

pub mod common;
pub mod dump_file;
pub mod elasticsearch;
pub mod memory;
pub mod version;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::Result;
use crate::pipeline::batch::BulkBody;

/// One partition of a sliced scroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    /// Slice number, in `0..max`.
    pub id: usize,
    /// Total number of slices.
    pub max: usize,
}

/// Parameters for opening a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollRequest {
    /// Index name, comma separated list or pattern.
    pub indexes: String,
    /// Documents per page.
    pub page_size: usize,
    /// Keep-alive of the server-side cursor, e.g. `1m`.
    pub keep_alive: String,
    /// Query-string filter.
    pub query: Option<String>,
    /// Field to sort on, ascending.
    pub sort_field: Option<String>,
    /// Partition to read; `None` reads everything.
    pub slice: Option<SliceSpec>,
    /// Source fields to fetch (empty = all).
    pub fields: Vec<String>,
}

impl ScrollRequest {
    /// A request for every document of `indexes` with default paging.
    pub fn new(indexes: impl Into<String>, page_size: usize) -> Self {
        Self {
            indexes: indexes.into(),
            page_size,
            keep_alive: "1m".to_string(),
            query: None,
            sort_field: None,
            slice: None,
            fields: Vec::new(),
        }
    }

    /// Restricts the request to one slice; a single slice means no slicing.
    #[must_use]
    pub fn with_slice(mut self, id: usize, max: usize) -> Self {
        self.slice = (max > 1).then_some(SliceSpec { id, max });
        self
    }

    /// Sorts ascending on `field`.
    #[must_use]
    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }
}

/// One page of a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    /// Token for the next page.
    pub scroll_id: String,
    /// Total matching documents, as estimated by the server.
    pub total_hits: u64,
    /// Documents of this page; empty once the cursor is exhausted.
    pub documents: Vec<Document>,
}

/// Outcome of one bulk request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    /// Operations sent.
    pub operations: usize,
    /// The server flagged at least one item as failed.
    pub errors: bool,
    /// Number of items carrying an error.
    pub failed_items: usize,
}

/// A paginated, server-side cursor over a document set.
#[async_trait]
pub trait ScrollSource: Send + Sync {
    /// Opens a cursor and returns its first page.
    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage>;

    /// Fetches the page following `scroll_id`.
    async fn next_page(&self, scroll_id: &str, keep_alive: &str) -> Result<ScrollPage>;

    /// Releases the cursor. Releasing an unknown or empty id is not an error.
    async fn clear_scroll(&self, scroll_id: &str) -> Result<()>;

    /// Sort field that yields ascending id order.
    fn default_sort_field(&self) -> &'static str {
        "_id"
    }
}

/// A destination accepting encoded bulk operations.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Applies a batch of operations.
    async fn bulk(&self, body: &BulkBody) -> Result<BulkSummary>;

    /// Whether documents written here must carry a type.
    fn requires_type(&self) -> bool;
}
