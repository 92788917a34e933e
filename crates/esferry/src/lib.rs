// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # esferry
//!
//! `esferry` is a CLI tool and library for moving documents between
//! Elasticsearch/OpenSearch clusters, dumping them to files, and keeping a
//! destination index in sync with a source index.
//!
//! ## Supported Endpoints
//!
//! | Endpoint | Read | Write | Notes |
//! |----------|------|-------|-------|
//! | Elasticsearch 0.x - 4.x | ✅ | ✅ | scan/scroll, typed |
//! | Elasticsearch 5.x - 7.x | ✅ | ✅ | sliced scroll |
//! | Elasticsearch 8.x | ✅ | ✅ | typeless |
//! | OpenSearch 1.x / 2.x | ✅ | ✅ | |
//! | Dump / JSON lines file | ✅ | ✅ | single slice |
//!
//! ## Quick Start
//!
//! ```bash
//! # Copy an index with 4 slices and 8 bulk workers
//! esferry run -s http://localhost:9200 -x logs -d http://localhost:9201 -y logs \
//!     --sliced_scroll_size 4 -w 8
//!
//! # Make the destination converge on the source, deleting extra documents
//! esferry sync -s http://localhost:9200 -x logs -d http://localhost:9201 -y logs --enable_delete
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   url: http://localhost:9200
//!   index: logs
//!
//! target:
//!   url: http://localhost:9201
//!   index: logs-copy
//!
//! scroll:
//!   page_size: 5000
//!   slices: 4
//!
//! bulk:
//!   workers: 8
//!   bulk_size_mb: 10
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connectors;
pub mod document;
pub mod error;
pub mod index_setup;
pub mod migrator;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod sync;
pub mod transform;

pub use config::{EndpointConfig, MigrationConfig};
pub use connectors::{BulkSink, ScrollPage, ScrollRequest, ScrollSource};
pub use document::{Document, Payload};
pub use error::{Error, Result};
pub use migrator::{Migrator, RunReport};
pub use pipeline::{MigrationStats, Pipeline};
pub use sync::{DiffState, SyncEngine, SyncStats};
pub use transform::Transformer;
