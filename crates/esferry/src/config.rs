//! Configuration types for esferry.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main run configuration.
///
/// Loaded from YAML and then overridden from the command line. Read-only once
/// a run starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source cluster.
    #[serde(default)]
    pub source: Option<EndpointConfig>,
    /// Destination cluster.
    #[serde(default)]
    pub target: Option<EndpointConfig>,
    /// Read documents from a local file instead of a source cluster.
    #[serde(default)]
    pub input_file: Option<InputFileConfig>,
    /// Write documents to a local file instead of a destination cluster.
    #[serde(default)]
    pub output_file: Option<OutputFileConfig>,
    /// Cursor options.
    #[serde(default)]
    pub scroll: ScrollOptions,
    /// Bulk worker options.
    #[serde(default)]
    pub bulk: BulkOptions,
    /// Per-document rewrite rules.
    #[serde(default)]
    pub transform: TransformOptions,
    /// Settings/mappings copy before the data moves.
    #[serde(default)]
    pub index_setup: IndexSetupOptions,
    /// Incremental sync instead of a plain copy.
    #[serde(default)]
    pub sync: SyncOptions,
    /// Wait for both clusters to be green (otherwise any reachable status is fine).
    #[serde(default)]
    pub wait_for_green: bool,
}

/// A cluster endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,
    /// Index name, comma separated list or pattern. Source defaults to `_all`;
    /// an unset target keeps each document's source index name.
    #[serde(default)]
    pub index: Option<String>,
    /// Basic auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// HTTP proxy for this endpoint.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Sort field used when this endpoint is scrolled during sync.
    #[serde(default)]
    pub sort_field: Option<String>,
}

impl EndpointConfig {
    /// Creates an endpoint with just a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Index expression to read from, `_all` when unset.
    #[must_use]
    pub fn source_indexes(&self) -> &str {
        self.index.as_deref().unwrap_or("_all")
    }

    /// Fixed index to write to, if any.
    #[must_use]
    pub fn target_index(&self) -> Option<&str> {
        self.index.as_deref().filter(|i| !i.is_empty())
    }
}

/// Input file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// One search hit (`_index`, `_id`, `_source`, ...) per line, as written by the dump output.
    #[default]
    Dump,
    /// One plain JSON object per line, used as the document body.
    JsonLine,
}

/// Input file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFileConfig {
    /// Path to the file.
    pub path: PathBuf,
    /// Line format.
    #[serde(default)]
    pub format: InputFormat,
}

/// Output file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileConfig {
    /// Path to the file.
    pub path: PathBuf,
    /// Truncate the file before writing; append otherwise.
    #[serde(default)]
    pub truncate: bool,
}

/// Cursor options for the source side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollOptions {
    /// Query-string filter applied on the source.
    #[serde(default)]
    pub query: Option<String>,
    /// Extra query-string clause for incremental runs, e.g. `modifiedDate:>=1727712000000`.
    #[serde(default)]
    pub stamp: Option<String>,
    /// Source fields to fetch (empty = all).
    #[serde(default)]
    pub fields: Vec<String>,
    /// Documents per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Scroll keep-alive, e.g. `1m`.
    #[serde(default = "default_scroll_time")]
    pub scroll_time: String,
    /// Number of parallel slices.
    #[serde(default = "default_slices")]
    pub slices: usize,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            query: None,
            stamp: None,
            fields: Vec::new(),
            page_size: default_page_size(),
            scroll_time: default_scroll_time(),
            slices: default_slices(),
        }
    }
}

impl ScrollOptions {
    /// The query-string filter with the stamp clause ANDed in.
    #[must_use]
    pub fn effective_query(&self) -> Option<String> {
        let query = self.query.as_deref().filter(|q| !q.trim().is_empty());
        let stamp = self.stamp.as_deref().filter(|s| !s.trim().is_empty());
        match (query, stamp) {
            (Some(q), Some(s)) => Some(format!("({q}) AND ({s})")),
            (Some(q), None) => Some(q.to_string()),
            (None, Some(s)) => Some(s.to_string()),
            (None, None) => None,
        }
    }
}

/// Bulk worker options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOptions {
    /// Number of concurrent bulk workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum bulk request size in MB.
    #[serde(default = "default_bulk_size_mb")]
    pub bulk_size_mb: usize,
    /// Documents buffered between scroll producers and bulk workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Flush a partial batch after this many seconds without input.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Stop a worker after this many seconds without input (0 = never).
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Pause after each bulk request (0 = no pause).
    #[serde(default)]
    pub sleep_after_bulk_secs: u64,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            bulk_size_mb: default_bulk_size_mb(),
            queue_capacity: default_queue_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            sleep_after_bulk_secs: 0,
        }
    }
}

impl BulkOptions {
    /// Maximum bulk body size in bytes.
    #[must_use]
    pub fn bulk_size_bytes(&self) -> usize {
        self.bulk_size_mb * 1024 * 1024
    }

    /// Idle flush interval.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Worker self-termination interval, `None` when disabled.
    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// Throttle applied after every flush, `None` when disabled.
    #[must_use]
    pub fn sleep_after_bulk(&self) -> Option<Duration> {
        (self.sleep_after_bulk_secs > 0).then(|| Duration::from_secs(self.sleep_after_bulk_secs))
    }
}

/// Renames one payload field. A `from` of `_type` copies the document type into the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRename {
    /// Existing field name.
    pub from: String,
    /// New field name.
    pub to: String,
}

impl FieldRename {
    /// Parses `old:new,old2:new2`.
    ///
    /// # Errors
    ///
    /// Returns an error if a pair has no `:` or an empty side.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>> {
        spec.split(',')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| {
                let (from, to) = pair.split_once(':').ok_or_else(|| {
                    Error::Config(format!("rename '{}' must look like old:new", pair.trim()))
                })?;
                let (from, to) = (from.trim(), to.trim());
                if from.is_empty() || to.is_empty() {
                    return Err(Error::Config(format!(
                        "rename '{}' has an empty field name",
                        pair.trim()
                    )));
                }
                Ok(Self {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            })
            .collect()
    }
}

/// Per-document rewrite rules applied by the bulk workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformOptions {
    /// Force every document to this type (ignored on typeless destinations).
    #[serde(default)]
    pub type_override: Option<String>,
    /// Drop source ids so the destination generates new ones.
    #[serde(default)]
    pub regenerate_id: bool,
    /// Payload field renames, applied in order.
    #[serde(default)]
    pub rename_fields: Vec<FieldRename>,
    /// Payload fields to drop.
    #[serde(default)]
    pub skip_fields: Vec<String>,
    /// Number of times the whole source is replayed into the destination.
    #[serde(default = "default_repeat_times")]
    pub repeat_times: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            type_override: None,
            regenerate_id: false,
            rename_fields: Vec::new(),
            skip_fields: Vec::new(),
            repeat_times: default_repeat_times(),
        }
    }
}

/// Index settings and mappings handling before the copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSetupOptions {
    /// Copy index settings from the source.
    #[serde(default)]
    pub copy_settings: bool,
    /// Copy index mappings from the source.
    #[serde(default)]
    pub copy_mappings: bool,
    /// Delete destination indexes before copying.
    #[serde(default)]
    pub recreate: bool,
    /// Number of shards for created indexes.
    #[serde(default)]
    pub shards: Option<u32>,
    /// Include indexes whose names start with `.` or `_`.
    #[serde(default)]
    pub copy_all_indexes: bool,
    /// Refresh destination indexes once the copy finishes.
    #[serde(default)]
    pub refresh: bool,
}

impl IndexSetupOptions {
    /// Whether any settings work is needed before the copy.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.copy_settings || self.shards.is_some_and(|s| s > 0)
    }
}

/// Incremental sync options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Run the diff engine instead of a plain copy.
    #[serde(default)]
    pub enabled: bool,
    /// Delete destination documents that are missing from the source.
    #[serde(default)]
    pub enable_delete: bool,
}

fn default_page_size() -> usize {
    10_000
}

fn default_scroll_time() -> String {
    "1m".to_string()
}

fn default_slices() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

fn default_bulk_size_mb() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1_000_000
}

fn default_idle_timeout_secs() -> u64 {
    5
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_repeat_times() -> usize {
    1
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.source.is_none() && self.input_file.is_none() {
            return Err(Error::Config(
                "no input: set a source cluster or an input file".to_string(),
            ));
        }
        if self.target.is_none() && self.output_file.is_none() {
            return Err(Error::Config(
                "no output: set a target cluster or an output file".to_string(),
            ));
        }
        if let (Some(source), Some(target)) = (&self.source, &self.target) {
            if source.url.trim_end_matches('/') == target.url.trim_end_matches('/')
                && Some(source.source_indexes()) == target.index.as_deref()
            {
                return Err(Error::Config(
                    "source and target are the same index on the same cluster".to_string(),
                ));
            }
        }
        if self.scroll.page_size == 0 {
            return Err(Error::Config("page_size must be greater than 0".to_string()));
        }
        if self.scroll.slices == 0 {
            return Err(Error::Config("slices must be at least 1".to_string()));
        }
        if self.bulk.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.bulk.bulk_size_mb == 0 {
            return Err(Error::Config("bulk_size_mb must be greater than 0".to_string()));
        }
        if self.bulk.queue_capacity == 0 {
            return Err(Error::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.transform.repeat_times == 0 {
            return Err(Error::Config("repeat_times must be at least 1".to_string()));
        }
        if self.sync.enabled {
            self.validate_sync()?;
        }
        Ok(())
    }

    fn validate_sync(&self) -> Result<()> {
        let (Some(source), Some(target)) = (&self.source, &self.target) else {
            return Err(Error::Config(
                "sync needs both a source and a target cluster".to_string(),
            ));
        };
        let single = |index: Option<&str>| {
            index.is_some_and(|i| !i.is_empty() && !i.contains([',', '*', '?']) && i != "_all")
        };
        if !single(source.index.as_deref()) || !single(target.index.as_deref()) {
            return Err(Error::Config(
                "sync only supports one source index to one target index".to_string(),
            ));
        }
        Ok(())
    }
}
