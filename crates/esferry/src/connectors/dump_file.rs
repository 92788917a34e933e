//! Line-delimited JSON file used as a document source.
//!
//! The file is read sequentially; the continuation token is the number of
//! lines consumed so far. Only a single slice is served.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::InputFormat;
use crate::connectors::{ScrollPage, ScrollRequest, ScrollSource};
use crate::document::Document;
use crate::error::{Error, Result};

struct Reader {
    lines: Lines<BufReader<File>>,
    consumed: u64,
    page_size: usize,
    total: u64,
}

/// Reads documents from a dump or JSON lines file.
pub struct DumpFileSource {
    path: PathBuf,
    format: InputFormat,
    default_index: String,
    reader: Mutex<Option<Reader>>,
}

impl DumpFileSource {
    /// Creates a source for `path`.
    ///
    /// `default_index` addresses plain JSON lines; when `None`, the file stem is used.
    pub fn new(path: impl Into<PathBuf>, format: InputFormat, default_index: Option<String>) -> Self {
        let path = path.into();
        let default_index = default_index.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "imported".to_string())
        });
        Self {
            path,
            format,
            default_index,
            reader: Mutex::new(None),
        }
    }

    /// Path of the file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn count_lines(&self) -> Result<u64> {
        let mut lines = BufReader::new(File::open(&self.path).await?).lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn parse_line(&self, line: &str) -> Result<Document> {
        match self.format {
            InputFormat::Dump => Ok(serde_json::from_str(line)?),
            InputFormat::JsonLine => match serde_json::from_str(line)? {
                Value::Object(source) => Ok(Document::new(
                    self.default_index.clone(),
                    uuid::Uuid::new_v4().to_string(),
                    source,
                )),
                _ => Err(Error::Decode("line is not a JSON object".to_string())),
            },
        }
    }

    async fn read_page(&self, reader: &mut Reader) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(reader.page_size.min(1024));
        while documents.len() < reader.page_size {
            let Some(line) = reader.lines.next_line().await? else {
                break;
            };
            reader.consumed += 1;
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(&line) {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!(
                    "{}:{}: skipping unreadable line: {}",
                    self.path.display(),
                    reader.consumed,
                    e
                ),
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl ScrollSource for DumpFileSource {
    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage> {
        if request.slice.is_some_and(|s| s.id > 0) {
            return Ok(ScrollPage::default());
        }

        let total_hits = self.count_lines().await?;
        let mut reader = Reader {
            lines: BufReader::new(File::open(&self.path).await?).lines(),
            consumed: 0,
            page_size: request.page_size.max(1),
            total: total_hits,
        };
        let documents = self.read_page(&mut reader).await?;
        debug!(
            "Opened {} ({} lines, first page {})",
            self.path.display(),
            total_hits,
            documents.len()
        );

        let scroll_id = reader.consumed.to_string();
        *self.reader.lock().await = Some(reader);
        Ok(ScrollPage {
            scroll_id,
            total_hits,
            documents,
        })
    }

    async fn next_page(&self, scroll_id: &str, _keep_alive: &str) -> Result<ScrollPage> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::Decode(format!("{} is not open", self.path.display())))?;
        if reader.consumed.to_string() != scroll_id {
            return Err(Error::Decode(format!(
                "stale position {} for {} (at line {})",
                scroll_id,
                self.path.display(),
                reader.consumed
            )));
        }

        let documents = self.read_page(reader).await?;
        Ok(ScrollPage {
            scroll_id: reader.consumed.to_string(),
            total_hits: reader.total,
            documents,
        })
    }

    async fn clear_scroll(&self, _scroll_id: &str) -> Result<()> {
        self.reader.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
#[path = "dump_file_tests.rs"]
mod tests;
