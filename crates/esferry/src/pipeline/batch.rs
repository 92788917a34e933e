//! Bulk request encoding.
//!
//! Each operation is an action line followed, for index operations, by the
//! payload line. A [`BatchBuffer`] accumulates encoded operations up to a byte
//! bound and is owned by exactly one writer.

use serde::Serialize;

use crate::document::{Document, Payload};
use crate::error::{Error, Result};

/// A single write operation against the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Create or overwrite a document.
    Index(Document),
    /// Remove a document by id.
    Delete {
        /// Index holding the document.
        index: String,
        /// Mapping type, for clusters that still use one.
        doc_type: Option<String>,
        /// Document id.
        id: String,
    },
}

impl BulkAction {
    /// Builds a delete for an existing document.
    pub fn delete(index: impl Into<String>, doc_type: Option<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            index: index.into(),
            doc_type,
            id: id.into(),
        }
    }
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum ActionLine<'a> {
    Index(ActionMeta<'a>),
    Delete(ActionMeta<'a>),
}

/// Encodes one operation as newline-terminated NDJSON.
///
/// # Errors
///
/// Returns [`Error::MalformedDocument`] when an index operation has no index or body.
pub fn encode(action: &BulkAction) -> Result<String> {
    match action {
        BulkAction::Index(doc) => {
            let index = doc
                .index
                .as_deref()
                .filter(|i| !i.is_empty())
                .ok_or(Error::MalformedDocument("_index"))?;
            let source: &Payload = doc.source.as_ref().ok_or(Error::MalformedDocument("_source"))?;
            let meta = ActionMeta {
                index,
                doc_type: doc.doc_type.as_deref().filter(|t| !t.is_empty()),
                id: doc.id.as_deref(),
                routing: doc.routing.as_deref().filter(|r| !r.is_empty()),
            };
            let mut line = serde_json::to_string(&ActionLine::Index(meta))?;
            line.push('\n');
            line.push_str(&serde_json::to_string(source)?);
            line.push('\n');
            Ok(line)
        }
        BulkAction::Delete {
            index,
            doc_type,
            id,
        } => {
            let meta = ActionMeta {
                index,
                doc_type: doc_type.as_deref().filter(|t| !t.is_empty()),
                id: Some(id),
                routing: None,
            };
            let mut line = serde_json::to_string(&ActionLine::Delete(meta))?;
            line.push('\n');
            Ok(line)
        }
    }
}

/// An encoded bulk request body ready to be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkBody {
    /// NDJSON payload.
    pub payload: String,
    /// Number of operations encoded in `payload`.
    pub operations: usize,
}

impl BulkBody {
    /// Whether the body holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }
}

/// Byte-bounded accumulator of encoded operations.
#[derive(Debug)]
pub struct BatchBuffer {
    buf: String,
    operations: usize,
    max_bytes: usize,
}

impl BatchBuffer {
    /// Creates an empty buffer bounded by `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            operations: 0,
            max_bytes,
        }
    }

    /// Whether appending `encoded_len` more bytes would cross the bound.
    ///
    /// An empty buffer never overflows, so an oversized single operation
    /// still goes out on its own.
    #[must_use]
    pub fn would_overflow(&self, encoded_len: usize) -> bool {
        !self.is_empty() && self.buf.len() + encoded_len > self.max_bytes
    }

    /// Appends an already encoded operation.
    pub fn push_encoded(&mut self, encoded: &str) {
        self.buf.push_str(encoded);
        self.operations += 1;
    }

    /// Encodes and appends an operation.
    ///
    /// # Errors
    ///
    /// Propagates encoding failures.
    pub fn push(&mut self, action: &BulkAction) -> Result<()> {
        let encoded = encode(action)?;
        self.push_encoded(&encoded);
        Ok(())
    }

    /// Takes the accumulated body, leaving the buffer empty.
    pub fn take(&mut self) -> BulkBody {
        let operations = std::mem::take(&mut self.operations);
        BulkBody {
            payload: std::mem::take(&mut self.buf),
            operations,
        }
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }

    /// Buffered size in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered operations.
    #[must_use]
    pub fn operations(&self) -> usize {
        self.operations
    }

    /// The configured byte bound.
    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::payload;
    use serde_json::{json, Value};

    fn lines(encoded: &str) -> Vec<Value> {
        encoded
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_encode_index_with_type_and_routing() {
        let doc = Document::new("logs", "7", payload(json!({"msg": "hi"})))
            .with_type("event")
            .with_routing("r1");

        let encoded = encode(&BulkAction::Index(doc)).unwrap();
        assert!(encoded.ends_with('\n'));

        let parsed = lines(&encoded);
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0],
            json!({"index": {"_index": "logs", "_type": "event", "_id": "7", "routing": "r1"}})
        );
        assert_eq!(parsed[1], json!({"msg": "hi"}));
    }

    #[test]
    fn test_encode_index_without_id_lets_server_assign() {
        let mut doc = Document::new("logs", "7", payload(json!({})));
        doc.id = None;

        let parsed = lines(&encode(&BulkAction::Index(doc)).unwrap());
        assert_eq!(parsed[0], json!({"index": {"_index": "logs"}}));
    }

    #[test]
    fn test_encode_delete_is_single_line() {
        let encoded = encode(&BulkAction::delete("logs", None, "4")).unwrap();
        assert_eq!(encoded, "{\"delete\":{\"_index\":\"logs\",\"_id\":\"4\"}}\n");
    }

    #[test]
    fn test_encode_rejects_missing_index() {
        let mut doc = Document::new("logs", "1", payload(json!({})));
        doc.index = None;
        assert!(matches!(
            encode(&BulkAction::Index(doc)),
            Err(Error::MalformedDocument("_index"))
        ));
    }

    #[test]
    fn test_buffer_overflow_check() {
        let mut buffer = BatchBuffer::new(100);
        assert!(!buffer.would_overflow(1_000));

        buffer.push_encoded(&"x".repeat(60));
        assert!(!buffer.would_overflow(40));
        assert!(buffer.would_overflow(41));
    }

    #[test]
    fn test_bodies_stay_within_bound() {
        let mut buffer = BatchBuffer::new(256);
        let mut bodies = Vec::new();
        for i in 0..50 {
            let doc = Document::new("logs", i.to_string(), payload(json!({"n": i, "pad": "abcdefgh"})));
            let encoded = encode(&BulkAction::Index(doc)).unwrap();
            if buffer.would_overflow(encoded.len()) {
                bodies.push(buffer.take());
            }
            buffer.push_encoded(&encoded);
        }
        bodies.push(buffer.take());

        assert!(bodies.len() > 1);
        assert!(bodies.iter().all(|b| b.len() <= buffer.max_bytes()));
        assert_eq!(bodies.iter().map(|b| b.operations).sum::<usize>(), 50);
    }

    #[test]
    fn test_buffer_take_resets() {
        let mut buffer = BatchBuffer::new(1024);
        buffer
            .push(&BulkAction::delete("logs", None, "1"))
            .unwrap();
        buffer
            .push(&BulkAction::delete("logs", None, "2"))
            .unwrap();
        assert_eq!(buffer.operations(), 2);

        let body = buffer.take();
        assert_eq!(body.operations, 2);
        assert_eq!(body.payload.lines().count(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len_bytes(), 0);
    }
}
