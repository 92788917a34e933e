//! The document shape that flows from cursors to writers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schemaless, insertion-ordered document payload.
pub type Payload = Map<String, Value>;

/// A document as returned by a search hit, or as written to a dump file.
///
/// Every field is optional because scrolled hits are not trusted: the bulk
/// worker decides whether a document is complete enough to be written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Index the document lives in (or will be written to).
    #[serde(rename = "_index", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Mapping type. Absent on typeless clusters.
    #[serde(rename = "_type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Document identifier. `None` lets the destination generate one.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Document body.
    #[serde(rename = "_source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Payload>,
    /// Custom routing key.
    #[serde(
        rename = "_routing",
        alias = "routing",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub routing: Option<String>,
}

impl Document {
    /// Creates a document with an index, an id and a body.
    pub fn new(index: impl Into<String>, id: impl Into<String>, source: Payload) -> Self {
        Self {
            index: Some(index.into()),
            id: Some(id.into()),
            source: Some(source),
            ..Self::default()
        }
    }

    /// Sets the mapping type.
    #[must_use]
    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    /// Sets the routing key.
    #[must_use]
    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    /// Returns the name of the first required field that is missing, if any.
    ///
    /// Index, id and body are always required; the type only when the
    /// destination still uses mapping types.
    #[must_use]
    pub fn missing_field(&self, requires_type: bool) -> Option<&'static str> {
        if self.index.as_deref().map_or(true, str::is_empty) {
            return Some("_index");
        }
        if self.id.is_none() {
            return Some("_id");
        }
        if self.source.is_none() {
            return Some("_source");
        }
        if requires_type && self.doc_type.as_deref().map_or(true, str::is_empty) {
            return Some("_type");
        }
        None
    }

    /// The id, or an empty string when there is none.
    #[must_use]
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Builds a payload from a JSON object literal; non-objects give an empty payload.
#[must_use]
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
