//! Per-document rewrites applied by the bulk workers.

use serde_json::Value;

use crate::config::{FieldRename, TransformOptions};
use crate::document::Document;

/// Rewrites scrolled documents for the destination.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    target_index: Option<String>,
    type_override: Option<String>,
    regenerate_id: bool,
    renames: Vec<FieldRename>,
    skip_fields: Vec<String>,
    requires_type: bool,
}

impl Transformer {
    /// Creates a transformer writing to `target_index` (or each document's own index).
    pub fn new(options: &TransformOptions, target_index: Option<&str>, requires_type: bool) -> Self {
        Self {
            target_index: target_index.filter(|i| !i.is_empty()).map(str::to_string),
            type_override: options.type_override.clone().filter(|t| !t.is_empty()),
            regenerate_id: options.regenerate_id,
            renames: options.rename_fields.clone(),
            skip_fields: options.skip_fields.clone(),
            requires_type,
        }
    }

    /// Whether the destination needs typed documents.
    #[must_use]
    pub fn requires_type(&self) -> bool {
        self.requires_type
    }

    /// Name of the first field a scrolled document lacks, if any.
    ///
    /// The type is only demanded when the destination needs one and no
    /// override will supply it.
    #[must_use]
    pub fn missing_field(&self, doc: &Document) -> Option<&'static str> {
        doc.missing_field(self.requires_type && self.type_override.is_none())
    }

    /// Applies overrides, id regeneration, renames, skips and routing cleanup.
    #[must_use]
    pub fn apply(&self, mut doc: Document) -> Document {
        if let Some(index) = &self.target_index {
            doc.index = Some(index.clone());
        }

        if let Some(source) = doc.source.as_mut() {
            for rename in &self.renames {
                if rename.from == "_type" {
                    if let Some(doc_type) = &doc.doc_type {
                        source.insert(rename.to.clone(), Value::String(doc_type.clone()));
                    }
                } else if let Some(value) = source.shift_remove(&rename.from) {
                    source.insert(rename.to.clone(), value);
                }
            }
            for field in &self.skip_fields {
                source.shift_remove(field);
            }
        }

        if !self.requires_type {
            doc.doc_type = None;
        } else if let Some(doc_type) = &self.type_override {
            doc.doc_type = Some(doc_type.clone());
        }

        if self.regenerate_id {
            doc.id = None;
        }

        doc.routing = doc.routing.filter(|r| !r.is_empty());
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::payload;
    use serde_json::json;

    fn hit() -> Document {
        Document::new("src", "1", payload(json!({"a": 1, "b": 2, "c": 3})))
            .with_type("event")
            .with_routing("")
    }

    #[test]
    fn test_default_keeps_document() {
        let transformer = Transformer::new(&TransformOptions::default(), None, true);
        let doc = transformer.apply(hit());

        assert_eq!(doc.index.as_deref(), Some("src"));
        assert_eq!(doc.doc_type.as_deref(), Some("event"));
        assert_eq!(doc.id.as_deref(), Some("1"));
        assert_eq!(doc.routing, None);
    }

    #[test]
    fn test_overrides_and_regenerated_id() {
        let options = TransformOptions {
            type_override: Some("_doc".to_string()),
            regenerate_id: true,
            ..TransformOptions::default()
        };
        let transformer = Transformer::new(&options, Some("dst"), true);

        let doc = transformer.apply(hit().with_routing("user-1"));

        assert_eq!(doc.index.as_deref(), Some("dst"));
        assert_eq!(doc.doc_type.as_deref(), Some("_doc"));
        assert_eq!(doc.id, None);
        assert_eq!(doc.routing.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_typeless_destination_drops_type() {
        let transformer = Transformer::new(&TransformOptions::default(), None, false);
        assert_eq!(transformer.apply(hit()).doc_type, None);
    }

    #[test]
    fn test_renames_keep_order_and_copy_type() {
        let options = TransformOptions {
            rename_fields: FieldRename::parse_list("a:alpha,_type:kind,missing:x").unwrap(),
            skip_fields: vec!["b".to_string()],
            ..TransformOptions::default()
        };
        let transformer = Transformer::new(&options, None, false);

        let source = transformer.apply(hit()).source.unwrap();

        let keys: Vec<_> = source.keys().cloned().collect();
        assert_eq!(keys, vec!["c", "alpha", "kind"]);
        assert_eq!(source["alpha"], 1);
        assert_eq!(source["kind"], "event");
    }

    #[test]
    fn test_missing_field_respects_type_override() {
        let mut doc = hit();
        doc.doc_type = None;

        let strict = Transformer::new(&TransformOptions::default(), None, true);
        assert_eq!(strict.missing_field(&doc), Some("_type"));

        let options = TransformOptions {
            type_override: Some("_doc".to_string()),
            ..TransformOptions::default()
        };
        let overridden = Transformer::new(&options, None, true);
        assert_eq!(overridden.missing_field(&doc), None);

        let typeless = Transformer::new(&TransformOptions::default(), None, false);
        assert_eq!(typeless.missing_field(&doc), None);
    }
}
