//! Server version families and the protocol differences between them.

use serde::Deserialize;
use std::fmt;

use crate::error::{Error, Result};

/// Protocol family of a cluster, detected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiVersion {
    /// Elasticsearch 1.x and 2.x: scan searches, typed documents.
    Legacy,
    /// Elasticsearch 5.x: sliced scrolls, `_uid` sort.
    V5,
    /// Elasticsearch 6.x: `_id` sort.
    V6,
    /// Elasticsearch 7.x and OpenSearch 1.x.
    V7,
    /// Elasticsearch 8.x+ and OpenSearch 2.x+: typeless, JSON scroll bodies.
    V8,
}

/// The `version` object of the root endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    /// Version string, e.g. `7.17.3`.
    pub number: String,
    /// `opensearch` for OpenSearch clusters, absent for Elasticsearch.
    #[serde(default)]
    pub distribution: Option<String>,
}

/// Response of `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name.
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Version details.
    pub version: VersionInfo,
}

impl ApiVersion {
    /// Maps a version string and distribution to a protocol family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the major version cannot be parsed.
    pub fn detect(number: &str, distribution: Option<&str>) -> Result<Self> {
        let major: u32 = number
            .split('.')
            .next()
            .and_then(|m| m.trim().parse().ok())
            .ok_or_else(|| Error::Decode(format!("unrecognised version '{number}'")))?;

        if distribution.is_some_and(|d| d.eq_ignore_ascii_case("opensearch")) {
            return Ok(if major <= 1 { Self::V7 } else { Self::V8 });
        }

        Ok(match major {
            0..=4 => Self::Legacy,
            5 => Self::V5,
            6 => Self::V6,
            7 => Self::V7,
            _ => Self::V8,
        })
    }

    /// Whether bulk actions must carry a document type.
    #[must_use]
    pub fn requires_type(self) -> bool {
        self < Self::V8
    }

    /// Whether mappings are keyed by type name. From 7.x on, mapping
    /// responses and updates are typeless even though bulk still takes a type.
    #[must_use]
    pub fn typed_mappings(self) -> bool {
        self < Self::V7
    }

    /// Sort field giving ascending id order on this family.
    #[must_use]
    pub fn default_sort_field(self) -> &'static str {
        if self <= Self::V5 {
            "_uid"
        } else {
            "_id"
        }
    }

    /// Whether sliced scrolls are available.
    #[must_use]
    pub fn supports_slices(self) -> bool {
        self >= Self::V5
    }

    /// Whether scroll continuation ids travel in a JSON body.
    #[must_use]
    pub fn scroll_id_in_body(self) -> bool {
        self == Self::V8
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Legacy => "legacy (<5)",
            Self::V5 => "5.x",
            Self::V6 => "6.x",
            Self::V7 => "7.x",
            Self::V8 => "8.x",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_elasticsearch_families() {
        assert_eq!(ApiVersion::detect("1.7.5", None).unwrap(), ApiVersion::Legacy);
        assert_eq!(ApiVersion::detect("2.4.6", None).unwrap(), ApiVersion::Legacy);
        assert_eq!(ApiVersion::detect("5.6.16", None).unwrap(), ApiVersion::V5);
        assert_eq!(ApiVersion::detect("6.8.23", None).unwrap(), ApiVersion::V6);
        assert_eq!(ApiVersion::detect("7.17.3", None).unwrap(), ApiVersion::V7);
        assert_eq!(ApiVersion::detect("8.13.0", None).unwrap(), ApiVersion::V8);
        assert_eq!(ApiVersion::detect("9.0.0", None).unwrap(), ApiVersion::V8);
    }

    #[test]
    fn test_detect_opensearch() {
        assert_eq!(
            ApiVersion::detect("1.3.14", Some("opensearch")).unwrap(),
            ApiVersion::V7
        );
        assert_eq!(
            ApiVersion::detect("2.11.0", Some("opensearch")).unwrap(),
            ApiVersion::V8
        );
    }

    #[test]
    fn test_detect_garbage() {
        assert!(ApiVersion::detect("", None).is_err());
        assert!(ApiVersion::detect("latest", None).is_err());
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(ApiVersion::V5.default_sort_field(), "_uid");
        assert_eq!(ApiVersion::Legacy.default_sort_field(), "_uid");
        assert_eq!(ApiVersion::V6.default_sort_field(), "_id");
        assert!(ApiVersion::V7.requires_type());
        assert!(!ApiVersion::V8.requires_type());
        assert!(ApiVersion::V6.typed_mappings());
        assert!(!ApiVersion::V7.typed_mappings());
        assert!(!ApiVersion::V8.typed_mappings());
        assert!(!ApiVersion::Legacy.supports_slices());
        assert!(ApiVersion::V5.supports_slices());
        assert!(ApiVersion::V8.scroll_id_in_body());
        assert!(!ApiVersion::V7.scroll_id_in_body());
    }
}
