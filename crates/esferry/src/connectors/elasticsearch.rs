//! Elasticsearch/OpenSearch HTTP client.
//!
//! Implements [`ScrollSource`] and [`BulkSink`] for every supported version
//! family, plus the administrative calls used by index setup and readiness
//! checks. Version differences are resolved through [`ApiVersion`].

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::connectors::common::{
    create_http_client, handle_http_error, json_type_name, validate_url,
};
use crate::connectors::version::{ApiVersion, ClusterInfo};
use crate::connectors::{BulkSummary, BulkSink, ScrollPage, ScrollRequest, ScrollSource};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::pipeline::batch::BulkBody;
use crate::retry::{with_retry, RetryConfig};

/// Health summary of a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterHealth {
    /// Cluster name.
    #[serde(default)]
    pub cluster_name: String,
    /// `green`, `yellow` or `red`.
    pub status: String,
}

/// Search and scroll response body.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    #[serde(default)]
    hits: Option<HitsContainer>,
    #[serde(rename = "_shards", default)]
    shards: Option<ShardStats>,
}

#[derive(Debug, Deserialize)]
struct HitsContainer {
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    hits: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ShardStats {
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

/// Reads `hits.total`, which is a number before 7.x and `{value, relation}` after.
fn parse_total_hits(total: Option<&Value>) -> Result<u64> {
    match total {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::Decode(format!("hits.total '{}' is not a count", n))),
        Some(Value::Object(obj)) => obj
            .get("value")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Decode("hits.total object has no numeric value".to_string())),
        Some(other) => Err(Error::Decode(format!(
            "hits.total has unexpected type {}",
            json_type_name(other)
        ))),
    }
}

/// Builds the body of an initial search request.
pub(crate) fn search_body(request: &ScrollRequest, version: ApiVersion) -> Value {
    let mut body = Map::new();

    if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
        body.insert(
            "query".to_string(),
            json!({ "query_string": { "query": query } }),
        );
    }

    if let Some(field) = request.sort_field.as_deref().filter(|f| !f.is_empty()) {
        body.insert("sort".to_string(), json!([field]));
    }

    if let Some(slice) = request.slice.filter(|s| s.max > 1) {
        if version.supports_slices() {
            body.insert(
                "slice".to_string(),
                json!({ "id": slice.id, "max": slice.max }),
            );
        }
    }

    match request.fields.as_slice() {
        [] => {}
        [single] => {
            body.insert("_source".to_string(), json!(single));
        }
        many => {
            body.insert("_source".to_string(), json!(many));
        }
    }

    Value::Object(body)
}

/// HTTP client bound to one cluster.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    host: String,
    client: Client,
    version: ApiVersion,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchClient {
    /// Builds a client and detects the cluster version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] when the cluster cannot be reached or its
    /// version cannot be determined after retries.
    pub async fn connect(endpoint: &EndpointConfig, retry: &RetryConfig) -> Result<Self> {
        let mut client = Self::with_version(endpoint, ApiVersion::V8)?;

        let info = with_retry(retry, "cluster version", || client.cluster_info())
            .await
            .map_err(|e| Error::Handshake {
                host: client.host.clone(),
                reason: e.to_string(),
            })?;

        client.version = ApiVersion::detect(
            &info.version.number,
            info.version.distribution.as_deref(),
        )
        .map_err(|e| Error::Handshake {
            host: client.host.clone(),
            reason: e.to_string(),
        })?;

        info!(
            "Connected to {} ({}, version {}, protocol {})",
            client.host,
            info.cluster_name.as_deref().unwrap_or("unnamed"),
            info.version.number,
            client.version
        );
        Ok(client)
    }

    /// Builds a client for a cluster whose version is already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or proxy is invalid.
    pub fn with_version(endpoint: &EndpointConfig, version: ApiVersion) -> Result<Self> {
        validate_url(&endpoint.url)?;
        Ok(Self {
            host: endpoint.url.trim_end_matches('/').to_string(),
            client: create_http_client(endpoint.proxy.as_deref())?,
            version,
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        })
    }

    /// Base URL of the cluster.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Detected protocol family.
    #[must_use]
    pub fn version(&self) -> ApiVersion {
        self.version
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.host, path.trim_start_matches('/'));
        let req = self.client.request(method, url);
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    /// Sends a request and maps non-success answers to errors.
    async fn send(&self, req: RequestBuilder, operation: &str) -> Result<Response> {
        let response = req.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(handle_http_error(status, &body, &self.host, operation))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: RequestBuilder,
        operation: &str,
    ) -> Result<T> {
        let response = self.send(req, operation).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Decode(format!("{} on {}: {}", operation, self.host, e)))
    }

    /// Reads `GET /`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a cluster description.
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.send_json(self.request(Method::GET, "/"), "cluster info")
            .await
    }

    /// Reads `GET /_cluster/health`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn cluster_health(&self) -> Result<ClusterHealth> {
        self.send_json(
            self.request(Method::GET, "/_cluster/health"),
            "cluster health",
        )
        .await
    }

    /// Polls cluster health until the cluster is usable.
    ///
    /// Any reachable status is accepted unless `wait_for_green` is set.
    /// Unreachable answers are retried through `retry`; a non-green status
    /// is polled again every `interval`.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn wait_until_ready(
        &self,
        wait_for_green: bool,
        interval: Duration,
        retry: &RetryConfig,
    ) -> Result<ClusterHealth> {
        loop {
            let health = with_retry(retry, "cluster health", || self.cluster_health()).await?;
            if !wait_for_green || health.status == "green" {
                debug!("{} is ready ({})", self.host, health.status);
                return Ok(health);
            }
            info!(
                "{} health is {}, waiting {:?} for green",
                self.host, health.status, interval
            );
            tokio::time::sleep(interval).await;
        }
    }

    /// Reads `GET /{indexes}/_settings`, keyed by concrete index name.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not an object.
    pub async fn index_settings(&self, indexes: &str) -> Result<Map<String, Value>> {
        let value: Value = self
            .send_json(
                self.request(Method::GET, &format!("/{}/_settings", indexes)),
                &format!("get settings of {}", indexes),
            )
            .await?;
        into_object(value, "settings")
    }

    /// Reads `GET /{indexes}/_mapping`, keyed by concrete index name.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not an object.
    pub async fn index_mappings(&self, indexes: &str) -> Result<Map<String, Value>> {
        let value: Value = self
            .send_json(
                self.request(Method::GET, &format!("/{}/_mapping", indexes)),
                &format!("get mappings of {}", indexes),
            )
            .await?;
        into_object(value, "mappings")
    }

    /// Whether an index exists.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or unexpected statuses.
    pub async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .request(Method::HEAD, &format!("/{}", name))
            .send()
            .await?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(handle_http_error(
                status,
                "",
                &self.host,
                &format!("check index {}", name),
            )),
        }
    }

    /// Creates an index with the given settings/mappings body.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the request.
    pub async fn create_index(&self, name: &str, body: &Value) -> Result<()> {
        self.send(
            self.request(Method::PUT, &format!("/{}", name)).json(body),
            &format!("create index {}", name),
        )
        .await?;
        info!("Created index {} on {}", name, self.host);
        Ok(())
    }

    /// Deletes an index. A missing index is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the request.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        match self
            .send(
                self.request(Method::DELETE, &format!("/{}", name)),
                &format!("delete index {}", name),
            )
            .await
        {
            Ok(_) => {
                info!("Deleted index {} on {}", name, self.host);
                Ok(())
            }
            Err(e) if e.status() == Some(404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Updates index settings.
    ///
    /// Analysis settings are static, so the index is closed while they are
    /// applied and reopened afterwards, even when the update fails.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the calls fails.
    pub async fn update_settings(&self, name: &str, settings: &Value) -> Result<()> {
        let needs_close = has_analysis(settings);

        if needs_close {
            self.send(
                self.request(Method::POST, &format!("/{}/_close", name)),
                &format!("close index {}", name),
            )
            .await?;
        }

        let updated = self
            .send(
                self.request(Method::PUT, &format!("/{}/_settings", name))
                    .json(settings),
                &format!("update settings of {}", name),
            )
            .await;

        if needs_close {
            self.send(
                self.request(Method::POST, &format!("/{}/_open", name)),
                &format!("open index {}", name),
            )
            .await?;
        }

        updated.map(|_| ())
    }

    /// Puts a mapping, typed on clusters whose mappings are keyed by type.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the mapping.
    pub async fn update_mapping(
        &self,
        name: &str,
        doc_type: Option<&str>,
        mapping: &Value,
    ) -> Result<()> {
        let path = match doc_type.filter(|_| self.version.typed_mappings()) {
            Some(t) => format!("/{}/_mapping/{}", name, t),
            None => format!("/{}/_mapping", name),
        };
        self.send(
            self.request(Method::PUT, &path).json(mapping),
            &format!("update mapping of {}", name),
        )
        .await?;
        Ok(())
    }

    /// Refreshes an index so written documents become searchable.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        self.send(
            self.request(Method::POST, &format!("/{}/_refresh", name)),
            &format!("refresh {}", name),
        )
        .await?;
        Ok(())
    }

    fn page_from(&self, response: SearchResponse, operation: &str) -> Result<ScrollPage> {
        if let Some(shards) = &response.shards {
            if shards.failed > 0 {
                for failure in &shards.failures {
                    error!("{} on {}: shard failure {}", operation, self.host, failure);
                }
            }
        }

        let (total, documents) = match response.hits {
            Some(hits) => (hits.total, hits.hits),
            None => (None, Vec::new()),
        };

        Ok(ScrollPage {
            scroll_id: response.scroll_id.unwrap_or_default(),
            total_hits: parse_total_hits(total.as_ref())?,
            documents,
        })
    }
}

fn into_object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Decode(format!(
            "{} response is a {}, expected an object",
            what,
            json_type_name(&other)
        ))),
    }
}

/// Whether a settings body touches static analysis settings.
fn has_analysis(settings: &Value) -> bool {
    let Some(obj) = settings.as_object() else {
        return false;
    };
    obj.contains_key("analysis")
        || obj.contains_key("index.analysis")
        || obj
            .get("index")
            .and_then(Value::as_object)
            .is_some_and(|index| index.contains_key("analysis"))
}

#[async_trait]
impl ScrollSource for ElasticsearchClient {
    async fn open_scroll(&self, request: &ScrollRequest) -> Result<ScrollPage> {
        let operation = format!("open scroll on {}", request.indexes);
        let body = search_body(request, self.version);

        let mut params = vec![
            ("scroll", request.keep_alive.clone()),
            ("size", request.page_size.to_string()),
        ];
        if self.version == ApiVersion::Legacy && request.sort_field.is_none() {
            params.push(("search_type", "scan".to_string()));
        }

        debug!("{}: {}", operation, body);
        let response: SearchResponse = self
            .send_json(
                self.request(Method::POST, &format!("/{}/_search", request.indexes))
                    .query(&params)
                    .json(&body),
                &operation,
            )
            .await?;
        self.page_from(response, &operation)
    }

    async fn next_page(&self, scroll_id: &str, keep_alive: &str) -> Result<ScrollPage> {
        let req = if self.version.scroll_id_in_body() {
            self.request(Method::POST, "/_search/scroll")
                .json(&json!({ "scroll": keep_alive, "scroll_id": scroll_id }))
        } else {
            self.request(Method::GET, "/_search/scroll")
                .query(&[("scroll", keep_alive), ("scroll_id", scroll_id)])
        };
        let response: SearchResponse = self.send_json(req, "next scroll page").await?;
        self.page_from(response, "next scroll page")
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        if scroll_id.is_empty() {
            return Ok(());
        }
        let req = if self.version == ApiVersion::Legacy {
            self.request(Method::DELETE, "/_search/scroll")
                .query(&[("scroll_id", scroll_id)])
        } else {
            self.request(Method::DELETE, "/_search/scroll")
                .json(&json!({ "scroll_id": [scroll_id] }))
        };
        match self.send(req, "clear scroll").await {
            Ok(_) => Ok(()),
            Err(e) if e.status() == Some(404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn default_sort_field(&self) -> &'static str {
        self.version.default_sort_field()
    }
}

#[async_trait]
impl BulkSink for ElasticsearchClient {
    async fn bulk(&self, body: &BulkBody) -> Result<BulkSummary> {
        if body.is_empty() {
            return Ok(BulkSummary::default());
        }

        let response: BulkResponse = self
            .send_json(
                self.request(Method::POST, "/_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(body.payload.clone()),
                "bulk",
            )
            .await?;

        let failed_items = response
            .items
            .iter()
            .filter(|item| item.values().any(|result| result.get("error").is_some()))
            .count();

        if response.errors {
            warn!(
                "Bulk on {} reported errors: {} of {} items failed",
                self.host, failed_items, body.operations
            );
        }

        Ok(BulkSummary {
            operations: body.operations,
            errors: response.errors,
            failed_items,
        })
    }

    fn requires_type(&self) -> bool {
        self.version.requires_type()
    }
}

#[cfg(test)]
#[path = "elasticsearch_tests.rs"]
mod tests;
