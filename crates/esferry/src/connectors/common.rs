//! Common utilities shared across connectors.
//!
//! HTTP client creation, URL validation, credential parsing and error mapping.

use crate::error::{Error, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Default HTTP timeout for cluster requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates a configured HTTP client with timeouts and an optional proxy.
///
/// # Errors
///
/// Returns an error if the proxy URL is invalid or the client cannot be built.
pub fn create_http_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    Ok(builder.build()?)
}

/// Validates a cluster URL.
pub fn validate_url(url: &str) -> Result<()> {
    let has_valid_scheme = ["http://", "https://"].iter().any(|s| url.starts_with(s));

    if !has_valid_scheme {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }

    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }

    Ok(())
}

/// Splits `user:password` into its parts. A value without `:` is a bare user name.
pub fn parse_auth(auth: &str) -> Option<(String, Option<String>)> {
    let auth = auth.trim();
    if auth.is_empty() {
        return None;
    }
    match auth.split_once(':') {
        Some((user, pass)) => Some((user.to_string(), Some(pass.to_string()))),
        None => Some((auth.to_string(), None)),
    }
}

/// Detects the JSON type as a string, for decode error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Maps a non-success HTTP answer to an error.
pub fn handle_http_error(status_code: u16, body: &str, host: &str, operation: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("{} on {}: {}", operation, host, body)),
        _ => Error::cluster(host, operation, status_code, body),
    }
}
