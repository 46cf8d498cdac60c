//! HTTP fetch utilities: the short-lived one-shot query client used on the
//! server/hydration path, and the token-endpoint fetcher used by forced
//! auth refreshes.
//!
//! Both forward a configurable set of request headers so credentials
//! (typically the session cookie) propagate from the inbound request to
//! the outbound fetch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::TokenFetch;
use crate::descriptor::QueryDescriptor;
use crate::error::{FetchError, TokenFetchError};

/// One-shot query evaluation, abstracted so the engine can be tested
/// without a network. Production uses [`HttpFetcher`].
#[async_trait]
pub trait SnapshotFetch: Send + Sync {
    /// Evaluate the query once and return its current result.
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Value, FetchError>;
}

/// Request body for the deployment's query endpoint.
#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    path: &'a str,
    args: &'a Value,
    format: &'static str,
}

/// Response envelope from the deployment's query endpoint.
#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    status: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

/// Unpack a query envelope into a result.
///
/// Extracted from [`HttpFetcher::fetch`] so the envelope handling can be
/// unit-tested without a live server.
fn unpack_envelope(envelope: QueryEnvelope) -> Result<Value, FetchError> {
    match envelope.status.as_str() {
        "success" => Ok(envelope.value.unwrap_or(Value::Null)),
        "error" => Err(FetchError::Rejected(
            envelope
                .error_message
                .unwrap_or_else(|| "unspecified backend error".to_string()),
        )),
        other => Err(FetchError::Decode(format!(
            "unexpected envelope status '{other}'"
        ))),
    }
}

/// Join a base URL and a path without doubling or dropping the slash.
fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Short-lived HTTP client for one-shot query fetches.
///
/// Created per server-side request; holds no connection state beyond the
/// underlying `reqwest` pool.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use livequery::{HttpFetcher, QueryDescriptor, SnapshotFetch};
/// use serde_json::json;
///
/// let fetcher = HttpFetcher::new("https://deployment.example.com");
/// let descriptor = QueryDescriptor::new("events.list", json!({ "status": "on_sale" }));
/// let snapshot = fetcher.fetch(&descriptor).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    deployment_url: String,
    forwarded_headers: Vec<(String, String)>,
}

impl HttpFetcher {
    /// Build a fetcher against a deployment base URL.
    pub fn new(deployment_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            deployment_url: deployment_url.into(),
            forwarded_headers: Vec::new(),
        }
    }

    /// Attach request headers to forward on every fetch (e.g. `cookie`
    /// for credential propagation).
    pub fn with_forwarded_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.forwarded_headers = headers;
        self
    }
}

#[async_trait]
impl SnapshotFetch for HttpFetcher {
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Value, FetchError> {
        let url = join_url(&self.deployment_url, "api/query");
        let body = QueryRequest {
            path: descriptor.name(),
            args: descriptor.args(),
            format: "json",
        };

        let mut request = self.client.post(&url).json(&body);
        for (name, value) in &self.forwarded_headers {
            request = request.header(name, value);
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: QueryEnvelope = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        tracing::debug!(query = descriptor.name(), status = %envelope.status, "one-shot fetch");
        unpack_envelope(envelope)
    }
}

/// Response body of the site's token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Fetches fresh bearer tokens from the site's token endpoint.
///
/// Used by [`TokenCache`](crate::TokenCache) on forced refresh. The
/// endpoint is expected to answer `{"token": <string|null>}`.
#[derive(Debug, Clone)]
pub struct HttpTokenFetcher {
    client: reqwest::Client,
    endpoint: String,
    forwarded_headers: Vec<(String, String)>,
}

impl HttpTokenFetcher {
    /// Build a fetcher for `<site_url>/<token_path>`.
    pub fn new(site_url: impl Into<String>, token_path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: join_url(&site_url.into(), token_path),
            forwarded_headers: Vec::new(),
        }
    }

    /// Attach request headers to forward on every token fetch.
    pub fn with_forwarded_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.forwarded_headers = headers;
        self
    }
}

#[async_trait]
impl TokenFetch for HttpTokenFetcher {
    async fn fetch_token(&self) -> Result<Option<String>, TokenFetchError> {
        let mut request = self.client.get(&self.endpoint);
        for (name, value) in &self.forwarded_headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TokenFetchError::Status(response.status().as_u16()));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(TokenFetchError::Http)?;
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://x.example.com/", "/api/query"),
            "https://x.example.com/api/query"
        );
        assert_eq!(
            join_url("https://x.example.com", "api/query"),
            "https://x.example.com/api/query"
        );
    }

    #[test]
    fn query_request_serializes_expected_shape() {
        let args = json!({ "status": "on_sale" });
        let body = QueryRequest {
            path: "events.list",
            args: &args,
            format: "json",
        };
        let encoded = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            encoded,
            json!({
                "path": "events.list",
                "args": { "status": "on_sale" },
                "format": "json"
            })
        );
    }

    #[test]
    fn unpack_envelope_success_returns_value() {
        let envelope = QueryEnvelope {
            status: "success".to_string(),
            value: Some(json!([{ "id": 1 }])),
            error_message: None,
        };
        assert_eq!(unpack_envelope(envelope).expect("ok"), json!([{ "id": 1 }]));
    }

    #[test]
    fn unpack_envelope_success_without_value_is_null() {
        let envelope = QueryEnvelope {
            status: "success".to_string(),
            value: None,
            error_message: None,
        };
        assert_eq!(unpack_envelope(envelope).expect("ok"), Value::Null);
    }

    #[test]
    fn unpack_envelope_error_carries_message() {
        let envelope = QueryEnvelope {
            status: "error".to_string(),
            value: None,
            error_message: Some("permission denied".to_string()),
        };
        let err = unpack_envelope(envelope).expect_err("err");
        assert!(matches!(err, FetchError::Rejected(ref m) if m == "permission denied"));
    }

    #[test]
    fn unpack_envelope_rejects_unknown_status() {
        let envelope = QueryEnvelope {
            status: "partial".to_string(),
            value: None,
            error_message: None,
        };
        assert!(matches!(
            unpack_envelope(envelope),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn token_response_tolerates_null_and_missing_token() {
        let none: TokenResponse = serde_json::from_str(r#"{"token":null}"#).expect("parse");
        assert_eq!(none.token, None);
        let missing: TokenResponse = serde_json::from_str(r#"{}"#).expect("parse");
        assert_eq!(missing.token, None);
        let some: TokenResponse = serde_json::from_str(r#"{"token":"abc"}"#).expect("parse");
        assert_eq!(some.token, Some("abc".to_string()));
    }
}
