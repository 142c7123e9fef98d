//! Upstream GraphQL client.
//!
//! One client is created per process and shared by every request; only its
//! connection pool is mutable state. The client never retries — retry policy
//! belongs to the upstream or the caller.

use crate::error::{Error, Result, TransportError};
use crate::types::{GraphQLRequest, GraphQLResponse};
use http::header::HeaderMap;
use std::time::Duration;

/// Headers that must never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client for the upstream GraphQL endpoint
#[derive(Clone)]
pub struct GraphqlClient {
    endpoint: reqwest::Url,
    http: reqwest::Client,
}

impl GraphqlClient {
    /// Create a client with a pool sized for the expected parallel load.
    pub fn new(endpoint: &str, pool_size: usize) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid GraphQL endpoint: {e}")))?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_size)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Execute one operation against the upstream.
    ///
    /// A `{data, errors}` body is a success at this layer; GraphQL-level
    /// errors ride in the `errors` slot for the transcoder to translate.
    pub async fn execute(
        &self,
        request: &GraphQLRequest,
        inbound_headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<GraphQLResponse> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(forward_headers(inbound_headers))
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Upstream(status.as_u16()).into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| TransportError::Decode(e.to_string()).into())
    }
}

impl std::fmt::Debug for GraphqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

/// Keep only allow-listed inbound headers: `Authorization`, `Cookie` and
/// `X-*` custom headers. Content-Type is owned by the client itself and
/// hop-by-hop headers never pass.
pub(crate) fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) {
            continue;
        }
        if lower == "authorization" || lower == "cookie" || lower.starts_with("x-") {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}
