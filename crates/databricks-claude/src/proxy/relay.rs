//! Upstream relay
//!
//! Sends rewritten requests to the serving endpoint and hands back the
//! response either fully buffered or as a chunk stream. Failures that happen
//! before any response bytes exist surface as [`UpstreamError`] so the
//! server can answer with a local status instead.

use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use super::rewrite::{CLIENT_API_KEY_HEADER, HOP_BY_HOP_HEADERS, OutboundRequest, VENDOR_KEY_HEADER};
use crate::error::{Error, Result};

/// Errors talking to the serving endpoint
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// The endpoint answered with a non-success status
    ///
    /// `headers` are the caller-safe upstream headers, so `retry-after` and
    /// request ids still reach the agent CLI.
    #[error("Upstream returned {status}: {body}")]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: String,
    },

    /// No response within the configured timeouts
    #[error("Upstream timed out: {0}")]
    Timeout(String),

    /// The endpoint could not be reached
    #[error("Failed to connect to upstream: {0}")]
    Connect(String),

    /// Any other transport failure before the response started
    #[error("Upstream request failed: {0}")]
    Network(String),

    /// The response stream broke after bytes were already sent
    #[error("Upstream stream interrupted: {0}")]
    Interrupted(String),
}

impl UpstreamError {
    /// Short label used in the exchange log
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Status { .. } => "upstream_status",
            UpstreamError::Timeout(_) => "upstream_timeout",
            UpstreamError::Connect(_) => "upstream_connect",
            UpstreamError::Network(_) => "upstream_network",
            UpstreamError::Interrupted(_) => "stream_interrupted",
        }
    }

    fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout(e.to_string())
        } else if e.is_connect() {
            UpstreamError::Connect(e.to_string())
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

/// Response body as handed to the server
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, std::result::Result<Bytes, UpstreamError>>),
}

/// Successful upstream response
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl ProxyResponse {
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Streaming(_))
    }
}

/// Relays rewritten requests over a shared connection pool
#[derive(Clone)]
pub struct StreamingRelay {
    client: reqwest::Client,
}

impl StreamingRelay {
    /// Build a relay with bounded connect and per-read timeouts
    ///
    /// The read timeout applies between chunks, so long streams stay open
    /// while they keep producing data.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Proxy(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Send `request` upstream
    pub async fn relay(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<ProxyResponse, UpstreamError> {
        let OutboundRequest {
            method,
            url,
            headers,
            body,
            model,
            secrets,
        } = request;
        tracing::debug!(%url, ?model, "Relaying upstream");

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(UpstreamError::from_send)?;

        let status = response.status();
        let headers = response_headers(response.headers(), &secrets);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status,
                headers,
                body,
            });
        }

        let streaming = is_streaming_response(response.headers());

        let body = if streaming {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| UpstreamError::Interrupted(e.to_string())));
            ResponseBody::Streaming(stream.boxed())
        } else {
            let bytes = response.bytes().await.map_err(UpstreamError::from_send)?;
            ResponseBody::Buffered(bytes)
        };

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Event streams and chunked bodies are relayed as they arrive
pub fn is_streaming_response(headers: &HeaderMap) -> bool {
    let event_stream = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with("text/event-stream"));
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    event_stream || chunked
}

/// Copy upstream headers for the caller, dropping framing headers and
/// anything that would echo a credential back
fn response_headers(upstream: &HeaderMap, secrets: &[SecretString]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str)
            || name_str == CONTENT_LENGTH.as_str()
            || name_str == AUTHORIZATION.as_str()
            || name_str == VENDOR_KEY_HEADER
            || name_str == CLIENT_API_KEY_HEADER
        {
            continue;
        }
        if secrets
            .iter()
            .any(|secret| contains(value.as_bytes(), secret.expose_secret().as_bytes()))
        {
            tracing::warn!(header = %name, "Dropping upstream header that echoes a credential");
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_streaming_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream; charset=utf-8"));
        assert!(is_streaming_response(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_streaming_response(&headers));

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(is_streaming_response(&headers));
    }

    #[test]
    fn test_response_headers_strip_credentials() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert("connection", HeaderValue::from_static("close"));
        upstream.insert(AUTHORIZATION, HeaderValue::from_static("Bearer dapi-session"));
        upstream.insert("x-echo", HeaderValue::from_static("token=dapi-session"));
        upstream.insert("x-request-id", HeaderValue::from_static("req-1"));

        let secrets = vec![SecretString::from("dapi-session".to_string())];
        let headers = response_headers(&upstream, &secrets);

        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers["x-request-id"], "req-1");
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get("x-echo").is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(UpstreamError::Timeout(String::new()).kind(), "upstream_timeout");
        assert_eq!(
            UpstreamError::Status {
                status: StatusCode::TOO_MANY_REQUESTS,
                headers: HeaderMap::new(),
                body: String::new()
            }
            .kind(),
            "upstream_status"
        );
        assert_eq!(UpstreamError::Interrupted(String::new()).kind(), "stream_interrupted");
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"Bearer abc", b"abc"));
        assert!(!contains(b"Bearer abc", b"xyz"));
        assert!(!contains(b"anything", b""));
    }
}
