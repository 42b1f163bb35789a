//! Request rewriting for the Databricks serving endpoint
//!
//! Turns an inbound Anthropic-shaped request into one aimed at the
//! workspace's serving endpoint: the target comes from configuration, the
//! `model` field is mapped to the platform name, and both credentials are
//! attached as separate headers. Everything else passes through untouched.

use std::collections::{BTreeMap, BTreeSet};

use axum::body::{Body, HttpBody};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::auth::SessionCredential;
use crate::config::{Config, Mode};
use crate::error::{Error, Result};

/// Header carrying the vendor key to the serving endpoint
pub const VENDOR_KEY_HEADER: &str = "x-anthropic-api-key";
/// Header the agent CLI uses for its own API key
pub const CLIENT_API_KEY_HEADER: &str = "x-api-key";
/// Header enabling coding-agent behavior in databricks mode
pub const CODING_AGENT_MODE_HEADER: &str = "x-databricks-use-coding-agent-mode";

/// Placeholder in the serving path replaced by the mapped model
const MODEL_PLACEHOLDER: &str = "{model}";

/// Hop-by-hop headers that should not be forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "upgrade",
];

/// Errors raised while rewriting a request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// No mapping for the requested model and no default configured
    #[error("Unknown model '{0}': no platform mapping configured")]
    UnknownModel(String),

    /// The serving path needs a model but the request names none
    #[error("Request has no model and no default model is configured")]
    MissingModel,

    /// The inbound body could not be read
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    /// The inbound body is larger than the rewrite limit
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// A credential or configured header is not a valid header value
    #[error("Invalid header value for '{0}'")]
    InvalidHeader(String),

    /// The target URL could not be built
    #[error("Invalid target URL '{0}'")]
    InvalidTarget(String),
}

/// Inbound request body
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    /// Read in full so the model field can be rewritten
    Buffered(Bytes),
    /// Forwarded as it arrives
    Streaming(Body),
}

/// One inbound call from the agent CLI
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query as received
    pub path: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ProxyRequest {
    /// Split an axum request, reading JSON bodies up to `max_body_bytes`
    pub async fn from_request(
        request: Request<Body>,
        max_body_bytes: usize,
    ) -> std::result::Result<Self, RoutingError> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();

        let body = if body.size_hint().exact() == Some(0) {
            RequestBody::Empty
        } else if is_json(&parts.headers) {
            let declared = parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok());
            if declared.is_some_and(|len| len > max_body_bytes) {
                return Err(RoutingError::BodyTooLarge {
                    limit: max_body_bytes,
                });
            }
            RequestBody::Buffered(read_limited(body, max_body_bytes).await?)
        } else {
            RequestBody::Streaming(body)
        };

        Ok(Self {
            method: parts.method,
            path,
            headers: parts.headers,
            body,
        })
    }
}

/// Collect a body, failing once it grows past `limit` bytes
async fn read_limited(body: Body, limit: usize) -> std::result::Result<Bytes, RoutingError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RoutingError::InvalidBody(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(RoutingError::BodyTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Request ready to be sent to the serving endpoint
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    /// Platform model name, when the request named one
    pub model: Option<String>,
    /// Credential values injected into this request
    pub(crate) secrets: Vec<SecretString>,
}

impl OutboundRequest {
    pub fn secrets(&self) -> &[SecretString] {
        &self.secrets
    }
}

/// Static vendor -> platform model lookup
#[derive(Debug, Clone)]
pub struct ModelRouting {
    models: BTreeMap<String, String>,
    platform_names: BTreeSet<String>,
    default_model: Option<String>,
}

impl ModelRouting {
    pub fn new(models: BTreeMap<String, String>, default_model: Option<String>) -> Self {
        let platform_names = models.values().cloned().collect();
        Self {
            models,
            platform_names,
            default_model,
        }
    }

    /// Map a vendor model identifier to the platform model name
    ///
    /// Exact matches win, then the identifier without a trailing date
    /// stamp (`claude-sonnet-4-5-20250929`). Platform names pass through.
    pub fn resolve(&self, model: &str) -> std::result::Result<String, RoutingError> {
        if let Some(mapped) = self.models.get(model) {
            return Ok(mapped.clone());
        }
        if let Some(mapped) = strip_date_suffix(model).and_then(|base| self.models.get(base)) {
            return Ok(mapped.clone());
        }
        if self.platform_names.contains(model) {
            return Ok(model.to_string());
        }
        self.default_model
            .clone()
            .ok_or_else(|| RoutingError::UnknownModel(model.to_string()))
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }
}

fn strip_date_suffix(model: &str) -> Option<&str> {
    let (base, suffix) = model.rsplit_once('-')?;
    (suffix.len() == 8 && suffix.bytes().all(|b| b.is_ascii_digit())).then_some(base)
}

/// Rewrites inbound requests for the serving endpoint
pub struct RequestRewriter {
    workspace: String,
    serving_path: String,
    append_request_path: bool,
    mode: Mode,
    vendor_key: Option<(HeaderValue, SecretString)>,
    routing: ModelRouting,
    extra_headers: HeaderMap,
}

impl RequestRewriter {
    /// Build a rewriter, failing on configuration that cannot serve requests
    pub fn from_config(config: &Config) -> Result<Self> {
        let workspace = config.workspace_url()?;
        Url::parse(&workspace)
            .map_err(|e| Error::Config(format!("Invalid workspace URL '{workspace}': {e}")))?;

        let vendor_key = match config.auth.vendor_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let mut value = HeaderValue::from_str(key).map_err(|_| {
                    Error::Config("Anthropic API key is not a valid header value".to_string())
                })?;
                value.set_sensitive(true);
                Some((value, SecretString::from(key.to_owned())))
            }
            None => None,
        };
        if config.workspace.mode == Mode::ClaudeMax && vendor_key.is_none() {
            return Err(Error::Config(
                "claude_max mode requires an Anthropic API key".to_string(),
            ));
        }

        let mut extra_headers = HeaderMap::new();
        for (name, value) in &config.workspace.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid extra header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid value for header '{name}': {e}")))?;
            extra_headers.insert(name, value);
        }

        let serving_path = if config.workspace.serving_path.starts_with('/') {
            config.workspace.serving_path.clone()
        } else {
            format!("/{}", config.workspace.serving_path)
        };

        Ok(Self {
            workspace,
            serving_path: serving_path.trim_end_matches('/').to_string(),
            append_request_path: config.workspace.append_request_path,
            mode: config.workspace.mode,
            vendor_key,
            routing: ModelRouting::new(
                config.routing.models.clone(),
                config.routing.default_model.clone(),
            ),
            extra_headers,
        })
    }

    /// Produce the outbound request for `request` using `credential`
    pub fn rewrite(
        &self,
        request: ProxyRequest,
        credential: &SessionCredential,
    ) -> std::result::Result<OutboundRequest, RoutingError> {
        let ProxyRequest {
            method,
            path,
            headers,
            body,
        } = request;

        let (body, model) = match body {
            RequestBody::Empty => (reqwest::Body::from(Bytes::new()), None),
            RequestBody::Buffered(bytes) => {
                let (bytes, model) = self.substitute_model(bytes)?;
                (reqwest::Body::from(bytes), model)
            }
            RequestBody::Streaming(body) => (stream_body(body), None),
        };

        let url = self.target_url(&path, model.as_deref())?;
        let headers = self.outbound_headers(headers, credential)?;

        let mut secrets = vec![SecretString::from(
            credential.secret().expose_secret().to_owned(),
        )];
        if let Some((_, key)) = &self.vendor_key {
            secrets.push(SecretString::from(key.expose_secret().to_owned()));
        }

        Ok(OutboundRequest {
            method,
            url,
            headers,
            body,
            model,
            secrets,
        })
    }

    /// Replace the JSON `model` field, leaving every other byte of meaning intact
    fn substitute_model(
        &self,
        bytes: Bytes,
    ) -> std::result::Result<(Bytes, Option<String>), RoutingError> {
        let Ok(mut json) = serde_json::from_slice::<Value>(&bytes) else {
            tracing::debug!("Request body is not valid JSON, forwarding unchanged");
            return Ok((bytes, None));
        };

        let Some(vendor_model) = json.get("model").and_then(Value::as_str) else {
            return Ok((bytes, None));
        };

        let mapped = self.routing.resolve(vendor_model)?;
        if mapped == vendor_model {
            return Ok((bytes, Some(mapped)));
        }

        tracing::debug!(from = vendor_model, to = %mapped, "Mapped model");
        json["model"] = Value::String(mapped.clone());
        let rewritten = serde_json::to_vec(&json)
            .map_err(|e| RoutingError::InvalidBody(format!("Failed to serialize: {e}")))?;
        Ok((Bytes::from(rewritten), Some(mapped)))
    }

    fn target_url(
        &self,
        path: &str,
        model: Option<&str>,
    ) -> std::result::Result<Url, RoutingError> {
        let serving_path = if self.serving_path.contains(MODEL_PLACEHOLDER) {
            let model = model
                .or(self.routing.default_model())
                .ok_or(RoutingError::MissingModel)?;
            self.serving_path.replace(MODEL_PLACEHOLDER, model)
        } else {
            self.serving_path.clone()
        };

        let mut target = format!("{}{}", self.workspace, serving_path);
        if self.append_request_path && path != "/" {
            target.push_str(path);
        }

        Url::parse(&target).map_err(|_| RoutingError::InvalidTarget(target))
    }

    fn outbound_headers(
        &self,
        inbound: HeaderMap,
        credential: &SessionCredential,
    ) -> std::result::Result<HeaderMap, RoutingError> {
        let mut headers = HeaderMap::with_capacity(inbound.len() + 4);
        for (name, value) in &inbound {
            if !is_stripped_request_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let mut bearer =
            HeaderValue::from_str(&format!("Bearer {}", credential.secret().expose_secret()))
                .map_err(|_| RoutingError::InvalidHeader(AUTHORIZATION.to_string()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        match self.mode {
            Mode::ClaudeMax => {
                if let Some((value, _)) = &self.vendor_key {
                    headers.insert(HeaderName::from_static(VENDOR_KEY_HEADER), value.clone());
                }
            }
            Mode::Databricks => {
                headers.insert(
                    HeaderName::from_static(CODING_AGENT_MODE_HEADER),
                    HeaderValue::from_static("true"),
                );
            }
        }

        for (name, value) in &self.extra_headers {
            headers.insert(name.clone(), value.clone());
        }

        Ok(headers)
    }
}

fn is_stripped_request_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    HOP_BY_HOP_HEADERS.contains(&name)
        || name == CONTENT_LENGTH.as_str()
        || name == AUTHORIZATION.as_str()
        || name == CLIENT_API_KEY_HEADER
        || name == VENDOR_KEY_HEADER
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .is_some_and(|ct| ct == "application/json" || ct.ends_with("+json"))
}

/// Pipe an inbound body into a request body without buffering it
///
/// axum bodies are not `Sync`, so chunks cross a bounded channel.
fn stream_body(body: Body) -> reqwest::Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(std::io::Error::other);
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}
