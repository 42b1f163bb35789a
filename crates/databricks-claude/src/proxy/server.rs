//! HTTP proxy server
//!
//! Accepts Anthropic-shaped requests from the agent CLI on loopback and
//! drives each one through credential resolution, rewriting and relaying.
//! Every path except `/health` is proxied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::Response,
    routing::get,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use super::error::ProxyError;
use super::exchange::{Exchange, ExchangeState, LoggedStream};
use super::relay::{ResponseBody, StreamingRelay};
use super::rewrite::{ProxyRequest, RequestRewriter};
use crate::auth::{self, CredentialSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange_log::ExchangeLog;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Source of the platform session credential
    pub credentials: Arc<dyn CredentialSource>,
    /// Builds outbound requests
    pub rewriter: Arc<RequestRewriter>,
    /// Talks to the serving endpoint
    pub relay: StreamingRelay,
    /// One line per exchange
    pub log: Arc<ExchangeLog>,
    /// Largest JSON body read for model rewriting
    pub max_request_body_bytes: usize,
}

impl AppState {
    /// Build every component from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials = auth::credential_source(config)?;
        let rewriter = RequestRewriter::from_config(config)?;
        let relay = StreamingRelay::new(
            Duration::from_secs(config.proxy.connect_timeout_secs),
            Duration::from_secs(config.proxy.read_timeout_secs),
        )?;
        let log = ExchangeLog::new(config.log.path.clone(), config.log.max_bytes);

        Ok(Self {
            credentials,
            rewriter: Arc::new(rewriter),
            relay,
            log: Arc::new(log),
            max_request_body_bytes: config.proxy.max_request_body_bytes,
        })
    }
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the proxy server and listen until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        let state = AppState::from_config(&self.config)?;
        let addr: SocketAddr = self.config.listen_addr()?;

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!(
            "Forwarding to {}{} ({} mode)",
            self.config.workspace_url()?,
            self.config.workspace.serving_path,
            self.config.workspace.mode
        );
        tracing::info!("Credential source: {}", state.credentials.name());
        tracing::info!("Exchange log: {}", state.log.path().display());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, create_router(Arc::new(state)))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response<Body> {
    let exchange = Exchange::begin(
        state.log.clone(),
        request.method().as_str(),
        request.uri().path(),
    );
    let span = tracing::info_span!(
        "exchange",
        id = %exchange.id(),
        method = %request.method(),
        path = %request.uri().path()
    );
    handle_exchange(&state, exchange, request)
        .instrument(span)
        .await
}

/// Drive one exchange to a response
///
/// Failures before relaying become local error responses. Streaming
/// responses carry the exchange with them so it is closed when the body
/// finishes, breaks, or is dropped by a departing caller.
async fn handle_exchange(state: &AppState, mut exchange: Exchange, request: Request) -> Response<Body> {
    let request = match ProxyRequest::from_request(request, state.max_request_body_bytes).await {
        Ok(request) => request,
        Err(e) => return fail(exchange, e.into()),
    };

    let credential = match state.credentials.credential().await {
        Ok(credential) => credential,
        Err(e) => return fail(exchange, e.into()),
    };
    exchange.advance(ExchangeState::CredentialResolved);

    let outbound = match state.rewriter.rewrite(request, &credential) {
        Ok(outbound) => outbound,
        Err(e) => return fail(exchange, e.into()),
    };
    exchange.advance(ExchangeState::Rewritten);

    exchange.advance(ExchangeState::Relaying);
    let response = match state.relay.relay(outbound).await {
        Ok(response) => response,
        Err(e) => return fail(exchange, e.into()),
    };

    let status = response.status;
    tracing::debug!(%status, streaming = response.is_streaming(), "Upstream responded");
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
    }

    let body = match response.body {
        ResponseBody::Buffered(bytes) => {
            exchange.complete(status.as_u16());
            Body::from(bytes)
        }
        ResponseBody::Streaming(stream) => {
            Body::from_stream(LoggedStream::new(stream, status.as_u16(), exchange))
        }
    };

    builder.body(body).unwrap_or_else(|e| {
        tracing::error!("Failed to build response: {e}");
        super::error::create_error_response(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            "Failed to build response",
        )
    })
}

fn fail(exchange: Exchange, error: ProxyError) -> Response<Body> {
    exchange.fail_with(&error);
    error.into_response()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
