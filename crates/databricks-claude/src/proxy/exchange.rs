//! Per-exchange lifecycle
//!
//! An [`Exchange`] follows one inbound request through
//! `Accepted -> CredentialResolved -> Rewritten -> Relaying` and ends in
//! `Completed` or `Failed`. It writes exactly one [`LogRecord`] when it
//! ends, including when it is dropped because the caller went away.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::Stream;
use uuid::Uuid;

use super::error::ProxyError;
use super::relay::UpstreamError;
use crate::exchange_log::{ExchangeLog, LogRecord, Outcome};

/// Lifecycle state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Accepted,
    CredentialResolved,
    Rewritten,
    Relaying,
    Completed,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Failed)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeState::Accepted => "accepted",
            ExchangeState::CredentialResolved => "credential_resolved",
            ExchangeState::Rewritten => "rewritten",
            ExchangeState::Relaying => "relaying",
            ExchangeState::Completed => "completed",
            ExchangeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One request/response cycle
pub struct Exchange {
    id: Uuid,
    method: String,
    path: String,
    started: Instant,
    timestamp: chrono::DateTime<Utc>,
    state: ExchangeState,
    log: Arc<ExchangeLog>,
}

impl Exchange {
    pub fn begin(log: Arc<ExchangeLog>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            started: Instant::now(),
            timestamp: Utc::now(),
            state: ExchangeState::Accepted,
            log,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Move to the next non-terminal state
    pub fn advance(&mut self, next: ExchangeState) {
        debug_assert!(!next.is_terminal());
        tracing::trace!(exchange = %self.id, from = %self.state, to = %next, "Exchange state");
        self.state = next;
    }

    /// The response was fully relayed
    pub fn complete(mut self, status: u16) {
        self.finish(ExchangeState::Completed, Outcome::Status(status));
    }

    /// The exchange failed; `status` is what the caller received, if anything
    pub fn fail(mut self, kind: &'static str, status: Option<u16>, detail: impl Into<String>) {
        self.finish(
            ExchangeState::Failed,
            Outcome::Error {
                kind,
                status,
                detail: detail.into(),
            },
        );
    }

    /// Fail with the local response `error` produces
    pub fn fail_with(self, error: &ProxyError) {
        self.fail(error.category(), Some(error.status().as_u16()), error.to_string());
    }

    fn finish(&mut self, state: ExchangeState, outcome: Outcome) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;

        let duration_ms = self.started.elapsed().as_millis();
        match &outcome {
            Outcome::Status(status) => {
                tracing::info!(exchange = %self.id, status, duration_ms, "Exchange completed");
            }
            Outcome::Error { kind, status, .. } => {
                tracing::warn!(exchange = %self.id, kind, ?status, duration_ms, "Exchange failed");
            }
        }

        self.log.record(&LogRecord {
            timestamp: self.timestamp,
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            outcome,
            duration_ms,
        });
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            let detail = if self.state == ExchangeState::Relaying {
                "caller disconnected during relay"
            } else {
                "caller disconnected before relay"
            };
            self.finish(
                ExchangeState::Failed,
                Outcome::Error {
                    kind: "cancelled",
                    status: None,
                    detail: detail.to_string(),
                },
            );
        }
    }
}

/// Response stream that closes its exchange when it ends
///
/// Chunks pass through unchanged. End of stream completes the exchange, an
/// upstream error fails it, and dropping the stream early (client
/// disconnect) records a cancellation and drops the upstream body with it.
pub struct LoggedStream<S>
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
{
    inner: S,
    status: u16,
    exchange: Option<Exchange>,
}

impl<S> LoggedStream<S>
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
{
    pub fn new(inner: S, status: u16, exchange: Exchange) -> Self {
        Self {
            inner,
            status,
            exchange: Some(exchange),
        }
    }
}

impl<S> Stream for LoggedStream<S>
where
    S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
{
    type Item = Result<Bytes, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.exchange.is_none() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(e))) => {
                if let Some(exchange) = this.exchange.take() {
                    exchange.fail(e.kind(), Some(this.status), e.to_string());
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(exchange) = this.exchange.take() {
                    exchange.complete(this.status);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
