//! Error handling for proxied exchanges
//!
//! Every failure maps to a local status and a JSON error envelope shaped
//! like the vendor API's, so the agent CLI reports it instead of hanging:
//! - Auth errors: 401
//! - Routing errors: 400
//! - Upstream status errors: the upstream status and headers; a vendor error
//!   envelope is passed through as is, any other body becomes the message
//! - Upstream timeouts: 504, other transport failures: 502

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use thiserror::Error;

use super::relay::UpstreamError;
use super::rewrite::RoutingError;
use crate::auth::AuthError;

/// Errors that end an exchange before the response starts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ProxyError {
    /// Status returned to the caller
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Routing(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(UpstreamError::Status { status, .. }) => *status,
            ProxyError::Upstream(UpstreamError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "auth_error",
            ProxyError::Routing(_) => "routing_error",
            ProxyError::Upstream(e) => e.kind(),
        }
    }

    /// Human-readable message for the error envelope
    pub fn message(&self) -> String {
        match self {
            ProxyError::Upstream(UpstreamError::Status { body, .. }) if !body.is_empty() => {
                body.clone()
            }
            _ => self.to_string(),
        }
    }

    /// Convert to an HTTP response for the caller
    pub fn into_response(self) -> Response<Body> {
        let ProxyError::Upstream(UpstreamError::Status {
            status,
            headers,
            body,
        }) = &self
        else {
            return create_error_response(self.status(), self.category(), &self.message());
        };

        let mut response = if is_error_envelope(body) {
            let mut response = Response::new(Body::from(body.clone()));
            *response.status_mut() = *status;
            response
        } else {
            create_error_response(*status, self.category(), &self.message())
        };
        response.headers_mut().extend(headers.clone());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        self.into_response()
    }
}

/// Whether an upstream body already has the vendor's `{"type":"error",...}` shape
fn is_error_envelope(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .map(|json| json["type"] == "error" && json["error"].is_object())
        .unwrap_or(false)
}

/// Create a JSON error response
pub fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
            "code": status.as_u16(),
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
