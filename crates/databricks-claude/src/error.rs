//! Error types for databricks-claude

use thiserror::Error;

/// Main error type for startup and server operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (missing credentials, bad addresses, unreadable files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential resolution errors surfaced outside a request
    #[error("Auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// Proxy/HTTP server errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for databricks-claude operations
pub type Result<T> = std::result::Result<T, Error>;
