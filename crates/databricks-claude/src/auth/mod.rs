//! Platform session credentials
//!
//! The proxy core only sees [`CredentialSource`]. A static token is returned
//! verbatim; otherwise [`RefreshingTokenSource`] caches an OAuth token
//! obtained through a [`TokenFetcher`] (normally the Databricks CLI) and
//! refreshes it when it goes stale.

mod credential;
mod databricks_cli;
mod refreshing;

pub use credential::{CredentialKind, SessionCredential};
pub use databricks_cli::{DatabricksCli, parse_token_output};
pub use refreshing::{FetchedToken, RefreshingTokenSource, TokenFetcher};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;

/// Errors raised while resolving the platform session credential
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The external auth tool reports no usable session
    #[error("No valid Databricks session: {0}")]
    NoSession(String),

    /// The interactive login flow failed or timed out
    #[error("Databricks login failed: {0}")]
    LoginFailed(String),

    /// The external auth tool could not be launched
    #[error("Databricks CLI unavailable: {0}")]
    Unavailable(String),

    /// Token fetch still failed after a successful login
    #[error("Token fetch failed after login: {0}")]
    Exhausted(String),
}

/// Source of the platform session credential
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Return a credential that is valid right now
    async fn credential(&self) -> Result<SessionCredential, AuthError>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// Credential source for a token supplied through config or environment
pub struct StaticTokenSource {
    credential: SessionCredential,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: SessionCredential::static_token(token),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticTokenSource {
    async fn credential(&self) -> Result<SessionCredential, AuthError> {
        Ok(self.credential.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Build the credential source described by the configuration
///
/// A non-empty static token wins; otherwise tokens come from the
/// Databricks CLI for the configured workspace.
pub fn credential_source(config: &Config) -> crate::error::Result<Arc<dyn CredentialSource>> {
    if let Some(token) = config.auth.token.as_deref().filter(|t| !t.is_empty()) {
        tracing::info!("Using static Databricks token");
        return Ok(Arc::new(StaticTokenSource::new(token)));
    }

    let host = config.workspace_url()?;
    tracing::info!("Using Databricks CLI OAuth for {host}");

    let cli = DatabricksCli::new(config.auth.cli_binary.clone(), host)
        .with_fetch_timeout(Duration::from_secs(config.auth.fetch_timeout_secs))
        .with_login_timeout(Duration::from_secs(config.auth.login_timeout_secs));

    Ok(Arc::new(RefreshingTokenSource::new(
        Arc::new(cli),
        Duration::from_secs(config.auth.refresh_skew_secs),
    )))
}
