//! Databricks CLI adapter for the OAuth flow
//!
//! `databricks auth token --host <ws>` prints the cached OAuth token as JSON;
//! `databricks auth login --host <ws>` opens a browser and blocks until the
//! user finishes signing in.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;

use super::{AuthError, FetchedToken, TokenFetcher};

/// Lifetime assumed when the CLI does not report an expiry
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Token fetcher backed by the `databricks` binary
#[derive(Debug, Clone)]
pub struct DatabricksCli {
    binary: String,
    host: String,
    fetch_timeout: Duration,
    login_timeout: Duration,
}

impl DatabricksCli {
    pub fn new(binary: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: host.into(),
            fetch_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["auth", subcommand, "--host", &self.host])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TokenFetcher for DatabricksCli {
    async fn fetch_token(&self) -> Result<FetchedToken, AuthError> {
        let mut cmd = self.command("token");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.fetch_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AuthError::Unavailable(format!(
                    "failed to run '{}': {e}",
                    self.binary
                )));
            }
            Err(_) => {
                return Err(AuthError::NoSession(format!(
                    "'{} auth token' timed out after {}s",
                    self.binary,
                    self.fetch_timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::NoSession(format!(
                "'{} auth token' exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        parse_token_output(&String::from_utf8_lossy(&output.stdout), Utc::now())
    }

    async fn login(&self) -> Result<(), AuthError> {
        tracing::info!(
            "Launching '{} auth login --host {}'; a browser window will open",
            self.binary,
            self.host
        );

        // Inherit stdout/stderr so the user sees the CLI's login prompts.
        let mut cmd = self.command("login");
        let status = match tokio::time::timeout(self.login_timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AuthError::Unavailable(format!(
                    "failed to run '{}': {e}",
                    self.binary
                )));
            }
            Err(_) => {
                return Err(AuthError::LoginFailed(format!(
                    "timed out after {}s",
                    self.login_timeout.as_secs()
                )));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(AuthError::LoginFailed(format!("exited with {status}")))
        }
    }
}

#[derive(Deserialize)]
struct TokenOutput {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expiry: Option<serde_json::Value>,
}

/// Parse the JSON printed by `databricks auth token`
///
/// `expiry` may be an RFC 3339 string or unix seconds; when it is absent or
/// unreadable the token is assumed to live for one hour from `now`.
pub fn parse_token_output(stdout: &str, now: DateTime<Utc>) -> Result<FetchedToken, AuthError> {
    let output: TokenOutput = serde_json::from_str(stdout)
        .map_err(|e| AuthError::NoSession(format!("unreadable token output: {e}")))?;

    let access_token = output
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::NoSession("token output has no access_token".to_string()))?;

    let expires_at = output
        .expiry
        .as_ref()
        .and_then(parse_expiry)
        .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    Ok(FetchedToken {
        access_token,
        expires_at,
    })
}

fn parse_expiry(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64().filter(|s| *s > 0.0)?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        _ => None,
    }
}
