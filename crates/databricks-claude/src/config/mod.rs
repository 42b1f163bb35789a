use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Environment variable carrying a static Databricks token
pub const ENV_DATABRICKS_TOKEN: &str = "DATABRICKS_TOKEN";
/// Environment variable carrying the Anthropic API key
pub const ENV_ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Environment variable carrying the workspace URL
pub const ENV_DATABRICKS_HOST: &str = "DATABRICKS_HOST";
/// Environment variable selecting the routing mode
pub const ENV_MODE: &str = "DATABRICKS_CLAUDE_MODE";
/// Environment variable overriding the listen port
pub const ENV_PORT: &str = "DATABRICKS_CLAUDE_PORT";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Local HTTP listener and upstream client settings
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Databricks workspace and serving endpoint
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Credential sources
    #[serde(default)]
    pub auth: AuthConfig,
    /// Model identifier mapping
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Exchange log file
    #[serde(default)]
    pub log: LogConfig,
}

/// Routing mode selected by the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Platform credential only, coding-agent mode header attached
    Databricks,
    /// Platform credential plus the vendor key
    #[default]
    ClaudeMax,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "databricks" => Ok(Mode::Databricks),
            "claude_max" | "claude-max" => Ok(Mode::ClaudeMax),
            other => Err(Error::Config(format!(
                "Unknown mode '{other}': expected 'databricks' or 'claude_max'"
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Databricks => f.write_str("databricks"),
            Mode::ClaudeMax => f.write_str("claude_max"),
        }
    }
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:8000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum idle time between upstream reads in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Largest JSON request body read for model substitution
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_max_request_body_bytes() -> usize {
    32 * 1024 * 1024
}

/// Workspace and serving endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Databricks workspace URL (e.g., "https://my-ws.cloud.databricks.com")
    #[serde(default)]
    pub host: Option<String>,
    /// Routing mode
    #[serde(default)]
    pub mode: Mode,
    /// Serving endpoint path; `{model}` is replaced by the mapped model
    #[serde(default = "default_serving_path")]
    pub serving_path: String,
    /// Append the inbound path and query to the serving path
    #[serde(default = "default_append_request_path")]
    pub append_request_path: bool,
    /// Headers attached to every outbound request
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            host: None,
            mode: Mode::default(),
            serving_path: default_serving_path(),
            append_request_path: default_append_request_path(),
            extra_headers: BTreeMap::new(),
        }
    }
}

fn default_serving_path() -> String {
    "/serving-endpoints/anthropic".to_string()
}

fn default_append_request_path() -> bool {
    true
}

/// Credential configuration
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// Static Databricks token; skips the CLI OAuth flow when set
    #[serde(default)]
    pub token: Option<String>,
    /// Anthropic API key forwarded in claude_max mode
    #[serde(default)]
    pub vendor_key: Option<String>,
    /// Path or name of the Databricks CLI binary
    #[serde(default = "default_cli_binary")]
    pub cli_binary: String,
    /// Refresh OAuth tokens this many seconds before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
    /// Timeout for `databricks auth token`
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Timeout for the interactive `databricks auth login`
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            vendor_key: None,
            cli_binary: default_cli_binary(),
            refresh_skew_secs: default_refresh_skew_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("vendor_key", &self.vendor_key.as_ref().map(|_| "[REDACTED]"))
            .field("cli_binary", &self.cli_binary)
            .field("refresh_skew_secs", &self.refresh_skew_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("login_timeout_secs", &self.login_timeout_secs)
            .finish()
    }
}

fn default_cli_binary() -> String {
    "databricks".to_string()
}

fn default_refresh_skew_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_login_timeout_secs() -> u64 {
    120
}

/// Model identifier mapping
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Vendor model name -> platform model name
    #[serde(default = "default_models")]
    pub models: BTreeMap<String, String>,
    /// Platform model used when a vendor model has no mapping
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            default_model: None,
        }
    }
}

fn default_models() -> BTreeMap<String, String> {
    [
        ("claude-3-opus", "databricks-claude-opus-4-6"),
        ("claude-opus-4-6", "databricks-claude-opus-4-6"),
        ("claude-opus-4-5", "databricks-claude-opus-4-5"),
        ("claude-opus-4-1", "databricks-claude-opus-4-1"),
        ("claude-sonnet-4-5", "databricks-claude-sonnet-4-5"),
        ("claude-sonnet-4", "databricks-claude-sonnet-4"),
        ("claude-haiku-4-5", "databricks-claude-haiku-4-5"),
    ]
    .into_iter()
    .map(|(vendor, platform)| (vendor.to_string(), platform.to_string()))
    .collect()
}

/// Exchange log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log file path
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Roll the file over once it grows past this size
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            max_bytes: default_log_max_bytes(),
        }
    }
}

/// Directory holding the proxy log and optional config file
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".databricks-claude"))
        .unwrap_or_else(|| PathBuf::from(".databricks-claude"))
}

fn default_log_path() -> PathBuf {
    default_data_dir().join("proxy.log")
}

fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Empty values are treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get(ENV_DATABRICKS_HOST) {
            self.workspace.host = Some(host);
        }
        if let Some(token) = get(ENV_DATABRICKS_TOKEN) {
            self.auth.token = Some(token);
        }
        if let Some(key) = get(ENV_ANTHROPIC_API_KEY) {
            self.auth.vendor_key = Some(key);
        }
        if let Some(mode) = get(ENV_MODE) {
            self.workspace.mode = mode.parse()?;
        }
        if let Some(port) = get(ENV_PORT) {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid {ENV_PORT} '{port}': {e}")))?;
            self.set_port(port)?;
        }
        Ok(())
    }

    /// Replace the port of the listen address, keeping its host
    pub fn set_port(&mut self, port: u16) -> Result<()> {
        let mut addr = self.listen_addr()?;
        addr.set_port(port);
        self.proxy.listen_addr = addr.to_string();
        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.proxy
            .listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address: {e}")))
    }

    /// Normalized workspace URL
    pub fn workspace_url(&self) -> Result<String> {
        self.workspace
            .host
            .as_deref()
            .map(normalize_workspace_url)
            .filter(|url| url != "https://")
            .ok_or_else(|| {
                Error::Config(format!(
                    "No workspace URL configured. Pass --workspace or set {ENV_DATABRICKS_HOST}."
                ))
            })
    }

    /// Check that the configuration can serve requests
    ///
    /// A missing credential is fatal here rather than on each request.
    /// Databricks mode may run on CLI OAuth alone.
    pub fn validate(&self) -> Result<()> {
        self.workspace_url()?;
        self.listen_addr()?;

        let has_token = self.auth.token.as_deref().is_some_and(|t| !t.is_empty());
        let has_vendor_key = self
            .auth
            .vendor_key
            .as_deref()
            .is_some_and(|k| !k.is_empty());

        if self.workspace.mode == Mode::ClaudeMax && !has_vendor_key {
            if !has_token {
                return Err(Error::Config(format!(
                    "Neither {ENV_DATABRICKS_TOKEN} nor {ENV_ANTHROPIC_API_KEY} is set"
                )));
            }
            return Err(Error::Config(format!(
                "claude_max mode requires an Anthropic API key; set {ENV_ANTHROPIC_API_KEY}"
            )));
        }

        Ok(())
    }
}

/// Add an https scheme when missing and strip trailing slashes
pub fn normalize_workspace_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}
