//! databricks-claude-proxy - local proxy between Claude Code and Databricks

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use databricks_claude::config::{Config, Mode};
use databricks_claude::error::{Error, Result};
use databricks_claude::proxy::ProxyServer;

/// Forward Claude Code traffic to a Databricks serving endpoint
#[derive(Parser)]
#[command(name = "databricks-claude-proxy")]
#[command(about = "Local proxy that routes Claude Code requests through Databricks")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Databricks workspace URL
    #[arg(long, short = 'w', global = true)]
    pub workspace: Option<String>,

    /// Routing mode: claude_max or databricks
    #[arg(long, global = true)]
    pub mode: Option<Mode>,

    /// Port to listen on
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// Exchange log file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            let config = resolve_config(&cli)?;
            ProxyServer::new(config).serve().await
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,databricks_claude=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file, then environment, then command-line flags
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = load_config(cli.config.as_ref())?;
    config.apply_env()?;

    if let Some(workspace) = &cli.workspace {
        config.workspace.host = Some(workspace.clone());
    }
    if let Some(mode) = cli.mode {
        config.workspace.mode = mode;
    }
    if let Some(port) = cli.port {
        config.set_port(port)?;
    }
    if let Some(log_file) = &cli.log_file {
        config.log.path = log_file.clone();
    }

    tracing::debug!("Config resolved: {:?}", config);
    config.validate()?;
    Ok(config)
}

fn load_config(config_path: Option<&PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        return read_config(path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".databricks-claude").join("config.toml")),
        dirs::config_dir().map(|c| c.join("databricks-claude").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn read_config(path: &PathBuf) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml(&content)
}
