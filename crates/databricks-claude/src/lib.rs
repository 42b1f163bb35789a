//! databricks-claude - local forwarding proxy for Claude Code on Databricks
//!
//! The proxy sits between an unmodified coding-agent CLI and a Databricks
//! serving endpoint. Each request is rewritten to carry both the platform
//! session credential and the vendor API key, then relayed back to the
//! caller, streaming event-stream responses chunk by chunk.

pub mod auth;
pub mod config;
pub mod error;
pub mod exchange_log;
pub mod proxy;

pub use error::Error;
