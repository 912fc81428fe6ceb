//! Port configuration management

use std::env;

use anyhow::{Context, Result, anyhow};

use crate::port::constraint::OutputFormat;
use crate::port::patch::ConflictPolicy;

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// SQLite URL (`sqlite::memory:`, `sqlite://data/port.db`, ...)
    pub database_url: String,

    /// Maximum pool size for file-backed databases
    pub max_connections: u32,

    /// Which old-side fields the recover step checks against stored state
    pub conflict_policy: ConflictPolicy,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Output format when a request does not negotiate one
    pub default_format: OutputFormat,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 10,
            conflict_policy: ConflictPolicy::default(),
            log_json: false,
            default_format: OutputFormat::default(),
        }
    }
}

impl PortConfig {
    /// Load configuration from environment variables (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.parse().context("Invalid DATABASE_MAX_CONNECTIONS")?,
            None => defaults.max_connections,
        };

        let conflict_policy = match lookup("PORT_CONFLICT_POLICY") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow!("Invalid PORT_CONFLICT_POLICY '{}'", raw))?,
            None => defaults.conflict_policy,
        };

        let default_format = match lookup("PORT_DEFAULT_FORMAT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow!("Invalid PORT_DEFAULT_FORMAT '{}'", raw))?,
            None => defaults.default_format,
        };

        Ok(Self {
            database_url,
            max_connections,
            conflict_policy,
            log_json: lookup("PORT_LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            default_format,
        })
    }
}
