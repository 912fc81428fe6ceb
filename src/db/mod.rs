//! Database connection and the catalog adapter
//!
//! The port only depends on the [`Store`] / [`Transaction`] contract; the
//! SQLite implementation lives in [`sqlite`].

pub mod catalog;
pub mod sqlite;
pub mod sqlite_helpers;
pub mod store;

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub use catalog::{Catalog, ColumnMeta, ForeignKey, IdentityMeta, Label, TableMeta};
pub use sqlite::{SqliteStore, SqliteTransaction};
pub use store::{Plan, Row, Store, Transaction};

use crate::config::PortConfig;

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new database connection pool from configuration
    pub async fn connect(config: &PortConfig) -> Result<Self> {
        Self::connect_url(&config.database_url, config.max_connections).await
    }

    /// Connect to a SQLite URL. In-memory databases live and die with their
    /// connection, so they get exactly one that never expires.
    pub async fn connect_url(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL '{}'", url))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = if is_memory_url(url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a batch of DDL statements (schema setup for embedders and tests)
    pub async fn execute_script(&self, script: &str) -> Result<()> {
        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .context("Failed to execute SQL script")?;
        Ok(())
    }
}

pub(crate) fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
