//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use crate::relational::Dialect;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relational database URL. Relational queries are unavailable without it.
    pub database_url: Option<String>,

    /// Dialect compiled SQL is rendered for (default: postgres).
    pub sql_dialect: Dialect,

    /// Base URL of the catalog's REST interface.
    pub catalog_url: Option<String>,

    /// Session id used for catalog queries.
    pub catalog_session_id: Option<String>,

    /// Count used when a catalog query has a skip but no limit (default: 10000).
    pub catalog_max_entities: u64,

    /// Search mapping file. When None, the bundled mapping is used.
    pub search_mapping_path: Option<PathBuf>,

    /// Cap on each record's to-many include list (default: 1000).
    pub include_child_limit: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").ok();

        let sql_dialect = match env::var("SQL_DIALECT") {
            Ok(raw) => raw
                .parse()
                .map_err(|e: String| anyhow!(e))
                .context("SQL_DIALECT must be postgres or sqlite")?,
            Err(_) => database_url
                .as_deref()
                .filter(|url| url.starts_with("sqlite:"))
                .map_or(Dialect::Postgres, |_| Dialect::Sqlite),
        };

        let catalog_url = env::var("CATALOG_URL").ok();
        let catalog_session_id = env::var("CATALOG_SESSION_ID").ok();

        let catalog_max_entities = env::var("CATALOG_MAX_ENTITIES")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .context("CATALOG_MAX_ENTITIES must be a valid u64")?;

        let search_mapping_path = env::var("SEARCH_MAPPING_PATH").ok().map(PathBuf::from);

        let include_child_limit = env::var("INCLUDE_CHILD_LIMIT")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("INCLUDE_CHILD_LIMIT must be a valid u64")?;

        Ok(Self {
            database_url,
            sql_dialect,
            catalog_url,
            catalog_session_id,
            catalog_max_entities,
            search_mapping_path,
            include_child_limit,
        })
    }
}
