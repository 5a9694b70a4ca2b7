//! Block manager settings.

use config::Config;
use std::path::PathBuf;
use tracing::info;

const DEFAULT_DB_PATH: &str = "telamon-blocks.db";
const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Settings for a [`BlockManager`](crate::BlockManager).
#[derive(Debug, Clone)]
pub struct BlockManagerConfig {
    /// Directory of the block store keyspace.
    pub db_path: PathBuf,
    /// Capacity of the finalized-block LRU cache.
    pub cache_capacity: usize,
}

impl BlockManagerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), cache_capacity: DEFAULT_CACHE_CAPACITY }
    }

    /// Read settings, falling back to defaults key by key.
    pub fn from_config(config: &Config) -> Self {
        let db_path = config.get_string("db-path").unwrap_or(DEFAULT_DB_PATH.to_string());
        info!("Using block store at '{db_path}'");

        let cache_capacity =
            config.get_int("cache-capacity").unwrap_or(DEFAULT_CACHE_CAPACITY as i64) as usize;

        Self { db_path: db_path.into(), cache_capacity }
    }
}
