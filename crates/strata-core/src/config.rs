//! Constructor-time configuration for the tiered cache.
//!
//! Every budget is independent: each tier has its own count, byte, and TTL
//! limit, and `max_item_size_bytes` routes large items past the memory tier
//! entirely. There is no file or environment layer -- the engine is a
//! library and takes its whole configuration at construction.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Reserved `db_path` value selecting an ephemeral in-memory store.
pub const MEMORY_DB_PATH: &str = ":memory:";

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 256;

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Configuration for one cache engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Filesystem path of the SQLite database, or [`MEMORY_DB_PATH`].
    pub db_path: String,
    /// Memory tier count budget.
    pub max_memory_items: u64,
    /// Memory tier byte budget.
    pub max_memory_size_bytes: u64,
    /// Disk tier count budget.
    pub max_disk_items: u64,
    /// Disk tier byte budget. Items larger than this are rejected outright.
    pub max_disk_size_bytes: u64,
    /// Sliding TTL for memory entries, in seconds.
    pub memory_ttl_seconds: f64,
    /// Sliding TTL for disk rows, in seconds.
    pub disk_ttl_seconds: f64,
    /// Items whose encoded size exceeds this are stored disk-only.
    pub max_item_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: MEMORY_DB_PATH.to_string(),
            max_memory_items: 10_000,
            max_memory_size_bytes: 64 * 1024 * 1024,
            max_disk_items: 100_000,
            max_disk_size_bytes: 1024 * 1024 * 1024,
            memory_ttl_seconds: 3600.0,
            disk_ttl_seconds: 86_400.0,
            max_item_size_bytes: 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Returns `true` if `db_path` selects the ephemeral in-memory store.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.db_path == MEMORY_DB_PATH
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if `db_path` is empty or a TTL is
    /// negative or non-finite.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.db_path.is_empty() {
            return Err(CoreError::Config("db_path cannot be empty".to_string()));
        }

        for (name, ttl) in [
            ("memory_ttl_seconds", self.memory_ttl_seconds),
            ("disk_ttl_seconds", self.disk_ttl_seconds),
        ] {
            if !ttl.is_finite() {
                return Err(CoreError::Config(format!("{name} must be finite")));
            }
            if ttl < 0.0 {
                return Err(CoreError::Config(format!(
                    "{name} must be non-negative, got {ttl}"
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
