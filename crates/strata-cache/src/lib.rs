//! Strata Cache -- a two-tier record cache over an embedded SQLite store.
//!
//! Typed, schema-versioned records live in a fast in-memory index backed by
//! a SQLite blob store on disk. Writes go through to disk; reads promote
//! disk hits back into memory. Each tier enforces its own count, byte, and
//! sliding-TTL budgets with deterministic LRU eviction, and disk evictions
//! cascade to the memory tier so memory never outlives disk.

pub mod engine;
pub mod memory;
pub mod policy;
pub mod store;

pub use engine::{CacheStats, TieredCache};
pub use strata_core::config::CacheConfig;
pub use strata_core::record::Recordable;

// ---------------------------------------------------------------------------
// CacheError
// ---------------------------------------------------------------------------

/// Error type for cache operations.
///
/// Read-path infrastructure faults (undecodable rows, schema mismatches,
/// TTL expiry) are recovered internally as delete-and-miss and never appear
/// here; everything below is either a client fault or a surfaced database
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is empty or exceeds the maximum length.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The same key appears more than once in a batch.
    #[error("duplicate key in batch: {0:?}")]
    DuplicateKey(String),

    /// The encoded record does not fit the disk tier at all.
    #[error("item size ({size} bytes) exceeds max_disk_size_bytes ({max} bytes)")]
    ItemTooLarge { size: u64, max: u64 },

    /// The configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A record could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store raised; always surfaced, never partially applied.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation invoked after `close()`.
    #[error("cache is closed")]
    Closed,
}

/// Convenience alias for `Result<T, CacheError>`.
pub type CacheResult<T> = Result<T, CacheError>;
