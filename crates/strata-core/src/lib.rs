//! Strata Core -- record contract, codec, configuration, and clock.
//!
//! This crate defines everything the tiered cache engine consumes but does
//! not own: the [`record::Recordable`] trait that cacheable types implement,
//! the JSON codec that turns records into self-describing payloads, the
//! constructor-time [`config::CacheConfig`], and the [`clock::Clock`] source
//! used for LRU timestamps and TTL arithmetic.
//!
//! The engine emits `tracing` events on its operation paths; installing a
//! subscriber is left to the embedding application.

pub mod clock;
pub mod config;
pub mod record;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Top-level error type for the strata-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration value is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = CoreError::Config("memory_ttl_seconds must be finite".to_string());
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("must be finite"));
    }

    #[test]
    fn serialization_error_from_serde_json() {
        let parse_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err = CoreError::from(parse_err);
        assert!(err.to_string().contains("serialization error"));
    }
}
