//! The record contract and the JSON codec.
//!
//! A cacheable type implements [`Recordable`]: it is a serde type with a
//! declared schema version. The codec turns records into self-describing
//! JSON payloads; the payload length is the record's cached byte size on
//! both tiers. Version comparison is exact string equality -- no migration
//! is ever attempted on a version change.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CoreResult;

// ---------------------------------------------------------------------------
// Recordable
// ---------------------------------------------------------------------------

/// Contract for types that can be stored in the tiered cache.
///
/// The cache engine is generic over one registered record type, so the
/// type-identity check the storage layer needs is discharged by the compiler:
/// a `TieredCache<R>` only ever accepts and returns `R`.
///
/// `schema_version` is an opaque string persisted alongside every row. A row
/// whose stored version differs from the currently registered one is treated
/// as a miss and deleted on read.
pub trait Recordable: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// The version string stored with every serialized payload.
    fn schema_version() -> &'static str;
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a record to its self-describing JSON payload.
///
/// # Errors
///
/// Returns [`CoreError::Serialization`](crate::CoreError::Serialization) if
/// the record's `Serialize` implementation fails.
pub fn encode<R: Recordable>(record: &R) -> CoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Deserialize a record from a JSON payload.
///
/// Fails cleanly on corrupt or shape-incompatible payloads; the caller
/// decides whether that is an error or a recoverable miss.
pub fn decode<R: Recordable>(payload: &[u8]) -> CoreResult<R> {
    Ok(serde_json::from_slice(payload)?)
}

/// The cached byte size of a record: the length of its encoded payload.
pub fn encoded_size<R: Recordable>(record: &R) -> CoreResult<u64> {
    Ok(encode(record)?.len() as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
