//! The two-tier coordinator.
//!
//! [`TieredCache`] is the front door. It orders every operation across the
//! two tiers:
//!
//! 1. **Write-through** on `put`: the row always lands on disk; it also
//!    lands in memory unless its encoded size crosses the disk-only
//!    threshold.
//! 2. **Read-through with promotion** on `get`: memory first, then disk; a
//!    disk hit is promoted back into memory unless oversized.
//! 3. **Cascading eviction**: when the disk policy drops a key, the key is
//!    removed from memory in the same operation, so memory never outlives
//!    disk.
//!
//! Every operation that touches time reads the clock once at entry (or takes
//! an explicit timestamp via its `*_at` form) and uses that one value for
//! all TTL checks and LRU refreshes in the call.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use strata_cache::{CacheConfig, TieredCache};
//! use strata_core::record::Recordable;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Session {
//!     user: String,
//!     token: String,
//! }
//!
//! impl Recordable for Session {
//!     fn schema_version() -> &'static str {
//!         "1.0.0"
//!     }
//! }
//!
//! let cache: TieredCache<Session> = TieredCache::open(CacheConfig::default()).unwrap();
//! let session = Session { user: "ada".into(), token: "tok-1".into() };
//! cache.put("sess-1", &session).unwrap();
//! assert_eq!(cache.get("sess-1").unwrap(), Some(session));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use strata_core::clock::{Clock, SystemClock};
use strata_core::config::{CacheConfig, MAX_KEY_LEN};
use strata_core::record::{self, Recordable};

use crate::memory::MemoryIndex;
use crate::policy::{self, TierLimits};
use crate::store::{DiskStore, UpsertRow};
use crate::{CacheError, CacheResult};

// ---------------------------------------------------------------------------
// CacheStats
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of the engine's statistics.
///
/// All fields except the two `current_*` gauges are cumulative and survive
/// [`TieredCache::clear`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_evictions: u64,
    pub disk_evictions: u64,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_deletes: u64,
    /// Gauge: entries currently resident in memory.
    pub current_memory_items: u64,
    /// Gauge: rows currently on disk.
    pub current_disk_items: u64,
}

/// Cumulative counters, guarded by the same lock as the tier state.
#[derive(Debug, Default)]
struct Counters {
    memory_hits: u64,
    disk_hits: u64,
    misses: u64,
    memory_evictions: u64,
    disk_evictions: u64,
    total_puts: u64,
    total_gets: u64,
    total_deletes: u64,
}

// ---------------------------------------------------------------------------
// TieredCache
// ---------------------------------------------------------------------------

/// State protected by the engine lock. `store` becomes `None` after
/// `close()`; every later operation observes that and fails.
struct Inner<R> {
    memory: MemoryIndex<R>,
    store: Option<DiskStore>,
    counters: Counters,
}

/// Outcome of probing the memory tier for one key.
enum MemoryProbe<R> {
    Fresh(R),
    Expired,
    Absent,
}

/// The two-tier cache engine for one registered record type.
pub struct TieredCache<R: Recordable> {
    config: CacheConfig,
    clock: Box<dyn Clock>,
    inner: Mutex<Inner<R>>,
}

impl<R: Recordable> TieredCache<R> {
    /// Open the engine with the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] for an invalid configuration and
    /// [`CacheError::Database`]/[`CacheError::Io`] if the store cannot be
    /// opened.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Open the engine with an injected clock source.
    pub fn with_clock(config: CacheConfig, clock: impl Clock + 'static) -> CacheResult<Self> {
        config
            .validate()
            .map_err(|e| CacheError::Config(e.to_string()))?;

        let store = if config.is_ephemeral() {
            DiskStore::in_memory()?
        } else {
            DiskStore::open(&config.db_path)?
        };

        info!(
            db_path = %config.db_path,
            schema_version = R::schema_version(),
            "tiered cache opened"
        );

        Ok(Self {
            config,
            clock: Box::new(clock),
            inner: Mutex::new(Inner {
                memory: MemoryIndex::new(),
                store: Some(store),
                counters: Counters::default(),
            }),
        })
    }

    /// The configuration this engine was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Single-key operations
    // -----------------------------------------------------------------------

    /// Store a record under `key`, stamping it with the current clock time.
    pub fn put(&self, key: &str, value: &R) -> CacheResult<()> {
        self.put_at(key, value, self.clock.now())
    }

    /// Store a record under `key` with an explicit timestamp.
    pub fn put_at(&self, key: &str, value: &R, ts: f64) -> CacheResult<()> {
        validate_key(key)?;
        let payload = record::encode(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let byte_size = payload.len() as u64;
        if byte_size > self.config.max_disk_size_bytes {
            return Err(CacheError::ItemTooLarge {
                size: byte_size,
                max: self.config.max_disk_size_bytes,
            });
        }

        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;

        store.upsert(UpsertRow {
            key,
            payload: &payload,
            byte_size,
            last_access_ts: ts,
            schema_version: R::schema_version(),
        })?;

        if byte_size <= self.config.max_item_size_bytes {
            memory.insert(key.to_string(), value.clone(), byte_size, ts, R::schema_version());
        } else {
            // Disk-only item; drop any smaller predecessor from memory.
            memory.remove(key);
            trace!(key, byte_size, "item routed disk-only");
        }

        self.enforce_memory_budget(memory, counters);
        self.enforce_disk_budget(store, memory, counters)?;
        counters.total_puts += 1;
        trace!(key, byte_size, "put");
        Ok(())
    }

    /// Retrieve the record stored under `key`, using the current clock time
    /// for TTL checks and LRU refresh.
    pub fn get(&self, key: &str) -> CacheResult<Option<R>> {
        self.get_at(key, self.clock.now())
    }

    /// Retrieve the record stored under `key` with an explicit timestamp.
    pub fn get_at(&self, key: &str, ts: f64) -> CacheResult<Option<R>> {
        validate_key(key)?;
        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;
        counters.total_gets += 1;

        match probe_memory(memory, key, ts, self.config.memory_ttl_seconds) {
            MemoryProbe::Fresh(found) => {
                memory.touch(key, ts);
                // Keep the disk row's timestamp in sync so the two tiers
                // agree on recency.
                store.touch(key, ts)?;
                counters.memory_hits += 1;
                trace!(key, "memory hit");
                return Ok(Some(found));
            }
            MemoryProbe::Expired => {
                memory.remove(key);
                trace!(key, "memory entry expired");
            }
            MemoryProbe::Absent => {}
        }

        let Some(row) = store.fetch(key)? else {
            counters.misses += 1;
            trace!(key, "miss");
            return Ok(None);
        };

        if policy::is_expired(ts, row.last_access_ts, self.config.disk_ttl_seconds) {
            store.delete(key)?;
            counters.misses += 1;
            trace!(key, "disk entry expired");
            return Ok(None);
        }

        if row.schema_version != R::schema_version() {
            store.delete(key)?;
            counters.misses += 1;
            trace!(
                key,
                stored = %row.schema_version,
                current = R::schema_version(),
                "schema version mismatch"
            );
            return Ok(None);
        }

        let found: R = match record::decode(&row.payload) {
            Ok(found) => found,
            Err(e) => {
                store.delete(key)?;
                counters.misses += 1;
                warn!(key, error = %e, "dropping undecodable row");
                return Ok(None);
            }
        };

        store.touch(key, ts)?;
        if row.byte_size <= self.config.max_item_size_bytes {
            memory.insert(key.to_string(), found.clone(), row.byte_size, ts, R::schema_version());
            self.enforce_memory_budget(memory, counters);
        }
        counters.disk_hits += 1;
        trace!(key, "disk hit");
        Ok(Some(found))
    }

    /// Remove the record stored under `key` from both tiers. Absent keys
    /// are silently ignored.
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;

        store.delete(key)?;
        memory.remove(key);
        counters.total_deletes += 1;
        trace!(key, "delete");
        Ok(())
    }

    /// Whether `key` is present in either tier. A pure presence probe: no
    /// TTL evaluation and no timestamp refresh.
    pub fn exists(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        let mut guard = self.lock();
        let (memory, store, _) = open_parts(&mut guard)?;

        if memory.contains(key) {
            return Ok(true);
        }
        store.contains(key)
    }

    // -----------------------------------------------------------------------
    // Batch operations
    // -----------------------------------------------------------------------

    /// Retrieve many records at once, stamping TTL checks with the current
    /// clock time.
    pub fn get_many(&self, keys: &[&str]) -> CacheResult<HashMap<String, R>> {
        self.get_many_at(keys, self.clock.now())
    }

    /// Batched read with an explicit timestamp. Missing keys are omitted
    /// from the result. Unlike [`get_at`](Self::get_at), a batched read is
    /// read-only with respect to LRU state: it never refreshes
    /// `last_access_ts` and never promotes disk hits into memory.
    pub fn get_many_at(&self, keys: &[&str], ts: f64) -> CacheResult<HashMap<String, R>> {
        for key in keys {
            validate_key(key)?;
        }

        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;
        counters.total_gets += keys.len() as u64;

        let mut found = HashMap::new();
        let mut disk_keys: Vec<&str> = Vec::new();
        for &key in keys {
            match probe_memory(memory, key, ts, self.config.memory_ttl_seconds) {
                MemoryProbe::Fresh(value) => {
                    found.insert(key.to_string(), value);
                    counters.memory_hits += 1;
                }
                MemoryProbe::Expired => {
                    memory.remove(key);
                    disk_keys.push(key);
                }
                MemoryProbe::Absent => disk_keys.push(key),
            }
        }

        if disk_keys.is_empty() {
            return Ok(found);
        }

        let fetched: HashMap<String, _> = store.fetch_many(&disk_keys)?.into_iter().collect();
        let mut stale: Vec<&str> = Vec::new();
        for &key in &disk_keys {
            let Some(row) = fetched.get(key) else {
                counters.misses += 1;
                continue;
            };

            if policy::is_expired(ts, row.last_access_ts, self.config.disk_ttl_seconds) {
                stale.push(key);
                counters.misses += 1;
                continue;
            }
            if row.schema_version != R::schema_version() {
                stale.push(key);
                counters.misses += 1;
                continue;
            }
            match record::decode::<R>(&row.payload) {
                Ok(value) => {
                    found.insert(key.to_string(), value);
                    counters.disk_hits += 1;
                }
                Err(e) => {
                    stale.push(key);
                    counters.misses += 1;
                    warn!(key, error = %e, "dropping undecodable row");
                }
            }
        }

        if !stale.is_empty() {
            store.delete_many(&stale)?;
            trace!(count = stale.len(), "dropped stale rows during batched read");
        }
        Ok(found)
    }

    /// Store many records atomically, stamping them with the current clock
    /// time.
    pub fn put_many(&self, items: &[(String, R)]) -> CacheResult<()> {
        self.put_many_at(items, self.clock.now())
    }

    /// Atomic batched write with an explicit timestamp.
    ///
    /// All keys are validated and all records encoded before any state
    /// changes; any failure aborts the whole batch. The disk rows land in a
    /// single transaction, and each eviction policy runs once for the batch
    /// rather than once per item.
    pub fn put_many_at(&self, items: &[(String, R)], ts: f64) -> CacheResult<()> {
        let mut seen = HashSet::new();
        for (key, _) in items {
            validate_key(key)?;
            if !seen.insert(key.as_str()) {
                return Err(CacheError::DuplicateKey(key.clone()));
            }
        }

        let mut encoded: Vec<(Vec<u8>, u64)> = Vec::with_capacity(items.len());
        for (key, value) in items {
            let payload =
                record::encode(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
            let byte_size = payload.len() as u64;
            if byte_size > self.config.max_disk_size_bytes {
                trace!(key = %key, byte_size, "batch aborted by oversized item");
                return Err(CacheError::ItemTooLarge {
                    size: byte_size,
                    max: self.config.max_disk_size_bytes,
                });
            }
            encoded.push((payload, byte_size));
        }

        if items.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;

        let rows: Vec<UpsertRow<'_>> = items
            .iter()
            .zip(&encoded)
            .map(|((key, _), (payload, byte_size))| UpsertRow {
                key,
                payload,
                byte_size: *byte_size,
                last_access_ts: ts,
                schema_version: R::schema_version(),
            })
            .collect();
        store.upsert_many(&rows)?;

        for ((key, value), (_, byte_size)) in items.iter().zip(&encoded) {
            if *byte_size <= self.config.max_item_size_bytes {
                memory.insert(key.clone(), value.clone(), *byte_size, ts, R::schema_version());
            } else {
                memory.remove(key);
            }
        }

        self.enforce_memory_budget(memory, counters);
        self.enforce_disk_budget(store, memory, counters)?;
        counters.total_puts += items.len() as u64;
        trace!(count = items.len(), "put_many");
        Ok(())
    }

    /// Remove many records: one disk transaction, then the memory rows.
    /// Absent keys are silently ignored.
    pub fn delete_many(&self, keys: &[&str]) -> CacheResult<()> {
        for key in keys {
            validate_key(key)?;
        }

        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;

        store.delete_many(keys)?;
        for key in keys {
            memory.remove(key);
        }
        counters.total_deletes += keys.len() as u64;
        trace!(count = keys.len(), "delete_many");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Whole-cache operations
    // -----------------------------------------------------------------------

    /// Remove every entry from both tiers. Cumulative statistics are
    /// retained; the current-state gauges drop to zero.
    pub fn clear(&self) -> CacheResult<()> {
        let mut guard = self.lock();
        let (memory, store, _) = open_parts(&mut guard)?;

        memory.clear();
        store.clear()?;
        info!("cache cleared");
        Ok(())
    }

    /// Total number of unique records (every memory entry also has a disk
    /// row, so this is the disk count).
    pub fn get_count(&self) -> CacheResult<u64> {
        let mut guard = self.lock();
        let (_, store, _) = open_parts(&mut guard)?;
        store.count()
    }

    /// Total byte size of all records on disk.
    pub fn get_total_size(&self) -> CacheResult<u64> {
        let mut guard = self.lock();
        let (_, store, _) = open_parts(&mut guard)?;
        store.total_bytes()
    }

    /// Snapshot the statistics counters and gauges.
    pub fn get_stats(&self) -> CacheResult<CacheStats> {
        let mut guard = self.lock();
        let (memory, store, counters) = open_parts(&mut guard)?;

        Ok(CacheStats {
            memory_hits: counters.memory_hits,
            disk_hits: counters.disk_hits,
            misses: counters.misses,
            memory_evictions: counters.memory_evictions,
            disk_evictions: counters.disk_evictions,
            total_puts: counters.total_puts,
            total_gets: counters.total_gets,
            total_deletes: counters.total_deletes,
            current_memory_items: memory.len(),
            current_disk_items: store.count()?,
        })
    }

    /// Release the disk handle and drop the memory tier. Idempotent; every
    /// operation after the first `close` fails with [`CacheError::Closed`].
    pub fn close(&self) -> CacheResult<()> {
        let mut guard = self.lock();
        guard.memory.clear();
        if let Some(store) = guard.store.take() {
            store.close()?;
            info!("tiered cache closed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        // Recover the guard if a previous holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evict from memory until its count and byte budgets hold.
    fn enforce_memory_budget(&self, memory: &mut MemoryIndex<R>, counters: &mut Counters) {
        let victims = policy::plan_evictions(
            &memory.candidates(),
            TierLimits {
                max_items: self.config.max_memory_items,
                max_bytes: self.config.max_memory_size_bytes,
            },
        );
        for key in victims {
            memory.remove(&key);
            counters.memory_evictions += 1;
            debug!(key = %key, "evicted from memory");
        }
    }

    /// Evict from disk until its budgets hold, cascading every disk
    /// eviction to the memory tier.
    fn enforce_disk_budget(
        &self,
        store: &mut DiskStore,
        memory: &mut MemoryIndex<R>,
        counters: &mut Counters,
    ) -> CacheResult<()> {
        let victims = policy::plan_evictions(
            &store.lru_snapshot()?,
            TierLimits {
                max_items: self.config.max_disk_items,
                max_bytes: self.config.max_disk_size_bytes,
            },
        );
        if victims.is_empty() {
            return Ok(());
        }

        let victim_refs: Vec<&str> = victims.iter().map(String::as_str).collect();
        store.delete_many(&victim_refs)?;
        for key in &victims {
            if memory.remove(key).is_some() {
                trace!(key = %key, "cascaded disk eviction to memory");
            }
            counters.disk_evictions += 1;
            debug!(key = %key, "evicted from disk");
        }
        Ok(())
    }
}

/// Split the guard into the three lock-protected parts, failing if the
/// engine has been closed.
fn open_parts<'a, R>(
    guard: &'a mut MutexGuard<'_, Inner<R>>,
) -> CacheResult<(&'a mut MemoryIndex<R>, &'a mut DiskStore, &'a mut Counters)> {
    let inner = &mut **guard;
    let store = inner.store.as_mut().ok_or(CacheError::Closed)?;
    Ok((&mut inner.memory, store, &mut inner.counters))
}

/// Probe the memory tier for `key`, classifying the entry against the
/// sliding TTL. Does not mutate the index.
fn probe_memory<R: Clone>(
    memory: &MemoryIndex<R>,
    key: &str,
    ts: f64,
    ttl_seconds: f64,
) -> MemoryProbe<R> {
    match memory.get(key) {
        Some(entry) if policy::is_expired(ts, entry.last_access_ts, ttl_seconds) => {
            MemoryProbe::Expired
        }
        Some(entry) => MemoryProbe::Fresh(entry.record.clone()),
        None => MemoryProbe::Absent,
    }
}

/// Validate a cache key: non-empty and within the length limit.
fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::InvalidKey(format!(
            "key length {} exceeds maximum of {} bytes",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
