//! The SQLite-backed disk tier.
//!
//! One table holds the current engine instance's rows; the schema is created
//! idempotently on open and WAL journaling is enabled for file-backed
//! databases. Every multi-row mutation runs in a single transaction, and the
//! store can produce an LRU-ordered scan for the eviction planner without
//! materializing payloads.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::policy::EvictionCandidate;
use crate::{CacheError, CacheResult};

/// Upper bound on bind variables per batched statement; batches larger than
/// this are split across multiple statements within the same transaction.
const MAX_BATCH_KEYS: usize = 512;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskRow {
    /// The serialized record payload.
    pub payload: Vec<u8>,
    /// Payload length, persisted so aggregates never re-measure blobs.
    pub byte_size: u64,
    /// Timestamp of the last write or successful single-key read.
    pub last_access_ts: f64,
    /// Schema version the row was written with.
    pub schema_version: String,
}

/// A row to be written, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct UpsertRow<'a> {
    pub key: &'a str,
    pub payload: &'a [u8],
    pub byte_size: u64,
    pub last_access_ts: f64,
    pub schema_version: &'a str,
}

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

/// SQLite-backed keyed blob store with per-row LRU metadata.
#[derive(Debug)]
pub struct DiskStore {
    conn: Connection,
}

impl DiskStore {
    /// Open or create the store at `path`, creating parent directories as
    /// needed.
    pub fn open(path: &str) -> CacheResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Io(format!(
                        "creating cache directory '{}': {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an ephemeral in-memory store.
    pub fn in_memory() -> CacheResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CacheResult<Self> {
        // In-memory databases report "memory" here instead of "wal"; both
        // are fine.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(%journal_mode, "disk store journal mode");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                key            TEXT PRIMARY KEY NOT NULL,
                payload        BLOB NOT NULL,
                byte_size      INTEGER NOT NULL,
                last_access_ts REAL NOT NULL,
                schema_version TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_access ON records(last_access_ts);",
        )?;

        Ok(Self { conn })
    }

    /// Insert or replace a single row.
    pub fn upsert(&self, row: UpsertRow<'_>) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO records (key, payload, byte_size, last_access_ts, schema_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.key,
                row.payload,
                row.byte_size as i64,
                row.last_access_ts,
                row.schema_version
            ],
        )?;
        Ok(())
    }

    /// Insert or replace all rows in a single transaction.
    pub fn upsert_many(&mut self, rows: &[UpsertRow<'_>]) -> CacheResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO records (key, payload, byte_size, last_access_ts, schema_version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.key,
                    row.payload,
                    row.byte_size as i64,
                    row.last_access_ts,
                    row.schema_version
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read a single row.
    pub fn fetch(&self, key: &str) -> CacheResult<Option<DiskRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT payload, byte_size, last_access_ts, schema_version
                 FROM records WHERE key = ?1",
                params![key],
                |row| {
                    Ok(DiskRow {
                        payload: row.get(0)?,
                        byte_size: row.get::<_, i64>(1)? as u64,
                        last_access_ts: row.get(2)?,
                        schema_version: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Read many rows with one query per [`MAX_BATCH_KEYS`] chunk. Missing
    /// keys are simply absent from the result.
    pub fn fetch_many(&self, keys: &[&str]) -> CacheResult<Vec<(String, DiskRow)>> {
        let mut out = Vec::new();
        for chunk in keys.chunks(MAX_BATCH_KEYS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, payload, byte_size, last_access_ts, schema_version
                 FROM records WHERE key IN ({placeholders})"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    DiskRow {
                        payload: row.get(1)?,
                        byte_size: row.get::<_, i64>(2)? as u64,
                        last_access_ts: row.get(3)?,
                        schema_version: row.get(4)?,
                    },
                ))
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Refresh a row's last-access timestamp. No-op for absent keys.
    pub fn touch(&self, key: &str, ts: f64) -> CacheResult<()> {
        self.conn.execute(
            "UPDATE records SET last_access_ts = ?1 WHERE key = ?2",
            params![ts, key],
        )?;
        Ok(())
    }

    /// Delete a single row. Returns `true` if a row was removed.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// Delete all given keys in a single transaction. Absent keys are
    /// silently ignored.
    pub fn delete_many(&mut self, keys: &[&str]) -> CacheResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM records WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether a row exists for `key`.
    pub fn contains(&self, key: &str) -> CacheResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of rows.
    pub fn count(&self) -> CacheResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Sum of `byte_size` over all rows.
    pub fn total_bytes(&self) -> CacheResult<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(byte_size), 0) FROM records",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// LRU-ordered scan of `(key, last_access_ts, byte_size)` for the
    /// eviction planner, oldest first with the key as tie-break.
    pub fn lru_snapshot(&self) -> CacheResult<Vec<EvictionCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, last_access_ts, byte_size FROM records
             ORDER BY last_access_ts ASC, key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EvictionCandidate {
                key: row.get(0)?,
                last_access_ts: row.get(1)?,
                byte_size: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove every row.
    pub fn clear(&self) -> CacheResult<()> {
        self.conn.execute("DELETE FROM records", [])?;
        Ok(())
    }

    /// Close the underlying connection.
    pub fn close(self) -> CacheResult<()> {
        self.conn.close().map_err(|(_, e)| CacheError::Database(e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row<'a>(key: &'a str, payload: &'a [u8], ts: f64) -> UpsertRow<'a> {
        UpsertRow {
            key,
            payload,
            byte_size: payload.len() as u64,
            last_access_ts: ts,
            schema_version: "1.0.0",
        }
    }

    #[test]
    fn upsert_and_fetch_roundtrip() {
        let store = DiskStore::in_memory().unwrap();
        store.upsert(row("a", b"payload-a", 1.5)).unwrap();

        let fetched = store.fetch("a").unwrap().unwrap();
        assert_eq!(fetched.payload, b"payload-a");
        assert_eq!(fetched.byte_size, 9);
        assert_eq!(fetched.last_access_ts, 1.5);
        assert_eq!(fetched.schema_version, "1.0.0");
    }

    #[test]
    fn fetch_missing_returns_none() {
        let store = DiskStore::in_memory().unwrap();
        assert!(store.fetch("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = DiskStore::in_memory().unwrap();
        store.upsert(row("a", b"original", 1.0)).unwrap();
        store.upsert(row("a", b"updated!!", 2.0)).unwrap();

        let fetched = store.fetch("a").unwrap().unwrap();
        assert_eq!(fetched.payload, b"updated!!");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn upsert_many_lands_all_rows() {
        let mut store = DiskStore::in_memory().unwrap();
        store
            .upsert_many(&[row("a", b"aa", 1.0), row("b", b"bbb", 2.0)])
            .unwrap();

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.total_bytes().unwrap(), 5);
    }

    #[test]
    fn fetch_many_returns_found_keys_only() {
        let mut store = DiskStore::in_memory().unwrap();
        store
            .upsert_many(&[row("a", b"aa", 1.0), row("b", b"bb", 2.0)])
            .unwrap();

        let mut fetched = store.fetch_many(&["a", "b", "missing"]).unwrap();
        fetched.sort_by(|x, y| x.0.cmp(&y.0));

        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].0, "a");
        assert_eq!(fetched[1].1.payload, b"bb");
    }

    #[test]
    fn fetch_many_handles_large_batches() {
        let mut store = DiskStore::in_memory().unwrap();
        let keys: Vec<String> = (0..MAX_BATCH_KEYS + 10).map(|i| format!("k{i:05}")).collect();
        let rows: Vec<UpsertRow<'_>> = keys.iter().map(|k| row(k, b"x", 1.0)).collect();
        store.upsert_many(&rows).unwrap();

        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        assert_eq!(store.fetch_many(&refs).unwrap().len(), keys.len());
    }

    #[test]
    fn touch_updates_only_the_timestamp() {
        let store = DiskStore::in_memory().unwrap();
        store.upsert(row("a", b"aa", 1.0)).unwrap();
        store.touch("a", 9.0).unwrap();
        store.touch("missing", 9.0).unwrap();

        let fetched = store.fetch("a").unwrap().unwrap();
        assert_eq!(fetched.last_access_ts, 9.0);
        assert_eq!(fetched.payload, b"aa");
    }

    #[test]
    fn delete_reports_presence() {
        let store = DiskStore::in_memory().unwrap();
        store.upsert(row("a", b"aa", 1.0)).unwrap();

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.contains("a").unwrap());
    }

    #[test]
    fn delete_many_ignores_absent_keys() {
        let mut store = DiskStore::in_memory().unwrap();
        store
            .upsert_many(&[row("a", b"aa", 1.0), row("b", b"bb", 2.0)])
            .unwrap();

        store.delete_many(&["a", "missing"]).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.contains("b").unwrap());
    }

    #[test]
    fn aggregates_on_empty_store() {
        let store = DiskStore::in_memory().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.total_bytes().unwrap(), 0);
        assert!(store.lru_snapshot().unwrap().is_empty());
    }

    #[test]
    fn lru_snapshot_orders_by_timestamp_then_key() {
        let mut store = DiskStore::in_memory().unwrap();
        store
            .upsert_many(&[
                row("b", b"bb", 1.0),
                row("a", b"aa", 1.0),
                row("c", b"cc", 0.5),
            ])
            .unwrap();

        let snapshot = store.lru_snapshot().unwrap();
        let keys: Vec<&str> = snapshot.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn clear_removes_every_row() {
        let mut store = DiskStore::in_memory().unwrap();
        store
            .upsert_many(&[row("a", b"aa", 1.0), row("b", b"bb", 2.0)])
            .unwrap();

        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let path = db_path.to_str().unwrap();

        {
            let store = DiskStore::open(path).unwrap();
            store.upsert(row("a", b"persisted", 1.0)).unwrap();
            store.close().unwrap();
        }

        let store = DiskStore::open(path).unwrap();
        let fetched = store.fetch("a").unwrap().unwrap();
        assert_eq!(fetched.payload, b"persisted");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("deeper").join("store.db");

        let store = DiskStore::open(db_path.to_str().unwrap()).unwrap();
        store.upsert(row("a", b"aa", 1.0)).unwrap();
        assert!(db_path.exists());
    }
}
