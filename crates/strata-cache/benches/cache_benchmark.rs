//! Criterion benchmark suite for the tiered cache.
//!
//! Measures single-key put/get throughput and batched writes against an
//! ephemeral in-memory store, so numbers reflect engine overhead rather
//! than filesystem speed.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};

use strata_cache::{CacheConfig, Recordable, TieredCache};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchRecord {
    id: u64,
    body: String,
}

impl Recordable for BenchRecord {
    fn schema_version() -> &'static str {
        "1.0.0"
    }
}

fn record(id: u64) -> BenchRecord {
    BenchRecord {
        id,
        body: "x".repeat(256),
    }
}

/// Sets up an engine over an ephemeral store with roomy budgets.
fn setup_cache() -> TieredCache<BenchRecord> {
    TieredCache::open(CacheConfig::default()).expect("open in-memory cache")
}

/// Benchmark: repeated single-key puts (write-through to SQLite).
fn bench_put(c: &mut Criterion) {
    let cache = setup_cache();
    let value = record(1);

    let mut i = 0u64;
    c.bench_function("put_single", |b| {
        b.iter(|| {
            i += 1;
            cache.put(&format!("key-{}", i % 1000), &value).unwrap();
        })
    });
}

/// Benchmark: memory-tier hits.
fn bench_get_memory_hit(c: &mut Criterion) {
    let cache = setup_cache();
    cache.put("hot", &record(1)).unwrap();

    c.bench_function("get_memory_hit", |b| {
        b.iter(|| {
            let _ = cache.get("hot").unwrap();
        })
    });
}

/// Benchmark: a 100-row atomic batch write.
fn bench_put_many(c: &mut Criterion) {
    let cache = setup_cache();
    let items: Vec<(String, BenchRecord)> = (0..100)
        .map(|i| (format!("batch-{i}"), record(i)))
        .collect();

    c.bench_function("put_many_100", |b| {
        b.iter(|| {
            cache.put_many(&items).unwrap();
        })
    });
}

criterion_group!(benches, bench_put, bench_get_memory_hit, bench_put_many);
criterion_main!(benches);
