//! Micro benchmarks for the concurrent B-tree map.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::storage::{BTreeMap, MapOptions, Storage, StorageConfig};

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: usize = 512;
const WRITERS: u64 = 4;

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_put", |b| {
        b.iter_batched(
            FreshMap::new,
            |fresh| {
                for key in 0..INSERT_COUNT {
                    let _ = fresh.map.put(key, key);
                }
                black_box(fresh.map.len());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_put", |b| {
        b.iter_batched(
            FreshMap::new,
            |fresh| {
                for key in &random_keys {
                    let _ = fresh.map.put(*key, *key);
                }
                black_box(fresh.map.len());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function(BenchmarkId::new("parallel_put", WRITERS), |b| {
        b.iter_batched(
            FreshMap::new,
            |fresh| {
                let per_writer = INSERT_COUNT / WRITERS;
                let writers: Vec<_> = (0..WRITERS)
                    .map(|w| {
                        let map = fresh.map.clone();
                        thread::spawn(move || {
                            for key in w * per_writer..(w + 1) * per_writer {
                                let _ = map.put(key, key);
                            }
                        })
                    })
                    .collect();
                for writer in writers {
                    let _ = writer.join();
                }
                black_box(fresh.map.len());
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = FreshMap::new();
    for key in 0..INSERT_COUNT {
        let _ = loaded.map.put(key, key);
    }
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_get", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(0..INSERT_COUNT);
                black_box(loaded.map.get(&key).ok());
            }
        });
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
    group.bench_function(BenchmarkId::new("cursor_scan", RANGE_WIDTH), |b| {
        b.iter(|| {
            let start = rng.gen_range(0..INSERT_COUNT - RANGE_WIDTH as u64);
            let rows = loaded.map.cursor(Some(start)).take(RANGE_WIDTH).count();
            black_box(rows);
        });
    });

    group.finish();
}

struct FreshMap {
    _storage: Arc<Storage>,
    map: BTreeMap<u64, u64>,
}

impl FreshMap {
    fn new() -> Self {
        let storage = Storage::open(StorageConfig::in_memory().handler_count(4).page_split_size(4096))
            .map(Arc::new)
            .unwrap_or_else(|err| panic!("open storage: {err}"));
        let map = storage
            .open_map("bench", &MapOptions::new())
            .unwrap_or_else(|err| panic!("open map: {err}"));
        Self {
            _storage: storage,
            map,
        }
    }
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
