#![allow(missing_docs)]

use std::collections::BTreeMap as Model;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::storage::{BTreeMap, MapOptions, Storage, StorageConfig};
use strata::txn::{IsolationLevel, TransactionConfig, TransactionEngine, TransactionMap};
use strata::types::{Result, StrataError};

const THREADS: u64 = 6;
const IDLE: Duration = Duration::from_secs(20);

fn storage() -> Result<Arc<Storage>> {
    let config = StorageConfig::in_memory().handler_count(4).page_split_size(2048);
    Ok(Arc::new(Storage::open(config)?))
}

fn join_all<T>(workers: Vec<thread::JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    workers
        .into_iter()
        .map(|worker| {
            worker
                .join()
                .map_err(|_| StrataError::Internal("worker panicked".into()))?
        })
        .collect()
}

fn scan(map: &BTreeMap<u64, u64>) -> Result<Vec<(u64, u64)>> {
    map.cursor(None).collect()
}

#[test]
fn shuffled_writers_match_a_sequential_model() -> Result<()> {
    let storage = storage()?;
    let map: BTreeMap<u64, u64> = storage.open_map("ledger", &MapOptions::new())?;

    // Every thread owns the keys congruent to its id, so the final state is
    // independent of interleaving.
    let workers = (0..THREADS)
        .map(|id| {
            let map = map.clone();
            thread::spawn(move || -> Result<Model<u64, u64>> {
                let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + id);
                let mut keys: Vec<u64> = (0..3_000).map(|n| n * THREADS + id).collect();
                keys.shuffle(&mut rng);
                let mut model = Model::new();
                for key in keys {
                    let value = rng.gen_range(0..1_000_000);
                    assert_eq!(map.put(key, value)?, model.insert(key, value));
                    if rng.gen_bool(0.3) {
                        assert_eq!(map.remove(key)?, model.remove(&key));
                    }
                }
                Ok(model)
            })
        })
        .collect();
    let mut expected = Model::new();
    for part in join_all(workers)? {
        expected.extend(part);
    }

    assert!(map.wait_idle(IDLE));
    assert_eq!(map.len(), expected.len() as u64);
    let rows = scan(&map)?;
    assert_eq!(rows, expected.into_iter().collect::<Vec<_>>());
    assert!(map.shape().leaves > THREADS as usize);
    assert!(map.stats().snapshot().shifted_operations > 0);
    Ok(())
}

#[test]
fn put_if_absent_has_one_winner_per_key() -> Result<()> {
    let storage = storage()?;
    let map: BTreeMap<u64, u64> = storage.open_map("claims", &MapOptions::new())?;
    let workers = (0..THREADS)
        .map(|id| {
            let map = map.clone();
            thread::spawn(move || -> Result<u64> {
                let mut wins = 0;
                for key in 0..2_000 {
                    if map.put_if_absent(key, id)?.is_none() {
                        wins += 1;
                    }
                }
                Ok(wins)
            })
        })
        .collect();
    let wins: u64 = join_all(workers)?.into_iter().sum();
    assert_eq!(wins, 2_000);
    assert_eq!(map.len(), 2_000);
    Ok(())
}

#[test]
fn compare_and_replace_never_loses_an_increment() -> Result<()> {
    let storage = storage()?;
    let map: BTreeMap<u64, u64> = storage.open_map("counters", &MapOptions::new())?;
    for key in 0..8 {
        map.put(key, 0)?;
    }
    let workers = (0..THREADS)
        .map(|id| {
            let map = map.clone();
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(id);
                for _ in 0..500 {
                    let key = rng.gen_range(0..8);
                    loop {
                        let current = map.get(&key)?.unwrap_or(0);
                        if map.replace(key, current, current + 1)? {
                            break;
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();
    join_all(workers)?;
    let total: u64 = scan(&map)?.into_iter().map(|(_, count)| count).sum();
    assert_eq!(total, THREADS * 500);
    Ok(())
}

#[test]
fn concurrent_appends_hand_out_distinct_keys() -> Result<()> {
    let storage = storage()?;
    let map: BTreeMap<u64, u64> = storage.open_map("log", &MapOptions::new())?;
    let workers = (0..THREADS)
        .map(|id| {
            let map = map.clone();
            thread::spawn(move || -> Result<Vec<u64>> {
                (0..1_000).map(|_| map.append(id)).collect()
            })
        })
        .collect();
    let mut keys: Vec<u64> = join_all(workers)?.into_iter().flatten().collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len() as u64, THREADS * 1_000);
    assert_eq!(map.len(), THREADS * 1_000);
    assert_eq!(scan(&map)?.len() as u64, THREADS * 1_000);
    Ok(())
}

#[test]
fn readers_never_see_torn_pages_during_splits() -> Result<()> {
    let storage = storage()?;
    let map: BTreeMap<u64, u64> = storage.open_map("scan", &MapOptions::new())?;
    let writer = {
        let map = map.clone();
        thread::spawn(move || -> Result<()> {
            for key in 0..20_000 {
                map.put(key, key * 2)?;
            }
            Ok(())
        })
    };
    let reader = {
        let map = map.clone();
        thread::spawn(move || -> Result<()> {
            for _ in 0..50 {
                let rows = scan(&map)?;
                assert!(rows.windows(2).all(|pair| pair[0].0 < pair[1].0));
                assert!(rows.iter().all(|(k, v)| *v == k * 2));
            }
            Ok(())
        })
    };
    join_all(vec![writer, reader])?;
    assert!(map.wait_idle(IDLE));
    assert_eq!(map.len(), 20_000);
    Ok(())
}

#[test]
fn reinsert_in_one_transaction_is_never_observed_missing() -> Result<()> {
    let storage = storage()?;
    let engine = TransactionEngine::open(TransactionConfig::in_memory())?;
    let map: TransactionMap<u64, u64> =
        TransactionMap::open(engine.clone(), &storage, "rows", &MapOptions::new())?;
    let seed = engine.begin();
    map.put(&seed, 1, 0)?;
    seed.commit()?;

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = [IsolationLevel::ReadCommitted, IsolationLevel::RepeatableRead]
        .into_iter()
        .map(|isolation| {
            let (engine, map, done) = (engine.clone(), map.clone(), done.clone());
            thread::spawn(move || -> Result<u64> {
                let mut reads = 0;
                loop {
                    let tx = engine.begin_with(isolation, None);
                    assert!(map.get(&tx, &1)?.is_some(), "row 1 vanished");
                    tx.commit()?;
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        return Ok(reads);
                    }
                }
            })
        })
        .collect();

    let writer = {
        let (engine, map, done) = (engine.clone(), map.clone(), done.clone());
        thread::spawn(move || -> Result<u64> {
            let outcome = (1..=500).try_for_each(|i| -> Result<()> {
                let tx = engine.begin();
                map.remove(&tx, 1)?;
                map.put(&tx, 1, i)?;
                tx.commit()
            });
            done.store(true, Ordering::Release);
            outcome.map(|()| 500)
        })
    };
    let counts = join_all(readers.into_iter().chain([writer]).collect())?;
    assert!(counts.iter().all(|count| *count > 0));

    let check = engine.begin();
    assert_eq!(map.get(&check, &1)?, Some(500));
    Ok(())
}
