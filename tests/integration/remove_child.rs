#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata::storage::btree::PageKey;
use strata::storage::{BTreeMap, MapOptions, PageListener, Storage, StorageConfig};
use strata::types::Result;

const IDLE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Removals(AtomicUsize);

impl PageListener<u64> for Removals {
    fn on_leaf_remove(&self, _map: &str, _page_key: &PageKey<u64>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn small_map(storage: &Storage) -> Result<BTreeMap<u64, u64>> {
    storage.open_map("orders", &MapOptions::new().page_split_size(512))
}

#[test]
fn emptied_middle_leaf_is_removed_from_its_parent() -> Result<()> {
    let storage = Storage::open(StorageConfig::in_memory().handler_count(3))?;
    let map = small_map(&storage)?;
    let removals = Arc::new(Removals::default());
    map.add_listener(removals.clone());
    for key in 1..=100 {
        map.put(key, key * 10)?;
    }
    assert!(map.wait_idle(IDLE));
    let before = map.shape();
    assert!(before.leaves >= 4, "{before:?}");

    for key in 20..=60 {
        assert_eq!(map.remove(key)?, Some(key * 10));
    }
    assert!(map.wait_idle(IDLE));
    let after = map.shape();
    assert!(after.leaves < before.leaves, "{before:?} -> {after:?}");
    assert!(removals.0.load(Ordering::SeqCst) >= 1);
    assert_eq!(removals.0.load(Ordering::SeqCst) as u64, map.stats().removed_leaves());

    let keys: Vec<u64> = map
        .cursor(None)
        .map(|row| row.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let expected: Vec<u64> = (1..20).chain(61..=100).collect();
    assert_eq!(keys, expected);
    assert_eq!(map.len(), expected.len() as u64);

    // The detached range is served by a neighbouring leaf.
    for key in 30..=35 {
        assert_eq!(map.put(key, 1)?, None);
    }
    assert_eq!(map.get(&33)?, Some(1));
    assert_eq!(map.get(&61)?, Some(610));
    Ok(())
}

#[test]
fn concurrent_removals_and_inserts_keep_every_row() -> Result<()> {
    let storage = Storage::open(StorageConfig::in_memory().handler_count(4))?;
    let map = small_map(&storage)?;
    for key in 0..2_000 {
        map.put(key, key)?;
    }
    assert!(map.wait_idle(IDLE));

    let mut workers = Vec::new();
    for worker in 0..4u64 {
        let map = map.clone();
        workers.push(thread::spawn(move || -> Result<()> {
            let base = worker * 500;
            // Drop the first 400 keys of this quarter, then insert above the range.
            for key in base..base + 400 {
                map.remove(key)?;
            }
            for key in 0..100 {
                map.put(10_000 + worker * 100 + key, key)?;
            }
            Ok(())
        }));
    }
    for worker in workers {
        worker
            .join()
            .map_err(|_| strata::StrataError::Internal("worker panicked".into()))??;
    }
    assert!(map.wait_idle(IDLE));
    assert!(map.stats().removed_leaves() > 0);

    let keys: Vec<u64> = map
        .cursor(None)
        .map(|row| row.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let mut expected: Vec<u64> = (0..4u64)
        .flat_map(|w| w * 500 + 400..w * 500 + 500)
        .chain(10_000..10_400)
        .collect();
    expected.sort_unstable();
    assert_eq!(keys, expected);
    assert_eq!(map.len(), 800);
    Ok(())
}

#[test]
fn removing_everything_leaves_a_usable_empty_root() -> Result<()> {
    let storage = Storage::open(StorageConfig::in_memory().handler_count(2))?;
    let map = small_map(&storage)?;
    for key in 0..300 {
        map.put(key, key)?;
    }
    assert!(map.wait_idle(IDLE));
    for key in 0..300 {
        map.remove(key)?;
    }
    assert!(map.wait_idle(IDLE));
    let shape = map.shape();
    assert_eq!((shape.leaves, shape.nodes), (1, 0), "{shape:?}");
    assert!(map.is_empty());
    assert_eq!(map.cursor(None).count(), 0);
    for key in 0..50 {
        map.put(key, key)?;
    }
    assert_eq!(map.len(), 50);
    Ok(())
}
