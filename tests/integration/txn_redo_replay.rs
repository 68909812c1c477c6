#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use strata::storage::{MapOptions, Storage, StorageConfig};
use strata::txn::{RedoLog, TransactionConfig, TransactionEngine, TransactionMap, TxWrite};
use strata::types::Result;
use tempfile::tempdir;

type Accounts = TransactionMap<u64, String>;

fn open(storage: &Storage, redo: &Path) -> Result<(Arc<TransactionEngine>, Accounts)> {
    let engine = TransactionEngine::open(TransactionConfig::at(redo))?;
    let map = TransactionMap::open(engine.clone(), storage, "accounts", &MapOptions::new())?;
    Ok((engine, map))
}

fn v(s: &str) -> String {
    s.to_string()
}

#[test]
fn committed_sequence_survives_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let redo = dir.path().join("redo.log");
    {
        let storage = Storage::open(StorageConfig::in_memory().handler_count(2))?;
        let (engine, map) = open(&storage, &redo)?;
        let tx = engine.begin();
        assert_eq!(map.put_if_absent(&tx, 1, v("v1"))?, TxWrite::Done(None));
        assert_eq!(map.remove(&tx, 1)?, TxWrite::Done(Some(v("v1"))));
        assert_eq!(map.put(&tx, 1, v("v2"))?, TxWrite::Done(None));
        assert_eq!(map.put_if_absent(&tx, 2, v("w"))?, TxWrite::Done(None));
        tx.commit()?;
        // No close: the maps are never saved and only the redo log remains.
    }

    let storage = Storage::open(StorageConfig::in_memory().handler_count(2))?;
    let (engine, map) = open(&storage, &redo)?;
    assert_eq!(engine.replay()?, 1);
    let reader = engine.begin();
    assert_eq!(map.get(&reader, &1)?, Some(v("v2")));
    assert_eq!(map.get(&reader, &2)?, Some(v("w")));
    assert_eq!(map.raw().len(), 2);

    // Ids handed out after replay never reuse a logged id.
    let records = RedoLog::open_path(&redo)?.records()?;
    assert_eq!(records.len(), 1);
    assert!(engine.begin().id() > records[0].tid);
    Ok(())
}

#[test]
fn rolled_back_transactions_leave_no_redo() -> Result<()> {
    let dir = tempdir()?;
    let redo = dir.path().join("redo.log");
    {
        let storage = Storage::open(StorageConfig::in_memory())?;
        let (engine, map) = open(&storage, &redo)?;
        let tx = engine.begin();
        map.put(&tx, 7, v("gone"))?;
        tx.rollback()?;
        let dropped = engine.begin();
        map.put(&dropped, 8, v("gone too"))?;
        drop(dropped);
        assert_eq!(map.raw().len(), 0);
    }
    assert!(RedoLog::open_path(&redo)?.records()?.is_empty());
    Ok(())
}

#[test]
fn checkpoint_saves_maps_and_empties_the_log() -> Result<()> {
    let dir = tempdir()?;
    let redo = dir.path().join("redo.log");
    let data = dir.path().join("data");
    {
        let storage = Storage::open(StorageConfig::at(&data).handler_count(2))?;
        let (engine, map) = open(&storage, &redo)?;
        let tx = engine.begin();
        for key in 0..50 {
            map.put(&tx, key, format!("row-{key}"))?;
        }
        tx.commit()?;
        assert_eq!(RedoLog::open_path(&redo)?.records()?.len(), 1);
        engine.close()?;
    }
    assert!(RedoLog::open_path(&redo)?.records()?.is_empty());

    let storage = Storage::open(StorageConfig::at(&data).handler_count(2))?;
    let (engine, map) = open(&storage, &redo)?;
    assert_eq!(engine.replay()?, 0);
    let reader = engine.begin();
    assert_eq!(map.get(&reader, &49)?, Some(v("row-49")));
    assert_eq!(map.raw().len(), 50);
    Ok(())
}

#[test]
fn torn_tail_is_dropped_on_replay() -> Result<()> {
    let dir = tempdir()?;
    let redo = dir.path().join("redo.log");
    {
        let storage = Storage::open(StorageConfig::in_memory())?;
        let (engine, map) = open(&storage, &redo)?;
        for key in 0..3 {
            let tx = engine.begin();
            map.put(&tx, key, format!("n{key}"))?;
            tx.commit()?;
        }
    }
    // A crash in the middle of the fourth frame header.
    OpenOptions::new().append(true).open(&redo)?.write_all(&[0x10, 0, 0])?;

    let storage = Storage::open(StorageConfig::in_memory())?;
    let (engine, map) = open(&storage, &redo)?;
    assert_eq!(engine.replay()?, 3);
    let reader = engine.begin();
    assert_eq!(map.get(&reader, &2)?, Some(v("n2")));

    let tx = engine.begin();
    map.put(&tx, 3, v("n3"))?;
    tx.commit()?;
    assert_eq!(RedoLog::open_path(&redo)?.records()?.len(), 4);
    Ok(())
}
