use std::sync::Arc;

use tracing::trace;

use super::engine::{RedoTarget, Transaction, TransactionEngine, TxWrite};
use super::undo::UndoLogRecord;
use super::value::TransactionalValue;
use crate::storage::codec::{key_from_bytes, value_from_bytes, KeyCodec, ValCodec};
use crate::storage::{BTreeMap, MapOptions, Storage};
use crate::types::{Result, StrataError};

enum WriteKind<V> {
    Put(V),
    PutIfAbsent(V),
    Remove,
    Lock,
}

/// Transactional view over a map of [`TransactionalValue`] rows.
pub struct TransactionMap<K, V> {
    map: BTreeMap<K, TransactionalValue<V>>,
    engine: Arc<TransactionEngine>,
}

impl<K, V> Clone for TransactionMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            engine: self.engine.clone(),
        }
    }
}

struct MapRedo<K, V> {
    map: BTreeMap<K, TransactionalValue<V>>,
}

impl<K: KeyCodec, V: ValCodec> RedoTarget for MapRedo<K, V> {
    fn name(&self) -> &str {
        self.map.name()
    }

    fn apply_redo(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let key: K = key_from_bytes(key)?;
        match value {
            Some(raw) => {
                let value: V = value_from_bytes(raw)?;
                self.map.put(key, TransactionalValue::committed(Some(value), 0))?;
            }
            None => {
                self.map.remove(key)?;
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.map.save().map(|_| ())
    }
}

impl<K: KeyCodec, V: ValCodec> TransactionMap<K, V> {
    /// Wraps `map` and registers it with `engine`.
    pub fn new(engine: Arc<TransactionEngine>, map: BTreeMap<K, TransactionalValue<V>>) -> Self {
        engine.register_map(Arc::new(MapRedo { map: map.clone() }));
        Self { map, engine }
    }

    /// Opens map `name` in `storage` as a transactional map.
    pub fn open(
        engine: Arc<TransactionEngine>,
        storage: &Storage,
        name: &str,
        options: &MapOptions,
    ) -> Result<Self> {
        Ok(Self::new(engine, storage.open_map(name, options)?))
    }

    /// Map name.
    pub fn name(&self) -> &str {
        self.map.name()
    }

    /// Underlying versioned map.
    pub fn raw(&self) -> &BTreeMap<K, TransactionalValue<V>> {
        &self.map
    }

    fn check_owner(&self, tx: &Transaction) -> Result<()> {
        if Arc::ptr_eq(tx.engine(), &self.engine) {
            Ok(())
        } else {
            Err(StrataError::Invalid("transaction belongs to another engine"))
        }
    }

    fn visible(&self, tx: &Transaction, version: &TransactionalValue<V>) -> Option<V> {
        version
            .visible_version(tx.id(), tx.isolation(), tx.start_stamp())
            .and_then(|v| v.value().cloned())
    }

    /// Value of `key` as seen by `tx`.
    pub fn get(&self, tx: &Transaction, key: &K) -> Result<Option<V>> {
        Ok(self
            .map
            .get(key)?
            .and_then(|version| self.visible(tx, &version)))
    }

    /// Inserts or overwrites `key`; returns the value `tx` saw before.
    pub fn put(&self, tx: &Transaction, key: K, value: V) -> Result<TxWrite<Option<V>>> {
        self.write(tx, key, WriteKind::Put(value))
    }

    /// Inserts `key` unless `tx` already sees a value; returns that value.
    pub fn put_if_absent(&self, tx: &Transaction, key: K, value: V) -> Result<TxWrite<Option<V>>> {
        self.write(tx, key, WriteKind::PutIfAbsent(value))
    }

    /// Deletes `key`; returns the value `tx` saw before.
    pub fn remove(&self, tx: &Transaction, key: K) -> Result<TxWrite<Option<V>>> {
        self.write(tx, key, WriteKind::Remove)
    }

    /// Locks `key` for update without changing it.
    ///
    /// Returns false when `tx` sees no row to lock.
    pub fn lock(&self, tx: &Transaction, key: K) -> Result<TxWrite<bool>> {
        Ok(self.write(tx, key, WriteKind::Lock)?.map(|seen| seen.is_some()))
    }

    /// Inserts `value` under a generated key.
    pub fn append(&self, tx: &Transaction, value: V) -> Result<TxWrite<K>> {
        self.check_owner(tx)?;
        tx.check_active()?;
        let version = TransactionalValue::uncommitted(tx.id(), Some(value), None);
        let key = self.map.append(version.clone())?;
        tx.log(Box::new(UndoLogRecord::new(
            self.map.clone(),
            key.clone(),
            None,
            version,
            false,
        )));
        Ok(TxWrite::Done(key))
    }

    /// Rows visible to `tx` from `from` on, ascending.
    pub fn cursor<'a>(
        &'a self,
        tx: &'a Transaction,
        from: Option<K>,
    ) -> impl Iterator<Item = Result<(K, V)>> + 'a {
        self.map.cursor(from).filter_map(move |row| match row {
            Ok((key, version)) => self.visible(tx, &version).map(|value| Ok((key, value))),
            Err(err) => Some(Err(err)),
        })
    }

    fn write(&self, tx: &Transaction, key: K, kind: WriteKind<V>) -> Result<TxWrite<Option<V>>> {
        self.check_owner(tx)?;
        tx.check_active()?;
        let deadline = self.engine.lock_wait_deadline();
        loop {
            let seen = self.engine.lock_generation();
            let current = self.map.get(&key)?;
            if let Some(owner) = current.as_ref().and_then(TransactionalValue::lock_owner) {
                if owner != tx.id() {
                    // Locks are released before the holder leaves the active
                    // set, so a release always bumps the generation after `seen`.
                    if self.engine.wait_for_unlock(seen, deadline) {
                        continue;
                    }
                    trace!(map = %self.map.name(), key = ?key, holder = %owner, "txn.row_conflict");
                    return Ok(TxWrite::Conflict(
                        self.engine.check_replication_conflict(owner, tx),
                    ));
                }
            }
            let before = current.as_ref().and_then(|version| self.visible(tx, version));
            let (value, for_update) = match &kind {
                WriteKind::Put(value) => (Some(value.clone()), false),
                WriteKind::PutIfAbsent(value) => {
                    if before.is_some() {
                        return Ok(TxWrite::Done(before));
                    }
                    (Some(value.clone()), false)
                }
                WriteKind::Remove => {
                    if current.is_none() {
                        return Ok(TxWrite::Done(None));
                    }
                    (None, false)
                }
                WriteKind::Lock => {
                    let owned = current
                        .as_ref()
                        .is_some_and(|version| version.lock_owner() == Some(tx.id()));
                    if before.is_none() || owned {
                        return Ok(TxWrite::Done(before));
                    }
                    (before.clone(), true)
                }
            };
            let version = TransactionalValue::uncommitted(tx.id(), value, current.clone());
            let installed = match &current {
                None => self.map.put_if_absent(key.clone(), version.clone())?.is_none(),
                Some(existing) => {
                    self.map
                        .replace(key.clone(), existing.clone(), version.clone())?
                }
            };
            if !installed {
                continue;
            }
            tx.log(Box::new(UndoLogRecord::new(
                self.map.clone(),
                key,
                current,
                version,
                for_update,
            )));
            return Ok(TxWrite::Done(before));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::StorageConfig;
    use crate::txn::{IsolationLevel, TransactionConfig};

    fn setup() -> Result<(Storage, Arc<TransactionEngine>, TransactionMap<u64, String>)> {
        let storage = Storage::open(StorageConfig::in_memory().handler_count(2))?;
        let engine = TransactionEngine::open(
            TransactionConfig::in_memory().lock_wait_timeout(Duration::from_millis(20)),
        )?;
        let map = TransactionMap::open(engine.clone(), &storage, "accounts", &MapOptions::new())?;
        Ok((storage, engine, map))
    }

    #[test]
    fn uncommitted_writes_are_private() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let writer = engine.begin();
        let reader = engine.begin();
        assert_eq!(map.put(&writer, 1, "a".into())?, TxWrite::Done(None));
        assert_eq!(map.get(&writer, &1)?, Some("a".to_string()));
        assert_eq!(map.get(&reader, &1)?, None);
        writer.commit()?;
        assert_eq!(map.get(&reader, &1)?, Some("a".to_string()));
        Ok(())
    }

    #[test]
    fn rollback_restores_previous_rows() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let setup_tx = engine.begin();
        map.put(&setup_tx, 1, "one".into())?;
        setup_tx.commit()?;

        let tx = engine.begin();
        map.put(&tx, 1, "uno".into())?;
        map.put(&tx, 2, "dos".into())?;
        map.remove(&tx, 1)?;
        tx.rollback()?;

        let check = engine.begin();
        assert_eq!(map.get(&check, &1)?, Some("one".to_string()));
        assert_eq!(map.get(&check, &2)?, None);
        assert_eq!(map.raw().len(), 1);
        Ok(())
    }

    #[test]
    fn savepoint_rolls_back_later_writes_only() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let tx = engine.begin();
        map.put(&tx, 1, "kept".into())?;
        let savepoint = tx.savepoint();
        map.put(&tx, 2, "dropped".into())?;
        map.put(&tx, 1, "changed".into())?;
        tx.rollback_to_savepoint(savepoint)?;
        assert_eq!(map.get(&tx, &1)?, Some("kept".to_string()));
        assert_eq!(map.get(&tx, &2)?, None);
        tx.commit()?;
        assert_eq!(map.raw().len(), 1);
        Ok(())
    }

    #[test]
    fn locked_rows_report_conflicts() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let seed = engine.begin();
        map.put(&seed, 5, "five".into())?;
        seed.commit()?;

        let holder = engine.begin();
        assert_eq!(map.lock(&holder, 5)?, TxWrite::Done(true));
        assert_eq!(map.lock(&holder, 6)?, TxWrite::Done(false));
        let other = engine.begin();
        let TxWrite::Conflict(conflict) = map.put(&other, 5, "v".into())? else {
            panic!("expected a row-lock conflict");
        };
        assert_eq!(conflict.holder, holder.id());
        holder.commit()?;

        assert_eq!(
            map.put(&other, 5, "v".into())?,
            TxWrite::Done(Some("five".to_string()))
        );
        other.commit()?;
        assert!(map
            .raw()
            .get(&5)?
            .is_some_and(|v| v.value().map(String::as_str) == Some("v")));
        Ok(())
    }

    #[test]
    fn lock_then_update_commits_the_update() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let seed = engine.begin();
        map.put(&seed, 1, "a".into())?;
        seed.commit()?;

        let tx = engine.begin();
        map.lock(&tx, 1)?;
        map.put(&tx, 1, "b".into())?;
        tx.commit()?;
        let check = engine.begin();
        assert_eq!(map.get(&check, &1)?, Some("b".to_string()));
        assert_eq!(map.raw().get(&1)?.and_then(|v| v.lock_owner()), None);
        Ok(())
    }

    #[test]
    fn waiting_writer_proceeds_after_release() -> Result<()> {
        let storage = Storage::open(StorageConfig::in_memory().handler_count(2))?;
        let engine = TransactionEngine::open(
            TransactionConfig::in_memory().lock_wait_timeout(Duration::from_secs(5)),
        )?;
        let map: TransactionMap<u64, String> =
            TransactionMap::open(engine.clone(), &storage, "wait", &MapOptions::new())?;
        let holder = engine.begin();
        map.put(&holder, 1, "first".into())?;

        let waiter_map = map.clone();
        let waiter_engine = engine.clone();
        let waiter = std::thread::spawn(move || -> Result<bool> {
            let tx = waiter_engine.begin();
            let done = !waiter_map.put(&tx, 1, "second".into())?.is_conflict();
            tx.commit()?;
            Ok(done)
        });
        std::thread::sleep(Duration::from_millis(50));
        holder.commit()?;
        assert!(waiter.join().map_err(|_| StrataError::Internal("waiter panicked".into()))??);

        let check = engine.begin();
        assert_eq!(map.get(&check, &1)?, Some("second".to_string()));
        Ok(())
    }

    #[test]
    fn repeatable_read_keeps_its_snapshot() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let seed = engine.begin();
        map.put(&seed, 1, "v1".into())?;
        seed.commit()?;

        let reader = engine.begin_with(IsolationLevel::RepeatableRead, None);
        let writer = engine.begin();
        map.put(&writer, 1, "v2".into())?;
        map.remove(&writer, 1)?;
        writer.commit()?;

        assert_eq!(map.get(&reader, &1)?, Some("v1".to_string()));
        let fresh = engine.begin();
        assert_eq!(map.get(&fresh, &1)?, None);
        Ok(())
    }

    #[test]
    fn delete_then_reinsert_keeps_the_row() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let seed = engine.begin();
        map.put(&seed, 3, "old".into())?;
        seed.commit()?;

        let tx = engine.begin();
        map.remove(&tx, 3)?;
        assert_eq!(map.get(&tx, &3)?, None);
        map.put(&tx, 3, "new".into())?;
        tx.commit()?;

        let check = engine.begin();
        assert_eq!(map.get(&check, &3)?, Some("new".to_string()));
        Ok(())
    }

    #[test]
    fn append_and_cursor_respect_visibility() -> Result<()> {
        let (_storage, engine, map) = setup()?;
        let tx = engine.begin();
        let first = map.append(&tx, "a".into())?.done();
        let second = map.append(&tx, "b".into())?.done();
        assert_eq!((first, second), (Some(1), Some(2)));
        let other = engine.begin();
        assert_eq!(map.cursor(&other, None).count(), 0);
        tx.commit()?;
        let rows: Vec<(u64, String)> = map.cursor(&other, None).collect::<Result<_>>()?;
        assert_eq!(rows, vec![(1, "a".to_string()), (2, "b".to_string())]);
        Ok(())
    }
}
