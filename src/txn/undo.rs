use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::engine::TransactionEngine;
use super::value::TransactionalValue;
use crate::primitives::bytes::{put_bytes, put_str};
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::storage::BTreeMap;
use crate::types::Result;

/// Facts about the committing transaction shared by all of its records.
#[derive(Copy, Clone, Debug)]
pub struct CommitContext {
    /// Stamp the transaction commits at.
    pub stamp: u64,
    /// Oldest start stamp among the other open repeatable-read
    /// transactions; `None` when there are none.
    pub oldest_snapshot: Option<u64>,
}

/// Type-erased undo record, so one log can span maps of different types.
pub trait UndoEntry: Send + Sync {
    /// Map the record belongs to.
    fn map_name(&self) -> &str;

    /// Whether the record only holds a row lock.
    fn is_for_update(&self) -> bool;

    /// Publishes the change in memory. The redo record is already durable.
    fn commit(&self, ctx: &CommitContext) -> Result<()>;

    /// Reverts the change in memory.
    fn rollback(&self) -> Result<()>;

    /// Appends the redo image of the change and returns its size; zero when
    /// there is nothing to redo.
    fn write_for_redo(&self, out: &mut Vec<u8>, engine: &TransactionEngine) -> usize;

    /// Withdraws the record so later commit, rollback and redo calls skip it.
    fn set_undone(&self);
}

/// One row change of a transaction: the version it replaced and the version
/// it installed.
pub struct UndoLogRecord<K, V> {
    map: BTreeMap<K, TransactionalValue<V>>,
    key: K,
    old: Option<TransactionalValue<V>>,
    new: TransactionalValue<V>,
    for_update: bool,
    undone: AtomicBool,
}

impl<K: KeyCodec, V: ValCodec> UndoLogRecord<K, V> {
    /// Record for a write of `key` in `map`; `old` is `None` for an insert.
    pub fn new(
        map: BTreeMap<K, TransactionalValue<V>>,
        key: K,
        old: Option<TransactionalValue<V>>,
        new: TransactionalValue<V>,
        for_update: bool,
    ) -> Self {
        Self {
            map,
            key,
            old,
            new,
            for_update,
            undone: AtomicBool::new(false),
        }
    }

    /// Claims the record; only the first caller gets `true`.
    fn claim(&self) -> bool {
        !self.undone.swap(true, Ordering::AcqRel)
    }

    /// Puts the locked version back to the one it shadows.
    fn unlock_row(&self) -> Result<()> {
        if let Some(old) = &self.old {
            self.map
                .replace(self.key.clone(), self.new.clone(), old.clone())?;
        }
        self.new.release();
        Ok(())
    }
}

impl<K: KeyCodec, V: ValCodec> UndoEntry for UndoLogRecord<K, V> {
    fn map_name(&self) -> &str {
        self.map.name()
    }

    fn is_for_update(&self) -> bool {
        self.for_update
    }

    fn commit(&self, ctx: &CommitContext) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        if self.for_update {
            return self.unlock_row();
        }
        // The row stays locked by this transaction, so only its own later
        // writes can have replaced the version. The newest one publishes the
        // whole chain at once.
        let current = self.map.get(&self.key)?;
        if !current.is_some_and(|version| version.ptr_eq(&self.new)) {
            trace!(map = %self.map.name(), key = ?self.key, "txn.undo_superseded");
            return Ok(());
        }
        match ctx.oldest_snapshot {
            None if self.new.is_tombstone() => {
                self.map.remove(self.key.clone())?;
                self.new.release();
            }
            None => {
                self.new.commit(ctx.stamp, false);
            }
            Some(horizon) => {
                self.new.commit(ctx.stamp, true);
                self.new.prune_history(horizon);
            }
        }
        trace!(map = %self.map.name(), key = ?self.key, stamp = ctx.stamp, "txn.undo_committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        if self.for_update {
            return self.unlock_row();
        }
        match &self.old {
            None => {
                self.map.remove(self.key.clone())?;
            }
            Some(old) => {
                self.map.put(self.key.clone(), old.clone())?;
            }
        }
        self.new.release();
        trace!(map = %self.map.name(), key = ?self.key, "txn.undo_rolled_back");
        Ok(())
    }

    fn write_for_redo(&self, out: &mut Vec<u8>, engine: &TransactionEngine) -> usize {
        if self.for_update || self.undone.load(Ordering::Acquire) {
            return 0;
        }
        let start = out.len();
        put_str(out, self.map.name());
        let mut key = Vec::new();
        K::encode_key(&self.key, &mut key);
        put_bytes(out, &key);
        match self.new.value() {
            Some(value) => {
                out.push(1);
                let mut raw = Vec::new();
                V::encode_val(value, &mut raw);
                put_bytes(out, &raw);
            }
            None => out.push(0),
        }
        let written = out.len() - start;
        engine.increment_estimated_memory(self.map.name(), written);
        written
    }

    fn set_undone(&self) {
        self.undone.store(true, Ordering::Release);
    }
}

/// Ordered undo records of one transaction.
#[derive(Default)]
pub struct UndoLog {
    entries: Vec<Box<dyn UndoEntry>>,
}

impl UndoLog {
    /// Appends a record.
    pub fn push(&mut self, entry: Box<dyn UndoEntry>) {
        self.entries.push(entry);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the transaction wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Redo image of every record, in write order.
    pub fn write_for_redo(&self, engine: &TransactionEngine) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            entry.write_for_redo(&mut out, engine);
        }
        out
    }

    /// Commits every record in write order.
    pub fn commit(&self, ctx: &CommitContext) -> Result<()> {
        for entry in &self.entries {
            entry.commit(ctx)?;
        }
        Ok(())
    }

    /// Rolls back the records past `len`, newest first.
    pub fn rollback_to(&mut self, len: usize) -> Result<()> {
        while self.entries.len() > len {
            if let Some(entry) = self.entries.pop() {
                entry.rollback()?;
            }
        }
        Ok(())
    }
}
