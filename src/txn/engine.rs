use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::redo::RedoLog;
use super::undo::{CommitContext, UndoEntry, UndoLog};
use crate::primitives::bytes::ByteReader;
use crate::storage::replication::{
    replication_winner, AckResult, ReplicationConflictType, StorageAck,
};
use crate::types::{Result, StrataError, TxId};

/// Read isolation of a transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Sees the newest committed version of every row.
    #[default]
    ReadCommitted,
    /// Sees rows as of the transaction start.
    RepeatableRead,
}

/// Transaction engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Redo log file; `None` keeps no redo log.
    pub redo_log_path: Option<PathBuf>,
    /// Whether every commit syncs the redo log.
    pub redo_sync: bool,
    /// Estimated redo bytes of one map after which a checkpoint is scheduled.
    pub flush_threshold: usize,
    /// How long a writer waits for a row lock before reporting a conflict.
    pub lock_wait_timeout_ms: u64,
    /// Period of background checkpoints; zero disables them.
    pub checkpoint_interval_ms: u64,
    /// Isolation of transactions started with [`TransactionEngine::begin`].
    pub default_isolation: IsolationLevel,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            redo_log_path: None,
            redo_sync: true,
            flush_threshold: 8 << 20,
            lock_wait_timeout_ms: 1_000,
            checkpoint_interval_ms: 0,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl TransactionConfig {
    /// Engine without a redo log.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Engine logging to `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            redo_log_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the per-map checkpoint threshold.
    pub fn flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Sets the row-lock wait.
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets whether commits sync the redo log.
    pub fn redo_sync(mut self, sync: bool) -> Self {
        self.redo_sync = sync;
        self
    }
}

/// Map the engine can save at checkpoints and replay redo into.
pub trait RedoTarget: Send + Sync + 'static {
    /// Map name, as written in redo records.
    fn name(&self) -> &str;
    /// Applies one logged change; `None` deletes the key.
    fn apply_redo(&self, key: &[u8], value: Option<&[u8]>) -> Result<()>;
    /// Persists the map.
    fn save(&self) -> Result<()>;
}

/// Row-lock conflict reported to a writer instead of an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteConflict {
    /// Transaction holding the lock.
    pub holder: TxId,
    /// Conflict classification for the wire ack.
    pub kind: ReplicationConflictType,
    /// Replication sessions involved that have not committed yet.
    pub uncommitted_replication_names: Vec<String>,
    /// Whether the writer wins the replication tie-break.
    pub writer_wins: bool,
}

impl WriteConflict {
    /// Wire acknowledgement reporting this conflict.
    pub fn to_ack(&self, result: AckResult) -> StorageAck {
        StorageAck::conflict(result, self.kind, self.uncommitted_replication_names.clone())
    }
}

/// Outcome of a transactional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxWrite<T> {
    /// The write was applied.
    Done(T),
    /// Another transaction holds the row.
    Conflict(WriteConflict),
}

impl<T> TxWrite<T> {
    /// Result of an applied write.
    pub fn done(self) -> Option<T> {
        match self {
            TxWrite::Done(value) => Some(value),
            TxWrite::Conflict(_) => None,
        }
    }

    /// Returns true when the write hit a lock.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TxWrite::Conflict(_))
    }

    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> TxWrite<U> {
        match self {
            TxWrite::Done(value) => TxWrite::Done(f(value)),
            TxWrite::Conflict(conflict) => TxWrite::Conflict(conflict),
        }
    }
}

#[derive(Clone, Debug)]
struct ActiveTransaction {
    isolation: IsolationLevel,
    start_stamp: u64,
    replication_name: Option<String>,
}

enum FlushRequest {
    Checkpoint { map: String },
}

/// Allocates transactions, orders commits and owns the redo log.
pub struct TransactionEngine {
    config: TransactionConfig,
    next_tid: AtomicU64,
    /// Stamp of the newest commit. Guarded by `active` for writes.
    stamp: AtomicU64,
    active: Mutex<HashMap<TxId, ActiveTransaction>>,
    maps: RwLock<HashMap<String, Arc<dyn RedoTarget>>>,
    estimated: Mutex<HashMap<String, usize>>,
    redo: Option<RedoLog>,
    checkpoint_gate: RwLock<()>,
    unlocked: Mutex<u64>,
    unlocked_cv: Condvar,
    flush_tx: Mutex<Option<mpsc::Sender<FlushRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionEngine {
    /// Opens the engine and starts its flush worker.
    pub fn open(config: TransactionConfig) -> Result<Arc<Self>> {
        let redo = match &config.redo_log_path {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)?;
                }
                Some(RedoLog::open_path(path)?)
            }
            None => None,
        };
        Self::with_redo(config, redo)
    }

    /// Opens the engine over an already opened redo log, ignoring
    /// `config.redo_log_path`.
    pub fn with_redo(config: TransactionConfig, redo: Option<RedoLog>) -> Result<Arc<Self>> {
        let interval = Duration::from_millis(config.checkpoint_interval_ms);
        let engine = Arc::new(Self {
            config,
            next_tid: AtomicU64::new(1),
            stamp: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            maps: RwLock::new(HashMap::new()),
            estimated: Mutex::new(HashMap::new()),
            redo,
            checkpoint_gate: RwLock::new(()),
            unlocked: Mutex::new(0),
            unlocked_cv: Condvar::new(),
            flush_tx: Mutex::new(None),
            worker: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&engine);
        let handle = thread::Builder::new()
            .name("strata-flush".into())
            .spawn(move || flush_worker(weak, rx, interval))?;
        *engine.flush_tx.lock() = Some(tx);
        *engine.worker.lock() = Some(handle);
        info!(redo = engine.redo.is_some(), "txn.engine_opened");
        Ok(engine)
    }

    /// Effective configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Starts a transaction at the configured default isolation.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        self.begin_with(self.config.default_isolation, None)
    }

    /// Starts a transaction.
    pub fn begin_with(
        self: &Arc<Self>,
        isolation: IsolationLevel,
        replication_name: Option<String>,
    ) -> Transaction {
        let id = TxId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let start_stamp = {
            let mut active = self.active.lock();
            let start_stamp = self.stamp.load(Ordering::Acquire);
            active.insert(
                id,
                ActiveTransaction {
                    isolation,
                    start_stamp,
                    replication_name: replication_name.clone(),
                },
            );
            start_stamp
        };
        debug!(tid = %id, ?isolation, start_stamp, "txn.begin");
        Transaction {
            engine: self.clone(),
            id,
            isolation,
            start_stamp,
            replication_name,
            undo: Mutex::new(UndoLog::default()),
            state: AtomicU8::new(STATE_ACTIVE),
        }
    }

    /// Registers a map for checkpoints and redo replay.
    pub fn register_map(&self, target: Arc<dyn RedoTarget>) {
        self.maps.write().insert(target.name().to_string(), target);
    }

    /// Whether `tid` is still open.
    pub fn is_active(&self, tid: TxId) -> bool {
        self.active.lock().contains_key(&tid)
    }

    /// Whether a repeatable-read transaction other than `tid` is open.
    pub fn has_other_repeatable_read(&self, tid: TxId) -> bool {
        self.active
            .lock()
            .iter()
            .any(|(id, tx)| *id != tid && tx.isolation == IsolationLevel::RepeatableRead)
    }

    fn commit_context(&self, tid: TxId) -> CommitContext {
        let active = self.active.lock();
        let stamp = self.stamp.fetch_add(1, Ordering::AcqRel) + 1;
        let oldest_snapshot = active
            .iter()
            .filter(|(id, tx)| **id != tid && tx.isolation == IsolationLevel::RepeatableRead)
            .map(|(_, tx)| tx.start_stamp)
            .min();
        CommitContext {
            stamp,
            oldest_snapshot,
        }
    }

    fn finish(&self, tid: TxId) {
        self.active.lock().remove(&tid);
        let mut generation = self.unlocked.lock();
        *generation += 1;
        self.unlocked_cv.notify_all();
    }

    /// Counter bumped every time a transaction releases its locks.
    pub fn lock_generation(&self) -> u64 {
        *self.unlocked.lock()
    }

    /// Waits until some transaction releases its locks after `seen`, or
    /// `deadline` passes. Returns false on timeout.
    pub fn wait_for_unlock(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = self.unlocked.lock();
        while *generation == seen {
            if self.unlocked_cv.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }

    pub(crate) fn lock_wait_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.lock_wait_timeout_ms)
    }

    /// Classifies a row held by `holder` against `writer`.
    ///
    /// Only row locks are detected locally. Two replication sessions racing
    /// for a row are settled by name: the smallest uncommitted replication
    /// name wins.
    pub fn check_replication_conflict(&self, holder: TxId, writer: &Transaction) -> WriteConflict {
        let holder_name = self
            .active
            .lock()
            .get(&holder)
            .and_then(|tx| tx.replication_name.clone());
        let mut names: Vec<String> = holder_name.into_iter().collect();
        if let Some(own) = &writer.replication_name {
            names.push(own.clone());
        }
        let writer_wins = match (&writer.replication_name, names.len()) {
            (Some(own), 2) => replication_winner(names.iter().map(String::as_str)) == Some(own.as_str()),
            _ => false,
        };
        WriteConflict {
            holder,
            kind: ReplicationConflictType::RowLock,
            uncommitted_replication_names: names,
            writer_wins,
        }
    }

    /// Adds redo bytes written for `map` and schedules a checkpoint once the
    /// map crosses the flush threshold.
    pub fn increment_estimated_memory(&self, map: &str, bytes: usize) {
        let total = {
            let mut estimated = self.estimated.lock();
            let slot = estimated.entry(map.to_string()).or_insert(0);
            *slot += bytes;
            *slot
        };
        if total >= self.config.flush_threshold && total - bytes < self.config.flush_threshold {
            if let Some(tx) = self.flush_tx.lock().as_ref() {
                let _ = tx.send(FlushRequest::Checkpoint {
                    map: map.to_string(),
                });
            }
        }
    }

    /// Redo bytes logged for `map` since the last checkpoint.
    pub fn estimated_memory(&self, map: &str) -> usize {
        self.estimated.lock().get(map).copied().unwrap_or(0)
    }

    /// Saves every registered map and empties the redo log.
    pub fn checkpoint(&self) -> Result<()> {
        let _gate = self.checkpoint_gate.write();
        let maps: Vec<Arc<dyn RedoTarget>> = self.maps.read().values().cloned().collect();
        for map in &maps {
            map.save()?;
        }
        if let Some(redo) = &self.redo {
            redo.reset()?;
        }
        self.estimated.lock().clear();
        info!(maps = maps.len(), "txn.checkpoint");
        Ok(())
    }

    /// Re-applies every logged transaction to the registered maps.
    ///
    /// Returns the number of transactions replayed.
    pub fn replay(&self) -> Result<usize> {
        let Some(redo) = &self.redo else {
            return Ok(0);
        };
        let maps = self.maps.read().clone();
        let mut replayed = 0;
        let mut rows = 0;
        let mut max_tid = 0;
        let mut iter = redo.iter()?;
        while let Some(record) = iter.next_record()? {
            let mut reader = ByteReader::new(&record.payload);
            while reader.remaining() > 0 {
                let name = reader.str()?;
                let key = reader.bytes()?;
                let value = match reader.u8()? {
                    0 => None,
                    1 => Some(reader.bytes()?),
                    _ => return Err(StrataError::Corruption("bad redo value tag")),
                };
                match maps.get(name) {
                    Some(map) => map.apply_redo(key, value)?,
                    None => warn!(map = name, tid = %record.tid, "txn.redo_map_missing"),
                }
                rows += 1;
            }
            max_tid = max_tid.max(record.tid.0);
            replayed += 1;
        }
        self.next_tid.fetch_max(max_tid + 1, Ordering::Relaxed);
        info!(transactions = replayed, rows, "txn.redo_replayed");
        Ok(replayed)
    }

    fn log_commit(&self, tid: TxId, payload: &[u8]) -> Result<()> {
        if let Some(redo) = &self.redo {
            if !payload.is_empty() {
                redo.append(tid, payload)?;
                if self.config.redo_sync {
                    redo.sync()?;
                }
            }
        }
        Ok(())
    }

    /// Stops the flush worker and checkpoints.
    pub fn close(&self) -> Result<()> {
        self.stop_worker();
        self.checkpoint()
    }

    fn stop_worker(&self) {
        self.flush_tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("txn.flush_worker_panicked");
            }
        }
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        self.flush_tx.lock().take();
    }
}

fn flush_worker(engine: Weak<TransactionEngine>, rx: mpsc::Receiver<FlushRequest>, interval: Duration) {
    let wait = if interval.is_zero() {
        Duration::from_secs(3600)
    } else {
        interval
    };
    loop {
        let trigger = match rx.recv_timeout(wait) {
            Ok(FlushRequest::Checkpoint { map }) => Some(map),
            Err(RecvTimeoutError::Timeout) if !interval.is_zero() => None,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if trigger.is_none() && engine.redo.as_ref().map_or(true, RedoLog::is_empty) {
            continue;
        }
        debug!(map = ?trigger, "txn.flush_worker_checkpoint");
        if let Err(err) = engine.checkpoint() {
            warn!(error = %err, "txn.checkpoint_failed");
        }
    }
    debug!("txn.flush_worker_exit");
}

const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ROLLED_BACK: u8 = 2;

/// An open transaction. Dropping it without committing rolls it back.
pub struct Transaction {
    engine: Arc<TransactionEngine>,
    id: TxId,
    isolation: IsolationLevel,
    start_stamp: u64,
    replication_name: Option<String>,
    undo: Mutex<UndoLog>,
    state: AtomicU8,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Read isolation.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Commit stamp current when the transaction began.
    pub fn start_stamp(&self) -> u64 {
        self.start_stamp
    }

    /// Replication session name, for replicated writes.
    pub fn replication_name(&self) -> Option<&str> {
        self.replication_name.as_deref()
    }

    /// Engine the transaction belongs to.
    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Returns true until commit or rollback.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ACTIVE
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StrataError::Invalid("transaction is no longer active"))
        }
    }

    pub(crate) fn log(&self, entry: Box<dyn UndoEntry>) {
        self.undo.lock().push(entry);
    }

    /// Number of undo records written so far.
    pub fn undo_len(&self) -> usize {
        self.undo.lock().len()
    }

    /// Marks the current point of the undo log.
    pub fn savepoint(&self) -> usize {
        self.undo_len()
    }

    /// Reverts every write made after `savepoint`.
    pub fn rollback_to_savepoint(&self, savepoint: usize) -> Result<()> {
        self.check_active()?;
        self.undo.lock().rollback_to(savepoint)
    }

    /// Makes every write durable and visible.
    ///
    /// A failed commit rolls the transaction back and returns the failure.
    pub fn commit(self) -> Result<()> {
        self.check_active()?;
        if let Err(err) = self.commit_inner() {
            warn!(tid = %self.id, error = %err, "txn.commit_failed");
            if let Err(undo_err) = self.rollback_inner() {
                warn!(tid = %self.id, error = %undo_err, "txn.commit_rollback_failed");
            }
            return Err(err);
        }
        self.state.store(STATE_COMMITTED, Ordering::Release);
        self.engine.finish(self.id);
        Ok(())
    }

    fn commit_inner(&self) -> Result<()> {
        let undo = self.undo.lock();
        let _gate = self.engine.checkpoint_gate.read();
        let payload = undo.write_for_redo(&self.engine);
        self.engine.log_commit(self.id, &payload)?;
        let ctx = self.engine.commit_context(self.id);
        undo.commit(&ctx)?;
        debug!(tid = %self.id, records = undo.len(), stamp = ctx.stamp, "txn.committed");
        Ok(())
    }

    /// Reverts every write.
    pub fn rollback(self) -> Result<()> {
        self.check_active()?;
        self.rollback_inner()
    }

    fn rollback_inner(&self) -> Result<()> {
        let outcome = self.undo.lock().rollback_to(0);
        self.state.store(STATE_ROLLED_BACK, Ordering::Release);
        self.engine.finish(self.id);
        debug!(tid = %self.id, "txn.rolled_back");
        outcome
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.rollback_inner() {
                warn!(tid = %self.id, error = %err, "txn.drop_rollback_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use crate::storage::{MapOptions, Storage, StorageConfig};
    use crate::txn::TransactionMap;

    /// Log file whose writes start failing once `fail` is set.
    struct FailingIo {
        inner: StdFileIo,
        fail: Arc<AtomicBool>,
    }

    impl FileIo for FailingIo {
        fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
            FileIo::read_at(&self.inner, off, dst)
        }

        fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(std::io::Error::other("disk full").into());
            }
            FileIo::write_at(&self.inner, off, src)
        }

        fn sync_all(&self) -> Result<()> {
            FileIo::sync_all(&self.inner)
        }

        fn len(&self) -> Result<u64> {
            FileIo::len(&self.inner)
        }

        fn truncate(&self, len: u64) -> Result<()> {
            FileIo::truncate(&self.inner, len)
        }
    }

    #[test]
    fn failed_commit_rolls_back_and_releases_locks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fail = Arc::new(AtomicBool::new(false));
        let io = FailingIo {
            inner: StdFileIo::open(dir.path().join("redo.log"))?,
            fail: fail.clone(),
        };
        let engine = TransactionEngine::with_redo(
            TransactionConfig::in_memory().lock_wait_timeout(Duration::from_millis(20)),
            Some(RedoLog::open(Arc::new(io))?),
        )?;
        let storage = Storage::open(StorageConfig::in_memory().handler_count(1))?;
        let map: TransactionMap<u64, String> =
            TransactionMap::open(engine.clone(), &storage, "accounts", &MapOptions::new())?;
        let seed = engine.begin();
        map.put(&seed, 1, "old".into())?;
        seed.commit()?;

        fail.store(true, Ordering::Release);
        let tx = engine.begin();
        let id = tx.id();
        map.put(&tx, 1, "new".into())?;
        assert!(tx.commit().is_err());
        assert!(!engine.is_active(id));
        fail.store(false, Ordering::Release);

        let next = engine.begin();
        assert_eq!(map.get(&next, &1)?, Some("old".to_string()));
        assert_eq!(
            map.put(&next, 1, "newer".into())?,
            TxWrite::Done(Some("old".to_string()))
        );
        next.commit()?;
        assert_eq!(map.raw().get(&1)?.and_then(|v| v.lock_owner()), None);
        Ok(())
    }

    #[test]
    fn replication_tie_break_prefers_smallest_name() -> Result<()> {
        let engine = TransactionEngine::open(TransactionConfig::in_memory())?;
        let holder = engine.begin_with(IsolationLevel::ReadCommitted, Some("n2:7".into()));
        let writer = engine.begin_with(IsolationLevel::ReadCommitted, Some("n1:3".into()));
        let conflict = engine.check_replication_conflict(holder.id(), &writer);
        assert_eq!(conflict.kind, ReplicationConflictType::RowLock);
        assert!(conflict.writer_wins);
        assert_eq!(conflict.uncommitted_replication_names.len(), 2);
        assert!(conflict.to_ack(AckResult::Value(None)).is_conflict());

        let plain = engine.begin();
        let conflict = engine.check_replication_conflict(holder.id(), &plain);
        assert!(!conflict.writer_wins);
        assert_eq!(conflict.uncommitted_replication_names, vec!["n2:7".to_string()]);
        Ok(())
    }

    #[test]
    fn repeatable_read_tracking() -> Result<()> {
        let engine = TransactionEngine::open(TransactionConfig::in_memory())?;
        let reader = engine.begin_with(IsolationLevel::RepeatableRead, None);
        let writer = engine.begin();
        assert!(engine.has_other_repeatable_read(writer.id()));
        assert!(!engine.has_other_repeatable_read(reader.id()));
        reader.rollback()?;
        assert!(!engine.has_other_repeatable_read(writer.id()));
        Ok(())
    }

    #[test]
    fn lock_wait_times_out_without_release() -> Result<()> {
        let engine = TransactionEngine::open(TransactionConfig::in_memory())?;
        let seen = engine.lock_generation();
        assert!(!engine.wait_for_unlock(seen, Instant::now() + Duration::from_millis(20)));
        let tx = engine.begin();
        tx.commit()?;
        assert!(engine.wait_for_unlock(seen, Instant::now()));
        Ok(())
    }

    #[test]
    fn finished_transactions_leave_the_active_set() -> Result<()> {
        let engine = TransactionEngine::open(TransactionConfig::in_memory())?;
        let tx = engine.begin();
        let id = tx.id();
        assert!(engine.is_active(id));
        drop(tx);
        assert!(!engine.is_active(id));
        Ok(())
    }

    #[test]
    fn config_parses_from_toml() {
        let config: TransactionConfig = toml::from_str(
            "redo_log_path = \"/tmp/strata/redo.log\"\nlock_wait_timeout_ms = 50\ndefault_isolation = \"repeatable_read\"\n",
        )
        .unwrap();
        assert_eq!(config.lock_wait_timeout_ms, 50);
        assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
        assert!(config.redo_sync);
    }
}
