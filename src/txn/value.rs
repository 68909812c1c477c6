use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::IsolationLevel;
use crate::primitives::bytes::ByteReader;
use crate::storage::codec::ValCodec;
use crate::types::{Result, StrataError, TxId};

const TOMBSTONE: u8 = 0;
const PRESENT: u8 = 1;
const VERSION_MEMORY: usize = 48;

struct VersionState<V> {
    lock_owner: Option<TxId>,
    commit_stamp: u64,
    previous: Option<TransactionalValue<V>>,
}

struct Version<V> {
    value: Option<V>,
    tid: TxId,
    state: Mutex<VersionState<V>>,
}

/// One version of a row as stored in a transactional map.
///
/// The raw value is immutable; an absent value is a tombstone. While the
/// writing transaction is open the version carries its write lock and links
/// to the version it replaced. Handles are cheap to clone and compare by
/// identity, so a compare-and-replace on the map succeeds only against the
/// exact version a writer observed.
pub struct TransactionalValue<V>(Arc<Version<V>>);

impl<V> Clone for TransactionalValue<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V: ValCodec> TransactionalValue<V> {
    /// Already committed version, as loaded from disk or the redo log.
    pub fn committed(value: Option<V>, stamp: u64) -> Self {
        Self(Arc::new(Version {
            value,
            tid: TxId::BOOTSTRAP,
            state: Mutex::new(VersionState {
                lock_owner: None,
                commit_stamp: stamp,
                previous: None,
            }),
        }))
    }

    /// Version written by `tid`, locked until it commits or rolls back.
    pub fn uncommitted(tid: TxId, value: Option<V>, previous: Option<Self>) -> Self {
        Self(Arc::new(Version {
            value,
            tid,
            state: Mutex::new(VersionState {
                lock_owner: Some(tid),
                commit_stamp: 0,
                previous,
            }),
        }))
    }

    /// Raw value; `None` for a tombstone.
    pub fn value(&self) -> Option<&V> {
        self.0.value.as_ref()
    }

    /// Returns true for a delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.0.value.is_none()
    }

    /// Transaction that wrote this version.
    pub fn tid(&self) -> TxId {
        self.0.tid
    }

    /// Transaction holding the write lock, if any.
    pub fn lock_owner(&self) -> Option<TxId> {
        self.0.state.lock().lock_owner
    }

    /// Stamp assigned at commit; zero while uncommitted.
    pub fn commit_stamp(&self) -> u64 {
        self.0.state.lock().commit_stamp
    }

    /// Version this one replaced.
    pub fn previous(&self) -> Option<Self> {
        self.0.state.lock().previous.clone()
    }

    /// Returns true when both handles refer to the same version.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Publishes the version at `stamp` and releases its lock.
    ///
    /// Older versions written by the same transaction are published at the
    /// same stamp. The link to older versions is dropped unless a
    /// repeatable-read reader may still need it.
    pub fn commit(&self, stamp: u64, keep_history: bool) -> Self {
        let mut shadowed = {
            let mut state = self.0.state.lock();
            state.lock_owner = None;
            state.commit_stamp = stamp;
            if keep_history {
                state.previous.clone()
            } else {
                state.previous.take()
            }
        };
        while let Some(version) = shadowed {
            let mut state = version.0.state.lock();
            if state.lock_owner != Some(self.0.tid) {
                break;
            }
            state.lock_owner = None;
            state.commit_stamp = stamp;
            shadowed = state.previous.clone();
        }
        self.clone()
    }

    /// Cuts the chain below the newest version visible at `horizon`; no
    /// snapshot taken at or after `horizon` can reach past it.
    pub fn prune_history(&self, horizon: u64) {
        let mut current = self.clone();
        loop {
            let next = {
                let mut state = current.0.state.lock();
                if state.lock_owner.is_none() && state.commit_stamp <= horizon {
                    state.previous = None;
                    return;
                }
                state.previous.clone()
            };
            match next {
                Some(version) => current = version,
                None => return,
            }
        }
    }

    /// Releases the write lock without publishing anything.
    pub fn release(&self) {
        self.0.state.lock().lock_owner = None;
    }

    /// Version visible to `reader`, walking back through versions locked by
    /// other transactions and, under repeatable read, versions committed
    /// after the reader started.
    pub fn visible_version(
        &self,
        reader: TxId,
        isolation: IsolationLevel,
        start_stamp: u64,
    ) -> Option<Self> {
        let mut current = self.clone();
        loop {
            let next = {
                let state = current.0.state.lock();
                match state.lock_owner {
                    Some(owner) if owner == reader => return Some(current.clone()),
                    Some(_) => state.previous.clone(),
                    None if isolation == IsolationLevel::RepeatableRead
                        && state.commit_stamp > start_stamp =>
                    {
                        state.previous.clone()
                    }
                    None => return Some(current.clone()),
                }
            };
            current = next?;
        }
    }

    /// Newest version without a write lock.
    pub fn last_committed(&self) -> Option<Self> {
        let mut current = self.clone();
        loop {
            let next = {
                let state = current.0.state.lock();
                if state.lock_owner.is_none() {
                    return Some(current.clone());
                }
                state.previous.clone()
            };
            current = next?;
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for TransactionalValue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("TransactionalValue")
            .field("value", &self.0.value)
            .field("tid", &self.0.tid)
            .field("lock_owner", &state.lock_owner)
            .field("commit_stamp", &state.commit_stamp)
            .field("has_previous", &state.previous.is_some())
            .finish()
    }
}

/// Stores the newest committed version only; uncommitted versions never
/// reach disk.
impl<V: ValCodec> ValCodec for TransactionalValue<V> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        match value.last_committed().as_ref().and_then(Self::value) {
            Some(raw) => {
                out.push(PRESENT);
                V::encode_val(raw, out);
            }
            None => out.push(TOMBSTONE),
        }
    }

    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
        let value = match src.u8()? {
            TOMBSTONE => None,
            PRESENT => Some(V::decode_val(src)?),
            _ => return Err(StrataError::Corruption("bad transactional value tag")),
        };
        Ok(Self::committed(value, 0))
    }

    fn memory(value: &Self) -> usize {
        VERSION_MEMORY + value.value().map_or(0, V::memory)
    }

    fn same_value(a: &Self, b: &Self) -> bool {
        a.ptr_eq(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{value_from_bytes, value_to_bytes};

    #[test]
    fn other_writers_see_previous_version() {
        let base = TransactionalValue::committed(Some(1u64), 1);
        let pending = TransactionalValue::uncommitted(TxId(7), Some(2u64), Some(base.clone()));

        let own = pending.visible_version(TxId(7), IsolationLevel::ReadCommitted, 1);
        assert_eq!(own.and_then(|v| v.value().copied()), Some(2));
        let other = pending.visible_version(TxId(8), IsolationLevel::ReadCommitted, 1);
        assert_eq!(other.and_then(|v| v.value().copied()), Some(1));

        let fresh = TransactionalValue::uncommitted(TxId(7), Some(5u64), None);
        assert!(fresh
            .visible_version(TxId(8), IsolationLevel::ReadCommitted, 1)
            .is_none());
    }

    #[test]
    fn repeatable_read_skips_later_commits() {
        let base = TransactionalValue::committed(Some(1u64), 1);
        let update = TransactionalValue::uncommitted(TxId(3), Some(2u64), Some(base));
        update.commit(5, true);

        let early = update.visible_version(TxId(9), IsolationLevel::RepeatableRead, 4);
        assert_eq!(early.and_then(|v| v.value().copied()), Some(1));
        let late = update.visible_version(TxId(9), IsolationLevel::RepeatableRead, 5);
        assert_eq!(late.and_then(|v| v.value().copied()), Some(2));
        let committed = update.visible_version(TxId(9), IsolationLevel::ReadCommitted, 0);
        assert_eq!(committed.and_then(|v| v.value().copied()), Some(2));
    }

    #[test]
    fn commit_without_history_drops_the_chain() {
        let base = TransactionalValue::committed(Some(1u64), 1);
        let update = TransactionalValue::uncommitted(TxId(3), Some(2u64), Some(base));
        update.commit(2, false);
        assert!(update.previous().is_none());
        assert_eq!(update.lock_owner(), None);
        assert_eq!(update.commit_stamp(), 2);
    }

    #[test]
    fn commit_publishes_own_shadowed_versions() {
        let base = TransactionalValue::committed(Some(1u64), 1);
        let deleted = TransactionalValue::uncommitted(TxId(3), None, Some(base));
        let reinserted = TransactionalValue::uncommitted(TxId(3), Some(2u64), Some(deleted.clone()));
        reinserted.commit(4, true);
        assert_eq!(deleted.lock_owner(), None);
        assert_eq!(deleted.commit_stamp(), 4);
        let old = reinserted.visible_version(TxId(9), IsolationLevel::RepeatableRead, 3);
        assert_eq!(old.and_then(|v| v.value().copied()), Some(1));
    }

    #[test]
    fn pruning_keeps_versions_visible_at_the_horizon() {
        let first = TransactionalValue::committed(Some(1u64), 1);
        let second = TransactionalValue::uncommitted(TxId(2), Some(2u64), Some(first));
        second.commit(3, true);
        let third = TransactionalValue::uncommitted(TxId(4), Some(3u64), Some(second.clone()));
        third.commit(5, true);

        third.prune_history(3);
        assert!(second.previous().is_none());
        let at_horizon = third.visible_version(TxId(9), IsolationLevel::RepeatableRead, 3);
        assert_eq!(at_horizon.and_then(|v| v.value().copied()), Some(2));
        let before = third.visible_version(TxId(9), IsolationLevel::RepeatableRead, 1);
        assert!(before.is_none());
    }

    #[test]
    fn encoding_keeps_last_committed_value() -> Result<()> {
        let base = TransactionalValue::committed(Some("old".to_string()), 1);
        let pending =
            TransactionalValue::uncommitted(TxId(4), Some("new".to_string()), Some(base));
        let decoded: TransactionalValue<String> = value_from_bytes(&value_to_bytes(&pending))?;
        assert_eq!(decoded.value().map(String::as_str), Some("old"));
        assert_eq!(decoded.lock_owner(), None);

        let orphan = TransactionalValue::uncommitted(TxId(4), Some("x".to_string()), None);
        let decoded: TransactionalValue<String> = value_from_bytes(&value_to_bytes(&orphan))?;
        assert!(decoded.is_tombstone());
        Ok(())
    }

    #[test]
    fn same_value_is_identity() {
        let a = TransactionalValue::committed(Some(1u64), 1);
        let b = TransactionalValue::committed(Some(1u64), 1);
        assert!(<TransactionalValue<u64> as ValCodec>::same_value(&a, &a.clone()));
        assert!(!<TransactionalValue<u64> as ValCodec>::same_value(&a, &b));
    }
}
