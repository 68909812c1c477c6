//! Payloads exchanged with other storage nodes.
//!
//! Only the semantic content of each request is modelled here; framing and
//! transport belong to whatever implements [`ReplicationChannel`].

use bytes::Bytes;

use crate::primitives::concurrency::AsyncHandler;
use crate::types::{HostId, Result, StrataError};

/// Classification of a disagreement between replica writers.
///
/// Local writers only ever report [`ReplicationConflictType::RowLock`]. The
/// other kinds keep their wire codes so acks from peers that detect them
/// decode unchanged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReplicationConflictType {
    /// No conflict.
    #[default]
    None,
    /// Another transaction holds the row lock.
    RowLock,
    /// Another transaction holds a lock on the database object.
    DbObjectLock,
    /// Two writers generated the same append key.
    Append,
}

impl ReplicationConflictType {
    /// Stable single-byte code.
    pub fn code(self) -> u8 {
        match self {
            ReplicationConflictType::None => 0,
            ReplicationConflictType::RowLock => 1,
            ReplicationConflictType::DbObjectLock => 2,
            ReplicationConflictType::Append => 3,
        }
    }

    /// Inverse of [`ReplicationConflictType::code`].
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ReplicationConflictType::None,
            1 => ReplicationConflictType::RowLock,
            2 => ReplicationConflictType::DbObjectLock,
            3 => ReplicationConflictType::Append,
            _ => return Err(StrataError::Corruption("unknown replication conflict code")),
        })
    }
}

/// Single-key operation carried by a [`StorageRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageOp {
    /// Insert or overwrite.
    Put {
        /// Encoded key.
        key: Bytes,
        /// Encoded value.
        value: Bytes,
    },
    /// Insert only when the key is absent.
    PutIfAbsent {
        /// Encoded key.
        key: Bytes,
        /// Encoded value.
        value: Bytes,
    },
    /// Compare-and-replace.
    Replace {
        /// Encoded key.
        key: Bytes,
        /// Value expected to be current.
        old_value: Bytes,
        /// Value to install.
        new_value: Bytes,
    },
    /// Delete.
    Remove {
        /// Encoded key.
        key: Bytes,
    },
    /// Insert under a key generated by the receiver.
    Append {
        /// Encoded value.
        value: Bytes,
    },
}

impl StorageOp {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            StorageOp::Put { .. } => "put",
            StorageOp::PutIfAbsent { .. } => "put_if_absent",
            StorageOp::Replace { .. } => "replace",
            StorageOp::Remove { .. } => "remove",
            StorageOp::Append { .. } => "append",
        }
    }
}

/// Write addressed to the nodes hosting a key range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRequest {
    /// Target map.
    pub map_name: String,
    /// Operation and its payload.
    pub op: StorageOp,
    /// Whether the write belongs to a distributed transaction.
    pub is_distributed_transaction: bool,
    /// Replication session name of the writer, if replicated.
    pub replication_name: Option<String>,
}

impl StorageRequest {
    /// Plain non-transactional request.
    pub fn new(map_name: impl Into<String>, op: StorageOp) -> Self {
        Self {
            map_name: map_name.into(),
            op,
            is_distributed_transaction: false,
            replication_name: None,
        }
    }

    /// Marks the request as part of a distributed transaction.
    pub fn distributed(mut self, replication_name: impl Into<String>) -> Self {
        self.is_distributed_transaction = true;
        self.replication_name = Some(replication_name.into());
        self
    }
}

/// Result payload of a [`StorageAck`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckResult {
    /// Previous (or existing) value for put, put-if-absent and remove.
    Value(Option<Bytes>),
    /// Outcome of a replace.
    Replaced(bool),
    /// Key generated by an append.
    Key(Bytes),
}

/// Acknowledgement of a [`StorageRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageAck {
    /// Operation result.
    pub result: AckResult,
    /// Conflict seen by the receiver.
    pub conflict: ReplicationConflictType,
    /// Replication participants that have not committed yet.
    pub uncommitted_replication_names: Vec<String>,
}

impl StorageAck {
    /// Conflict-free acknowledgement.
    pub fn ok(result: AckResult) -> Self {
        Self {
            result,
            conflict: ReplicationConflictType::None,
            uncommitted_replication_names: Vec::new(),
        }
    }

    /// Acknowledgement reporting a conflict.
    pub fn conflict(
        result: AckResult,
        conflict: ReplicationConflictType,
        uncommitted_replication_names: Vec<String>,
    ) -> Self {
        Self {
            result,
            conflict,
            uncommitted_replication_names,
        }
    }

    /// Key generated by an append.
    pub fn generated_key(&self) -> Option<&Bytes> {
        match &self.result {
            AckResult::Key(key) => Some(key),
            _ => None,
        }
    }

    /// Whether the receiver reported a conflict.
    pub fn is_conflict(&self) -> bool {
        self.conflict != ReplicationConflictType::None
    }

    pub(crate) fn into_value(self) -> Result<Option<Bytes>> {
        match self.result {
            AckResult::Value(value) => Ok(value),
            other => Err(unexpected(&other, "value")),
        }
    }

    pub(crate) fn into_replaced(self) -> Result<bool> {
        match self.result {
            AckResult::Replaced(replaced) => Ok(replaced),
            other => Err(unexpected(&other, "replace outcome")),
        }
    }

    pub(crate) fn into_key(self) -> Result<Bytes> {
        match self.result {
            AckResult::Key(key) => Ok(key),
            other => Err(unexpected(&other, "generated key")),
        }
    }
}

fn unexpected(result: &AckResult, wanted: &str) -> StrataError {
    StrataError::Remote(format!("expected {wanted} in ack, got {result:?}"))
}

/// Transport between storage nodes.
pub trait ReplicationChannel: Send + Sync + 'static {
    /// Delivers `request` to `hosts` and reports the acknowledgement.
    fn send(&self, hosts: &[HostId], request: StorageRequest, handler: AsyncHandler<StorageAck>);

    /// Ships a root-page transfer buffer to `hosts`.
    fn replicate_pages(&self, hosts: &[HostId], pages: Bytes) -> Result<()>;

    /// Ships the row image of one leaf of `map_name` to `hosts`.
    fn move_leaf_page(&self, hosts: &[HostId], map_name: &str, page: Bytes) -> Result<()>;
}

/// Winner among competing replication sessions: the smallest name.
pub fn replication_winner<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().min()
}
