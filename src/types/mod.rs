#![forbid(unsafe_code)]
//! Identifiers shared across the crate and the crate-wide error type.

/// Page and record checksums.
pub mod checksum;

use std::fmt;

/// Identifier of a page-operation handler thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poh-{}", self.0)
    }
}

/// Byte position of a serialized page inside a chunk store.
///
/// Position zero is reserved for the chunk header and means "not written yet".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PagePos(pub u64);

impl PagePos {
    /// Marker for pages that have never been written.
    pub const UNSAVED: PagePos = PagePos(0);

    /// Returns true once the page has a stored image.
    pub fn is_saved(self) -> bool {
        self.0 != 0
    }
}

/// Transaction identifier handed out by the transaction engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u64);

impl TxId {
    /// Id carried by values that were loaded or replicated already committed.
    pub const BOOTSTRAP: TxId = TxId(0);
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Identifier of a cluster node, usually `host:port`.
pub type HostId = String;

/// Errors produced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A stored page or log record could not be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A stored page failed checksum verification.
    #[error("checksum mismatch at {pos}: expected {expected:#010x}, found {actual:#010x}")]
    Checksum {
        /// Chunk position of the page.
        pos: u64,
        /// Checksum recorded in the page header.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
    /// No map is registered under the name.
    #[error("map not found: {0}")]
    MapNotFound(String),
    /// A map was reopened with different key or value types.
    #[error("map {0} is already open with different key/value types")]
    MapTypeMismatch(String),
    /// The key range lives on other nodes.
    #[error("key range is hosted remotely on {0:?}")]
    RemotePage(Vec<HostId>),
    /// A remote node reported a failure.
    #[error("remote: {0}")]
    Remote(String),
    /// The handler pool has shut down.
    #[error("page operation handlers are shut down")]
    Shutdown,
    /// Configuration could not be parsed or is inconsistent.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;
