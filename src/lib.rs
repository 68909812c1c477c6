//! Concurrent copy-on-write B-tree storage core with multi-version
//! transactions.
//!
//! * [`storage`]: the B-tree, its page formats, chunk stores and the map
//!   registry of a node, including remote page delegation.
//! * [`txn`]: transactional values, undo and redo logs, the transaction
//!   engine and transactional maps.
//! * [`primitives`]: byte codecs, positioned file I/O and the page-operation
//!   handler pool.

#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;

pub use config::Config;
pub use types::{HostId, Result, StrataError, TxId};
