#![forbid(unsafe_code)]

//! Multi-version transactions over B-tree maps.
//!
//! Rows are stored as [`TransactionalValue`] version chains. Every write
//! takes the row's write lock and appends an [`UndoLogRecord`]; commit
//! writes one redo record per transaction, then publishes the records in
//! write order. Rollback reverts them newest first.

mod engine;
mod map;
/// Redo log file format.
pub mod redo;
mod undo;
mod value;

pub use engine::{
    IsolationLevel, RedoTarget, Transaction, TransactionConfig, TransactionEngine, TxWrite,
    WriteConflict,
};
pub use map::TransactionMap;
pub use redo::{RedoLog, RedoRecord};
pub use undo::{CommitContext, UndoEntry, UndoLog, UndoLogRecord};
pub use value::TransactionalValue;
