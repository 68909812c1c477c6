//! Low-level building blocks shared by the storage and transaction layers.

/// Big-endian and varint byte codecs.
pub mod bytes;

/// Page-operation handlers, completions and runnable tasks.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;
