#![forbid(unsafe_code)]

//! Concurrent copy-on-write B-tree.
//!
//! Every leaf is owned by one page-operation handler; writes are routed to
//! that handler and never take a lock on the page itself. Node pages are
//! only mutated on the dedicated node handler.

mod cursor;
/// Serialized page layout.
pub mod format;
mod map;
mod operations;
/// In-memory page model.
pub mod page;
mod reference;
mod remote;
mod stats;

pub use cursor::Cursor;
pub use format::{census, PageCensus};
pub use map::{BTreeMap, PageListener, TreeShape};
pub use page::{DynamicInfo, PageState};
pub use reference::{PageKey, PageReference};
pub use remote::LeafPageMovePlan;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
