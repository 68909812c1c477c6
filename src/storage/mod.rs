//! Storage layer: the concurrent B-tree, its page formats and the registry
//! of maps owned by one node.

/// Concurrent copy-on-write B-tree.
///
/// Leaves are owned by page-operation handlers; the node handler owns the
/// interior pages.
pub mod btree;

/// Page persistence behind each map.
pub mod chunk;

/// In-process cluster transport.
pub mod cluster;

/// Key and value encodings.
pub mod codec;

mod options;

/// Messages exchanged between storage nodes.
pub mod replication;

mod row;
mod store;

pub use btree::{BTreeMap, Cursor, LeafPageMovePlan, PageListener, TreeShape};
pub use chunk::{ChunkStore, FileChunkStore, MemoryChunkStore};
pub use cluster::LocalCluster;
pub use codec::{KeyCodec, ValCodec};
pub use options::{
    MapOptions, PageStorageMode, ResolvedMapOptions, RunMode, StorageConfig,
    DEFAULT_PAGE_SPLIT_SIZE,
};
pub use replication::{
    AckResult, ReplicationChannel, ReplicationConflictType, StorageAck, StorageOp, StorageRequest,
};
pub use row::Row;
pub use store::{DatabaseHook, Storage, StorageMap, SYSTEM_MAP_NAME, TEMP_MAP_PREFIX};
