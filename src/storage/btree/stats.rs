use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Point-in-time copy of [`BTreeStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Leaf pages split.
    pub leaf_splits: u64,
    /// Node pages split.
    pub node_splits: u64,
    /// Splits that installed a new root.
    pub root_splits: u64,
    /// Operations handed to another handler.
    pub shifted_operations: u64,
    /// Writes delegated to remote nodes.
    pub remote_writes: u64,
    /// Writes that restarted from the root after hitting a removed leaf.
    pub restarts: u64,
    /// Empty leaves detached from their parent.
    pub removed_leaves: u64,
    /// Leaf removals abandoned because a writer revived the leaf.
    pub abandoned_removals: u64,
}

/// Structural counters of one map.
#[derive(Default)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    node_splits: AtomicU64,
    root_splits: AtomicU64,
    shifted_operations: AtomicU64,
    remote_writes: AtomicU64,
    restarts: AtomicU64,
    removed_leaves: AtomicU64,
    abandoned_removals: AtomicU64,
}

impl BTreeStats {
    /// Leaf pages split so far.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Node pages split so far.
    pub fn node_splits(&self) -> u64 {
        self.node_splits.load(AtomicOrdering::Relaxed)
    }

    /// Empty leaves detached so far.
    pub fn removed_leaves(&self) -> u64 {
        self.removed_leaves.load(AtomicOrdering::Relaxed)
    }

    /// Leaf removals abandoned so far.
    pub fn abandoned_removals(&self) -> u64 {
        self.abandoned_removals.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_splits(&self) {
        self.node_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_shifted(&self) {
        self.shifted_operations
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_remote_writes(&self) {
        self.remote_writes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_restarts(&self) {
        self.restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_removed_leaves(&self) {
        self.removed_leaves.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_abandoned_removals(&self) {
        self.abandoned_removals
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            node_splits: self.node_splits(),
            root_splits: self.root_splits.load(AtomicOrdering::Relaxed),
            shifted_operations: self.shifted_operations.load(AtomicOrdering::Relaxed),
            remote_writes: self.remote_writes.load(AtomicOrdering::Relaxed),
            restarts: self.restarts.load(AtomicOrdering::Relaxed),
            removed_leaves: self.removed_leaves(),
            abandoned_removals: self.abandoned_removals(),
        }
    }

    /// Emits the counters as one tracing event.
    pub fn emit_tracing(&self, map: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "strata_btree::stats",
            map,
            leaf_splits = snapshot.leaf_splits,
            node_splits = snapshot.node_splits,
            root_splits = snapshot.root_splits,
            shifted_operations = snapshot.shifted_operations,
            remote_writes = snapshot.remote_writes,
            restarts = snapshot.restarts,
            removed_leaves = snapshot.removed_leaves,
            abandoned_removals = snapshot.abandoned_removals,
            "btree stats snapshot"
        );
    }
}
