//! In-memory page model.
//!
//! Pages are immutable once published: every mutation builds a new page
//! instance which is then swapped into its [`PageReference`]. The only
//! mutable parts of a published page are its [`DynamicInfo`] cell and the
//! chunk position recorded after it is saved.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::format::LazyColumns;
use super::reference::PageReference;
use super::remote::LeafPageMovePlan;
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::types::{HandlerId, HostId, PagePos, Result};

/// Shared handle to a page instance.
pub type PagePtr<K, V> = Arc<Page<K, V>>;

/// Fixed estimated overhead of any page.
pub const PAGE_MEMORY: usize = 128;
/// Estimated cost of one child slot in a node page.
pub const CHILD_MEMORY: usize = 32;

/// Structural state of a page instance.
pub enum DynamicInfo<K, V> {
    /// Live page.
    Normal,
    /// Leaf is empty and awaiting removal from its parent.
    Removing,
    /// Leaf has been detached; writers must restart from the root.
    Removed,
    /// Page was split; the payload is the temporary parent whose two
    /// children hold the new halves.
    Splitted(PagePtr<K, V>),
}

/// Payload-free view of [`DynamicInfo`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageState {
    /// See [`DynamicInfo::Normal`].
    Normal,
    /// See [`DynamicInfo::Removing`].
    Removing,
    /// See [`DynamicInfo::Removed`].
    Removed,
    /// See [`DynamicInfo::Splitted`].
    Splitted,
}

impl<K, V> DynamicInfo<K, V> {
    /// Discriminant of this state.
    pub fn state(&self) -> PageState {
        match self {
            DynamicInfo::Normal => PageState::Normal,
            DynamicInfo::Removing => PageState::Removing,
            DynamicInfo::Removed => PageState::Removed,
            DynamicInfo::Splitted(_) => PageState::Splitted,
        }
    }
}

/// One page instance.
pub struct Page<K, V> {
    handler: HandlerId,
    body: PageBody<K, V>,
    info: ArcSwap<DynamicInfo<K, V>>,
    pos: AtomicU64,
}

/// Variant payload of a page.
pub enum PageBody<K, V> {
    /// Rows.
    Leaf(LeafPage<K, V>),
    /// Split keys and children.
    Node(NodePage<K, V>),
    /// Placeholder for a key range hosted on other nodes.
    Remote(RemotePage),
}

impl<K, V> Page<K, V> {
    fn with_body(handler: HandlerId, body: PageBody<K, V>) -> PagePtr<K, V> {
        Arc::new(Self {
            handler,
            body,
            info: ArcSwap::from_pointee(DynamicInfo::Normal),
            pos: AtomicU64::new(0),
        })
    }

    /// New leaf page pinned to `handler`.
    pub fn leaf(handler: HandlerId, leaf: LeafPage<K, V>) -> PagePtr<K, V> {
        Self::with_body(handler, PageBody::Leaf(leaf))
    }

    /// New node page pinned to `handler`.
    pub fn node(handler: HandlerId, node: NodePage<K, V>) -> PagePtr<K, V> {
        Self::with_body(handler, PageBody::Node(node))
    }

    /// New remote placeholder.
    pub fn remote(handler: HandlerId, remote: RemotePage) -> PagePtr<K, V> {
        Self::with_body(handler, PageBody::Remote(remote))
    }

    /// Handler owning this page.
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Variant payload.
    pub fn body(&self) -> &PageBody<K, V> {
        &self.body
    }

    /// Leaf payload, if this is a leaf.
    pub fn as_leaf(&self) -> Option<&LeafPage<K, V>> {
        match &self.body {
            PageBody::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Node payload, if this is a node.
    pub fn as_node(&self) -> Option<&NodePage<K, V>> {
        match &self.body {
            PageBody::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Whether this page is a node.
    pub fn is_node(&self) -> bool {
        matches!(self.body, PageBody::Node(_))
    }

    /// Whether this page is a remote placeholder.
    pub fn is_remote(&self) -> bool {
        matches!(self.body, PageBody::Remote(_))
    }

    /// Short name of the variant.
    pub fn kind_name(&self) -> &'static str {
        match self.body {
            PageBody::Leaf(_) => "leaf",
            PageBody::Node(_) => "node",
            PageBody::Remote(_) => "remote",
        }
    }

    /// Current structural state.
    pub fn dynamic_info(&self) -> Arc<DynamicInfo<K, V>> {
        self.info.load_full()
    }

    /// Discriminant of the current structural state.
    pub fn state(&self) -> PageState {
        self.info.load().state()
    }

    pub(crate) fn set_dynamic_info(&self, info: DynamicInfo<K, V>) {
        self.info.store(Arc::new(info));
    }

    /// Atomically moves from `from` to `to`.
    ///
    /// Returns false if the page was not in state `from`.
    pub(crate) fn transition(&self, from: PageState, to: DynamicInfo<K, V>) -> bool {
        let to = Arc::new(to);
        loop {
            let current = self.info.load_full();
            if current.state() != from {
                return false;
            }
            let previous = self.info.compare_and_swap(&current, to.clone());
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
        }
    }

    /// Chunk position, [`PagePos::UNSAVED`] until written.
    pub fn pos(&self) -> PagePos {
        PagePos(self.pos.load(AtomicOrdering::Acquire))
    }

    pub(crate) fn set_pos(&self, pos: PagePos) {
        self.pos.store(pos.0, AtomicOrdering::Release);
    }

    /// Estimated in-memory size.
    pub fn memory(&self) -> usize {
        match &self.body {
            PageBody::Leaf(leaf) => leaf.memory,
            PageBody::Node(node) => node.memory,
            PageBody::Remote(remote) => PAGE_MEMORY + remote.hosts.len() * 32,
        }
    }

    /// Whether this page is over the split threshold and can be split.
    pub fn needs_split(&self, split_size: usize) -> bool {
        let splittable = match &self.body {
            PageBody::Leaf(leaf) => leaf.keys.len() > 1,
            PageBody::Node(node) => node.keys.len() > 2,
            PageBody::Remote(_) => false,
        };
        splittable && self.memory() > split_size
    }
}

/// Binary search with the map comparator.
pub(crate) fn search<K: KeyCodec>(keys: &[K], key: &K) -> std::result::Result<usize, usize> {
    keys.binary_search_by(|probe| K::compare(probe, key))
}

/// Which columns a read should load.
#[derive(Copy, Clone, Debug)]
pub enum ColumnSelection<'a> {
    /// Every column.
    All,
    /// Only the listed column indexes.
    Only(&'a [usize]),
}

/// Sorted rows of one leaf.
pub struct LeafPage<K, V> {
    pub(crate) keys: Arc<[K]>,
    pub(crate) values: Arc<[V]>,
    pub(crate) columns: Option<Arc<LazyColumns>>,
    pub(crate) replication_hosts: Arc<[HostId]>,
    pub(crate) move_plan: Option<Arc<LeafPageMovePlan>>,
    pub(crate) memory: usize,
}

impl<K: KeyCodec, V: ValCodec> LeafPage<K, V> {
    /// Leaf over already sorted keys.
    pub fn new(keys: Vec<K>, values: Vec<V>, replication_hosts: Arc<[HostId]>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(K::memory).sum::<usize>()
            + values.iter().map(V::memory).sum::<usize>();
        Self {
            keys: keys.into(),
            values: values.into(),
            columns: None,
            replication_hosts,
            move_plan: None,
            memory,
        }
    }

    /// Leaf with no rows.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Arc::from(Vec::new()))
    }

    /// Number of rows.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Whether the leaf holds no rows.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sorted keys.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Nodes replicating this key range.
    pub fn replication_hosts(&self) -> &[HostId] {
        &self.replication_hosts
    }

    /// Pending relocation, if any.
    pub fn move_plan(&self) -> Option<&LeafPageMovePlan> {
        self.move_plan.as_deref()
    }

    /// Position of `key`: `Ok(index)` if present, `Err(insertion point)` if not.
    pub fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        search(&self.keys, key)
    }

    /// Whether some column data still lives only in column pages.
    pub fn has_lazy_columns(&self) -> bool {
        self.columns.is_some()
    }

    /// Value at `index` with the selected columns loaded.
    pub fn value(&self, index: usize, columns: ColumnSelection<'_>) -> Result<V> {
        let mut value = self.values[index].clone();
        if let Some(lazy) = &self.columns {
            match columns {
                ColumnSelection::All => {
                    for column in 0..lazy.column_count() {
                        lazy.fill(&mut value, index, column)?;
                    }
                }
                ColumnSelection::Only(list) => {
                    for &column in list {
                        if column < lazy.column_count() {
                            lazy.fill(&mut value, index, column)?;
                        }
                    }
                }
            }
        }
        Ok(value)
    }

    /// Copy with every column loaded, detached from its column pages.
    pub fn materialized(&self) -> Result<Self> {
        let Some(lazy) = &self.columns else {
            return Ok(self.shallow_copy());
        };
        let mut values = Vec::with_capacity(self.values.len());
        for (index, meta) in self.values.iter().enumerate() {
            let mut value = meta.clone();
            for column in 0..lazy.column_count() {
                lazy.fill(&mut value, index, column)?;
            }
            values.push(value);
        }
        let mut leaf = Self::new(self.keys.to_vec(), values, self.replication_hosts.clone());
        leaf.keys = self.keys.clone();
        leaf.move_plan = self.move_plan.clone();
        Ok(leaf)
    }

    fn shallow_copy(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            values: self.values.clone(),
            columns: self.columns.clone(),
            replication_hosts: self.replication_hosts.clone(),
            move_plan: self.move_plan.clone(),
            memory: self.memory,
        }
    }

    /// Copy with `key`/`value` inserted at `index`.
    pub fn with_inserted(&self, index: usize, key: K, value: V) -> Self {
        let memory = self.memory + K::memory(&key) + V::memory(&value);
        let mut keys = Vec::with_capacity(self.keys.len() + 1);
        keys.extend_from_slice(&self.keys[..index]);
        keys.push(key);
        keys.extend_from_slice(&self.keys[index..]);
        let mut values = Vec::with_capacity(self.values.len() + 1);
        values.extend_from_slice(&self.values[..index]);
        values.push(value);
        values.extend_from_slice(&self.values[index..]);
        Self {
            keys: keys.into(),
            values: values.into(),
            columns: None,
            replication_hosts: self.replication_hosts.clone(),
            move_plan: self.move_plan.clone(),
            memory,
        }
    }

    /// Copy with the value at `index` replaced; keys are shared.
    pub fn with_value(&self, index: usize, value: V) -> Self {
        let memory = self.memory - V::memory(&self.values[index]) + V::memory(&value);
        let mut values = self.values.to_vec();
        values[index] = value;
        Self {
            keys: self.keys.clone(),
            values: values.into(),
            columns: None,
            replication_hosts: self.replication_hosts.clone(),
            move_plan: self.move_plan.clone(),
            memory,
        }
    }

    /// Copy without the row at `index`.
    pub fn with_removed(&self, index: usize) -> Self {
        let memory =
            self.memory - K::memory(&self.keys[index]) - V::memory(&self.values[index]);
        let mut keys = self.keys.to_vec();
        keys.remove(index);
        let mut values = self.values.to_vec();
        values.remove(index);
        Self {
            keys: keys.into(),
            values: values.into(),
            columns: None,
            replication_hosts: self.replication_hosts.clone(),
            move_plan: self.move_plan.clone(),
            memory,
        }
    }

    /// Copy carrying a relocation plan.
    pub fn with_move_plan(&self, plan: Option<Arc<LeafPageMovePlan>>) -> Self {
        let mut leaf = self.shallow_copy();
        leaf.move_plan = plan;
        leaf
    }

    /// Splits at `at`: the left half keeps rows `[0, at)`.
    pub fn split(&self, at: usize) -> (Self, Self) {
        let left = Self::new(
            self.keys[..at].to_vec(),
            self.values[..at].to_vec(),
            self.replication_hosts.clone(),
        );
        let right = Self::new(
            self.keys[at..].to_vec(),
            self.values[at..].to_vec(),
            self.replication_hosts.clone(),
        );
        (left, right)
    }
}

/// Split keys and `keys + 1` children.
pub struct NodePage<K, V> {
    pub(crate) keys: Arc<[K]>,
    pub(crate) children: Arc<[Arc<PageReference<K, V>>]>,
    pub(crate) memory: usize,
}

impl<K: KeyCodec, V> NodePage<K, V> {
    /// Node over `keys` and `children`.
    pub fn new(keys: Vec<K>, children: Vec<Arc<PageReference<K, V>>>) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(K::memory).sum::<usize>()
            + children.len() * CHILD_MEMORY;
        Self {
            keys: keys.into(),
            children: children.into(),
            memory,
        }
    }

    /// Split keys.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Child references.
    pub fn children(&self) -> &[Arc<PageReference<K, V>>] {
        &self.children
    }

    /// Index of the child covering `key`.
    pub fn child_index(&self, key: &K) -> usize {
        match search(&self.keys, key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Child covering `key`.
    pub fn child_for(&self, key: &K) -> &Arc<PageReference<K, V>> {
        &self.children[self.child_index(key)]
    }

    /// Index of `child` among the children, by identity.
    pub fn position_of(&self, child: &Arc<PageReference<K, V>>) -> Option<usize> {
        self.children.iter().position(|c| Arc::ptr_eq(c, child))
    }

    /// Copy where child `index` is replaced by `left` and `right` split at `key`.
    pub fn with_split_child(
        &self,
        index: usize,
        key: K,
        left: Arc<PageReference<K, V>>,
        right: Arc<PageReference<K, V>>,
    ) -> Self {
        let mut keys = self.keys.to_vec();
        keys.insert(index, key);
        let mut children = self.children.to_vec();
        children[index] = left;
        children.insert(index + 1, right);
        Self::new(keys, children)
    }

    /// Copy without child `index` and the split key that bounded it.
    pub fn without_child(&self, index: usize) -> Self {
        let mut keys = self.keys.to_vec();
        if !keys.is_empty() {
            keys.remove(index.saturating_sub(1));
        }
        let mut children = self.children.to_vec();
        children.remove(index);
        Self::new(keys, children)
    }

    /// Splits at key `at`, which moves up to the parent.
    pub fn split(&self, at: usize) -> (Self, K, Self) {
        let left = Self::new(self.keys[..at].to_vec(), self.children[..=at].to_vec());
        let right = Self::new(
            self.keys[at + 1..].to_vec(),
            self.children[at + 1..].to_vec(),
        );
        (left, self.keys[at].clone(), right)
    }
}

/// Placeholder for rows hosted elsewhere.
#[derive(Clone, Debug)]
pub struct RemotePage {
    pub(crate) hosts: Arc<[HostId]>,
}

impl RemotePage {
    /// Placeholder pointing at `hosts`.
    pub fn new(hosts: Vec<HostId>) -> Self {
        Self {
            hosts: hosts.into(),
        }
    }

    /// Nodes hosting the key range.
    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }
}

/// Result of splitting a page: a parent node that is not yet linked into the
/// tree, plus the references of its two halves.
pub(crate) struct TmpNodePage<K, V> {
    pub(crate) parent: PagePtr<K, V>,
    pub(crate) left: Arc<PageReference<K, V>>,
    pub(crate) right: Arc<PageReference<K, V>>,
    pub(crate) key: K,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::reference::PageKey;

    fn leaf(keys: &[u64]) -> LeafPage<u64, u64> {
        LeafPage::new(
            keys.to_vec(),
            keys.iter().map(|k| k * 10).collect(),
            Arc::from(Vec::new()),
        )
    }

    #[test]
    fn leaf_copies_leave_original_untouched() {
        let base = leaf(&[1, 3, 5]);
        let inserted = base.with_inserted(1, 2, 20);
        assert_eq!(base.keys(), &[1, 3, 5]);
        assert_eq!(inserted.keys(), &[1, 2, 3, 5]);
        assert!(inserted.memory > base.memory);

        let updated = base.with_value(2, 99);
        assert!(Arc::ptr_eq(&updated.keys, &base.keys));
        assert_eq!(updated.values[2], 99);
        assert_eq!(base.values[2], 50);

        let removed = base.with_removed(0);
        assert_eq!(removed.keys(), &[3, 5]);
        assert_eq!(removed.memory, base.memory - 32);
    }

    #[test]
    fn leaf_split_conserves_rows() {
        let base = leaf(&[1, 2, 3, 4, 5]);
        let (left, right) = base.split(2);
        assert_eq!(left.keys(), &[1, 2]);
        assert_eq!(right.keys(), &[3, 4, 5]);
        assert_eq!(left.key_count() + right.key_count(), base.key_count());
    }

    #[test]
    fn dynamic_info_transitions_are_exclusive() {
        let page = Page::leaf(HandlerId(0), leaf(&[1]));
        assert_eq!(page.state(), PageState::Normal);
        assert!(page.transition(PageState::Normal, DynamicInfo::Removing));
        assert!(!page.transition(PageState::Normal, DynamicInfo::Removed));
        assert!(page.transition(PageState::Removing, DynamicInfo::Normal));
        assert!(!page.transition(PageState::Removing, DynamicInfo::Removed));
        assert_eq!(page.state(), PageState::Normal);
    }

    #[test]
    fn node_child_index_follows_split_keys() {
        let refs: Vec<_> = (0..3)
            .map(|_| PageReference::new(Page::leaf(HandlerId(0), leaf(&[])), PageKey::root()))
            .collect();
        let node: NodePage<u64, u64> = NodePage::new(vec![10, 20], refs);
        assert_eq!(node.child_index(&5), 0);
        assert_eq!(node.child_index(&10), 1);
        assert_eq!(node.child_index(&19), 1);
        assert_eq!(node.child_index(&25), 2);

        let without_first = node.without_child(0);
        assert_eq!(without_first.keys(), &[20]);
        let without_last = node.without_child(2);
        assert_eq!(without_last.keys(), &[10]);
    }

    #[test]
    fn node_split_moves_middle_key_up() {
        let refs: Vec<_> = (0..5)
            .map(|_| PageReference::new(Page::leaf(HandlerId(0), leaf(&[])), PageKey::root()))
            .collect();
        let node: NodePage<u64, u64> = NodePage::new(vec![10, 20, 30, 40], refs);
        let (left, key, right) = node.split(2);
        assert_eq!(key, 30);
        assert_eq!(left.keys(), &[10, 20]);
        assert_eq!(left.children().len(), 3);
        assert_eq!(right.keys(), &[40]);
        assert_eq!(right.children().len(), 2);
    }
}
