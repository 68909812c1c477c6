use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::cursor::Cursor;
use super::format::{read_tree, write_tree, ReadContext};
use super::operations::{Append, Get, Put, PutIfAbsent, Remove, Replace, SingleWrite, WriteAction};
use super::page::{ColumnSelection, DynamicInfo, LeafPage, Page, PageBody, PagePtr};
use super::reference::{PageKey, PageReference};
use super::stats::BTreeStats;
use crate::primitives::concurrency::{AsyncHandler, Completion, HandlerPool, PageOperation};
use crate::storage::chunk::ChunkStore;
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::storage::options::{PageStorageMode, ResolvedMapOptions};
use crate::storage::replication::ReplicationChannel;
use crate::types::{HostId, PagePos, Result, StrataError};

/// Receives structural notifications of a map.
///
/// Replication uses them to pick leaves to migrate after the tree changes.
pub trait PageListener<K>: Send + Sync + 'static {
    /// A leaf was split at `split_key`.
    fn on_leaf_split(&self, _map: &str, _split_key: &K) {}
    /// An empty leaf covering `page_key` was detached.
    fn on_leaf_remove(&self, _map: &str, _page_key: &PageKey<K>) {}
}

/// Page counts of the in-memory tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Leaf pages.
    pub leaves: usize,
    /// Node pages.
    pub nodes: usize,
    /// Remote placeholders.
    pub remotes: usize,
    /// Height, 1 for a single leaf.
    pub depth: usize,
}

pub(crate) struct MapCore<K, V> {
    pub(super) name: String,
    pub(super) root: Arc<PageReference<K, V>>,
    pub(super) pool: Arc<HandlerPool>,
    pub(super) store: Arc<dyn ChunkStore>,
    pub(super) split_size: usize,
    pub(super) replication_hosts: Arc<[HostId]>,
    pub(super) local_host: Option<HostId>,
    pub(super) read_only: bool,
    /// Held shared by every leaf mutation, exclusively by whole-tree swaps.
    pub(super) shared_lock: RwLock<()>,
    pub(super) stats: BTreeStats,
    pub(super) rows: AtomicU64,
    storage_mode: RwLock<PageStorageMode>,
    verify_checksums: bool,
    parallel: AtomicBool,
    parallel_lock: Mutex<()>,
    max_key: Mutex<Option<K>>,
    listeners: RwLock<Vec<Arc<dyn PageListener<K>>>>,
    channel: RwLock<Option<Arc<dyn ReplicationChannel>>>,
}

impl<K: KeyCodec, V: ValCodec> MapCore<K, V> {
    /// Follows node pages and split redirects down to the leaf or remote
    /// page covering `key`.
    pub(super) fn descend(
        &self,
        from: Arc<PageReference<K, V>>,
        key: &K,
    ) -> (Arc<PageReference<K, V>>, PagePtr<K, V>) {
        let mut current = from;
        loop {
            let page = current.page();
            if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
                if let Some(node) = tmp.as_node() {
                    current = node.child_for(key).clone();
                    continue;
                }
            }
            let next = match page.as_node() {
                Some(node) => node.child_for(key).clone(),
                None => return (current, page),
            };
            current = next;
        }
    }

    /// Same as [`MapCore::descend`] but always takes the last child.
    pub(super) fn descend_rightmost(&self) -> (Arc<PageReference<K, V>>, PagePtr<K, V>) {
        let mut current = self.root.clone();
        loop {
            let page = current.page();
            if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
                if let Some(last) = tmp.as_node().and_then(|node| node.children().last()) {
                    current = last.clone();
                    continue;
                }
            }
            let next = match page.as_node().and_then(|node| node.children().last()) {
                Some(last) => last.clone(),
                None => return (current, page),
            };
            current = next;
        }
    }

    pub(super) fn is_root(&self, reference: &Arc<PageReference<K, V>>) -> bool {
        Arc::ptr_eq(reference, &self.root)
    }

    pub(super) fn empty_root(&self) -> PagePtr<K, V> {
        Page::leaf(
            self.pool.next_handler(),
            LeafPage::new(Vec::new(), Vec::new(), self.replication_hosts.clone()),
        )
    }

    pub(super) fn parallel_enabled(&self) -> bool {
        self.parallel.load(AtomicOrdering::Acquire)
    }

    pub(super) fn parallel_lock(&self) -> &Mutex<()> {
        &self.parallel_lock
    }

    /// Turns on per-handler execution once the root is a node.
    pub(super) fn enable_parallel_if_needed(&self) {
        if !self.parallel_enabled() && self.root.page().is_node() {
            self.parallel.store(true, AtomicOrdering::Release);
            debug!(map = %self.name, "btree.parallel_enabled");
        }
    }

    pub(super) fn set_max_key(&self, key: &K) {
        let mut max = self.max_key.lock();
        let larger = match max.as_ref() {
            Some(current) => K::compare(key, current).is_gt(),
            None => true,
        };
        if larger {
            *max = Some(key.clone());
        }
    }

    pub(super) fn next_append_key(&self) -> Result<K> {
        let mut max = self.max_key.lock();
        let next = match max.as_ref() {
            Some(current) => K::sequence_next(current),
            None => K::sequence_start(),
        }
        .ok_or(StrataError::Invalid("key type does not support append"))?;
        *max = Some(next.clone());
        Ok(next)
    }

    pub(super) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StrataError::Invalid("map is read-only"));
        }
        Ok(())
    }

    pub(super) fn channel(&self) -> Option<Arc<dyn ReplicationChannel>> {
        self.channel.read().clone()
    }

    pub(super) fn fire_leaf_split(&self, split_key: &K) {
        for listener in self.listeners.read().iter() {
            listener.on_leaf_split(&self.name, split_key);
        }
    }

    pub(super) fn fire_leaf_remove(&self, page_key: &PageKey<K>) {
        for listener in self.listeners.read().iter() {
            listener.on_leaf_remove(&self.name, page_key);
        }
    }

    /// Replaces the whole tree, re-deriving the counters.
    pub(super) fn install_root(&self, page: PagePtr<K, V>) {
        let _exclusive = self.shared_lock.write();
        if let Some(node) = page.as_node() {
            for child in node.children() {
                child.set_parent(&self.root);
            }
        }
        self.rows.store(count_rows(&page), AtomicOrdering::Relaxed);
        *self.max_key.lock() = edge_key(&page, true);
        self.root.replace_page(page);
        self.enable_parallel_if_needed();
    }
}

fn count_rows<K: KeyCodec, V: ValCodec>(page: &PagePtr<K, V>) -> u64 {
    if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
        return count_rows(tmp);
    }
    match page.body() {
        PageBody::Leaf(leaf) => leaf.key_count() as u64,
        PageBody::Node(node) => node.children().iter().map(|c| count_rows(&c.page())).sum(),
        PageBody::Remote(_) => 0,
    }
}

fn edge_key<K: KeyCodec, V: ValCodec>(page: &PagePtr<K, V>, rightmost: bool) -> Option<K> {
    if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
        return edge_key(tmp, rightmost);
    }
    match page.body() {
        PageBody::Leaf(leaf) => {
            if rightmost {
                leaf.keys().last().cloned()
            } else {
                leaf.keys().first().cloned()
            }
        }
        PageBody::Node(node) => {
            let visit = |child: &Arc<PageReference<K, V>>| edge_key(&child.page(), rightmost);
            if rightmost {
                node.children().iter().rev().find_map(visit)
            } else {
                node.children().iter().find_map(visit)
            }
        }
        PageBody::Remote(_) => None,
    }
}

fn shape_of<K: KeyCodec, V: ValCodec>(page: &PagePtr<K, V>, depth: usize, out: &mut TreeShape) {
    if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
        return shape_of(tmp, depth, out);
    }
    out.depth = out.depth.max(depth);
    match page.body() {
        PageBody::Leaf(_) => out.leaves += 1,
        PageBody::Remote(_) => out.remotes += 1,
        PageBody::Node(node) => {
            out.nodes += 1;
            for child in node.children() {
                shape_of(&child.page(), depth + 1, out);
            }
        }
    }
}

/// Concurrent copy-on-write B-tree.
///
/// Every single-key write runs as a page operation on the handler owning the
/// target leaf; reads never block. Cloning yields another handle to the same
/// map.
pub struct BTreeMap<K, V> {
    pub(super) core: Arc<MapCore<K, V>>,
}

impl<K, V> Clone for BTreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K: KeyCodec, V: ValCodec> BTreeMap<K, V> {
    /// Opens the map stored in `store`, or creates an empty one.
    pub fn open(
        name: impl Into<String>,
        store: Arc<dyn ChunkStore>,
        pool: Arc<HandlerPool>,
        options: ResolvedMapOptions,
    ) -> Result<Self> {
        let name = name.into();
        let replication_hosts: Arc<[HostId]> = options.replication_hosts.clone().into();
        let root = match store.root()? {
            Some(pos) => {
                let ctx = ReadContext {
                    store: &store,
                    pool: &pool,
                    verify: options.verify_checksums,
                };
                read_tree(&ctx, pos, PageKey::root())?
            }
            None => PageReference::new(
                Page::leaf(
                    pool.next_handler(),
                    LeafPage::new(Vec::new(), Vec::new(), replication_hosts.clone()),
                ),
                PageKey::root(),
            ),
        };
        let root_page = root.page();
        let rows = count_rows(&root_page);
        let core = MapCore {
            name,
            root,
            pool,
            store,
            split_size: options.page_split_size,
            replication_hosts,
            local_host: options.local_host.clone(),
            read_only: options.read_only,
            shared_lock: RwLock::new(()),
            stats: BTreeStats::default(),
            rows: AtomicU64::new(rows),
            storage_mode: RwLock::new(options.page_storage_mode),
            verify_checksums: options.verify_checksums,
            parallel: AtomicBool::new(root_page.is_node()),
            parallel_lock: Mutex::new(()),
            max_key: Mutex::new(edge_key(&root_page, true)),
            listeners: RwLock::new(Vec::new()),
            channel: RwLock::new(None),
        };
        debug!(map = %core.name, rows, node_root = root_page.is_node(), "btree.opened");
        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Name of the map.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Structural counters.
    pub fn stats(&self) -> &BTreeStats {
        &self.core.stats
    }

    /// Handler pool executing this map's operations.
    pub fn pool(&self) -> &Arc<HandlerPool> {
        &self.core.pool
    }

    /// Current root page instance.
    pub fn root_page(&self) -> PagePtr<K, V> {
        self.core.root.page()
    }

    /// Number of rows stored locally.
    pub fn len(&self) -> u64 {
        self.core.rows.load(AtomicOrdering::Relaxed)
    }

    /// Whether the map holds no local rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether writes run on per-page handlers instead of inline.
    pub fn is_parallel_enabled(&self) -> bool {
        self.core.parallel_enabled()
    }

    /// Layout used by the next [`BTreeMap::save`].
    pub fn page_storage_mode(&self) -> PageStorageMode {
        *self.core.storage_mode.read()
    }

    /// Changes the layout used by later saves.
    pub fn set_page_storage_mode(&self, mode: PageStorageMode) {
        *self.core.storage_mode.write() = mode;
    }

    /// Nodes replicating this map.
    pub fn replication_hosts(&self) -> &[HostId] {
        &self.core.replication_hosts
    }

    /// Registers a structural listener.
    pub fn add_listener(&self, listener: Arc<dyn PageListener<K>>) {
        self.core.listeners.write().push(listener);
    }

    /// Channel used to reach nodes hosting remote key ranges.
    pub fn set_replication_channel(&self, channel: Arc<dyn ReplicationChannel>) {
        *self.core.channel.write() = Some(channel);
    }

    /// Waits until every queued page operation has run.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.core.pool.wait_idle(timeout)
    }

    /// Value stored under `key`.
    ///
    /// Fails with [`StrataError::RemotePage`] when the key range lives on
    /// other nodes.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.read(key, ColumnSelection::All)
    }

    /// Value stored under `key` with only `columns` loaded.
    pub fn get_columns(&self, key: &K, columns: &[usize]) -> Result<Option<V>> {
        self.read(key, ColumnSelection::Only(columns))
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let (_, page) = self.core.descend(self.core.root.clone(), key);
        match page.body() {
            PageBody::Leaf(leaf) => Ok(leaf.search(key).is_ok()),
            PageBody::Remote(remote) => Err(StrataError::RemotePage(remote.hosts().to_vec())),
            PageBody::Node(_) => Err(StrataError::Internal("descent stopped at a node".into())),
        }
    }

    fn read(&self, key: &K, columns: ColumnSelection<'_>) -> Result<Option<V>> {
        let (_, page) = self.core.descend(self.core.root.clone(), key);
        match page.body() {
            PageBody::Leaf(leaf) => match leaf.search(key) {
                Ok(index) => leaf.value(index, columns).map(Some),
                Err(_) => Ok(None),
            },
            PageBody::Remote(remote) => Err(StrataError::RemotePage(remote.hosts().to_vec())),
            PageBody::Node(_) => Err(StrataError::Internal("descent stopped at a node".into())),
        }
    }

    /// Looks `key` up on the handler owning its leaf.
    pub fn get_async(&self, key: K, handler: AsyncHandler<Option<V>>) {
        self.submit(Box::new(Get::new(self.core.clone(), key, handler)));
    }

    /// Inserts or overwrites; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let completion = Completion::new();
        self.put_async(key, value, completion.handler());
        completion.wait()
    }

    /// Asynchronous [`BTreeMap::put`].
    pub fn put_async(&self, key: K, value: V, handler: AsyncHandler<Option<V>>) {
        self.write(key, Put::new(value), handler);
    }

    /// Inserts only when absent; returns the existing value otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let completion = Completion::new();
        self.put_if_absent_async(key, value, completion.handler());
        completion.wait()
    }

    /// Asynchronous [`BTreeMap::put_if_absent`].
    pub fn put_if_absent_async(&self, key: K, value: V, handler: AsyncHandler<Option<V>>) {
        self.write(key, PutIfAbsent::new(value), handler);
    }

    /// Replaces the value only if the current one equals `old`.
    pub fn replace(&self, key: K, old: V, new: V) -> Result<bool> {
        let completion = Completion::new();
        self.replace_async(key, old, new, completion.handler());
        completion.wait()
    }

    /// Asynchronous [`BTreeMap::replace`].
    pub fn replace_async(&self, key: K, old: V, new: V, handler: AsyncHandler<bool>) {
        self.write(key, Replace::new(old, new), handler);
    }

    /// Deletes `key`; returns the removed value.
    pub fn remove(&self, key: K) -> Result<Option<V>> {
        let completion = Completion::new();
        self.remove_async(key, completion.handler());
        completion.wait()
    }

    /// Asynchronous [`BTreeMap::remove`].
    pub fn remove_async(&self, key: K, handler: AsyncHandler<Option<V>>) {
        self.write(key, Remove, handler);
    }

    /// Stores `value` under the next generated key and returns that key.
    pub fn append(&self, value: V) -> Result<K> {
        let completion = Completion::new();
        self.append_async(value, completion.handler());
        completion.wait()
    }

    /// Asynchronous [`BTreeMap::append`].
    pub fn append_async(&self, value: V, handler: AsyncHandler<K>) {
        if let Err(err) = self.core.check_writable() {
            handler(Err(err));
            return;
        }
        match self.core.next_append_key() {
            Ok(key) => self.submit(Box::new(SingleWrite::new(
                self.core.clone(),
                key,
                Append::new(value),
                handler,
            ))),
            Err(err) => handler(Err(err)),
        }
    }

    fn write<W>(&self, key: K, action: W, handler: AsyncHandler<W::Output>)
    where
        W: WriteAction<K, V>,
    {
        if let Err(err) = self.core.check_writable() {
            handler(Err(err));
            return;
        }
        self.submit(Box::new(SingleWrite::new(self.core.clone(), key, action, handler)));
    }

    fn submit(&self, op: Box<dyn PageOperation>) {
        op.run(self.core.pool.current());
    }

    /// Smallest local key.
    pub fn first_key(&self) -> Option<K> {
        edge_key(&self.core.root.page(), false)
    }

    /// Largest local key.
    pub fn last_key(&self) -> Option<K> {
        edge_key(&self.core.root.page(), true)
    }

    /// Ascending cursor starting at `from` (inclusive), or at the first key.
    pub fn cursor(&self, from: Option<K>) -> Cursor<K, V> {
        Cursor::new(self.clone(), from, None)
    }

    /// Cursor loading only `columns` of each value.
    pub fn cursor_columns(&self, from: Option<K>, columns: Vec<usize>) -> Cursor<K, V> {
        Cursor::new(self.clone(), from, Some(columns))
    }

    /// Drops every row.
    pub fn clear(&self) -> Result<()> {
        self.core.check_writable()?;
        let empty = self.core.empty_root();
        self.core.install_root(empty);
        debug!(map = %self.core.name, "btree.cleared");
        Ok(())
    }

    /// Page counts of the current tree.
    pub fn shape(&self) -> TreeShape {
        let mut shape = TreeShape::default();
        shape_of(&self.core.root.page(), 1, &mut shape);
        shape
    }

    /// Writes unsaved pages and records the new root.
    pub fn save(&self) -> Result<PagePos> {
        self.core.check_writable()?;
        let root = self.core.root.page();
        let mode = self.page_storage_mode();
        let pos = write_tree(&*self.core.store, &root, mode)?;
        self.core.store.set_root(pos)?;
        self.core.store.sync()?;
        debug!(map = %self.core.name, pos = pos.0, ?mode, "btree.saved");
        Ok(pos)
    }

    /// Whether page reads verify checksums.
    pub fn verifies_checksums(&self) -> bool {
        self.core.verify_checksums
    }
}

impl<K, V> fmt::Debug for BTreeMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTreeMap")
            .field("name", &self.core.name)
            .field("rows", &self.core.rows.load(AtomicOrdering::Relaxed))
            .finish()
    }
}
