//! Page operations: single-key reads and writes, plus the structural
//! fix-ups (`AddChild`, `RemoveChild`) that run on the node-page handler.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::thread;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::map::MapCore;
use super::page::{
    ColumnSelection, DynamicInfo, LeafPage, NodePage, Page, PageBody, PagePtr, PageState,
    TmpNodePage,
};
use super::reference::{PageKey, PageReference};
use super::remote;
use crate::primitives::concurrency::{AsyncHandler, PageOperation, PageOperationResult};
use crate::storage::codec::{key_from_bytes, key_to_bytes, value_from_bytes, value_to_bytes};
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::storage::replication::{StorageAck, StorageOp, StorageRequest};
use crate::types::{HandlerId, HostId, Result, StrataError};

type Ref<K, V> = Arc<PageReference<K, V>>;

/// Point lookup executed on the handler owning the leaf.
pub(crate) struct Get<K, V> {
    core: Arc<MapCore<K, V>>,
    key: K,
    handler: AsyncHandler<Option<V>>,
    located: bool,
}

impl<K: KeyCodec, V: ValCodec> Get<K, V> {
    pub(crate) fn new(core: Arc<MapCore<K, V>>, key: K, handler: AsyncHandler<Option<V>>) -> Self {
        Self {
            core,
            key,
            handler,
            located: false,
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PageOperation for Get<K, V> {
    fn run(mut self: Box<Self>, current: Option<HandlerId>) -> PageOperationResult {
        let (_, page) = self.core.descend(self.core.root.clone(), &self.key);
        if !self.located && current != Some(page.handler()) {
            self.located = true;
            let pool = self.core.pool.clone();
            pool.dispatch(page.handler(), self);
            return PageOperationResult::Shifted;
        }
        let result = match page.body() {
            PageBody::Leaf(leaf) => match leaf.search(&self.key) {
                Ok(index) => leaf.value(index, ColumnSelection::All).map(Some),
                Err(_) => Ok(None),
            },
            PageBody::Remote(remote) => Err(StrataError::RemotePage(remote.hosts().to_vec())),
            PageBody::Node(_) => Err(StrataError::Internal("descent stopped at a node".into())),
        };
        (self.handler)(result);
        PageOperationResult::Succeeded
    }
}

/// Leaf produced by a local write.
pub(crate) enum LeafWrite<K, V> {
    /// Nothing changed.
    Unchanged,
    /// A new row was added.
    Inserted(LeafPage<K, V>),
    /// An existing row changed value.
    Updated(LeafPage<K, V>),
    /// A row was deleted.
    Removed(LeafPage<K, V>),
}

/// Behaviour of one single-key write kind.
pub(crate) trait WriteAction<K: KeyCodec, V: ValCodec>: Send + 'static {
    /// Value reported to the caller.
    type Output: Send + 'static;

    /// Whether the target leaf is the right-most one.
    fn rightmost(&self) -> bool {
        false
    }

    /// Position of `key` in `leaf`.
    fn key_index(&self, leaf: &LeafPage<K, V>, key: &K) -> std::result::Result<usize, usize> {
        leaf.search(key)
    }

    /// Applies the write to a copy of `leaf`.
    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, Self::Output)>;

    /// Equivalent request for the nodes hosting a remote key range.
    fn remote_op(&self, key: &K) -> StorageOp;

    /// Decodes the acknowledgement of [`WriteAction::remote_op`].
    fn from_ack(ack: StorageAck) -> Result<Self::Output>;
}

/// Insert or overwrite.
pub(crate) struct Put<V> {
    value: Option<V>,
}

impl<V> Put<V> {
    pub(crate) fn new(value: V) -> Self {
        Self { value: Some(value) }
    }
}

fn take_value<V>(slot: &mut Option<V>) -> Result<V> {
    slot.take()
        .ok_or_else(|| StrataError::Internal("write value consumed twice".into()))
}

fn decode_previous<V: ValCodec>(ack: StorageAck) -> Result<Option<V>> {
    ack.into_value()?
        .map(|raw| value_from_bytes(&raw))
        .transpose()
}

impl<K: KeyCodec, V: ValCodec> WriteAction<K, V> for Put<V> {
    type Output = Option<V>;

    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, Option<V>)> {
        let value = take_value(&mut self.value)?;
        Ok(match index {
            Ok(i) => {
                let old = leaf.values[i].clone();
                (LeafWrite::Updated(leaf.with_value(i, value)), Some(old))
            }
            Err(i) => (LeafWrite::Inserted(leaf.with_inserted(i, key.clone(), value)), None),
        })
    }

    fn remote_op(&self, key: &K) -> StorageOp {
        StorageOp::Put {
            key: key_to_bytes(key),
            value: self.value.as_ref().map(value_to_bytes).unwrap_or_default(),
        }
    }

    fn from_ack(ack: StorageAck) -> Result<Option<V>> {
        decode_previous(ack)
    }
}

/// Insert only when absent.
pub(crate) struct PutIfAbsent<V> {
    value: Option<V>,
}

impl<V> PutIfAbsent<V> {
    pub(crate) fn new(value: V) -> Self {
        Self { value: Some(value) }
    }
}

impl<K: KeyCodec, V: ValCodec> WriteAction<K, V> for PutIfAbsent<V> {
    type Output = Option<V>;

    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, Option<V>)> {
        Ok(match index {
            Ok(i) => (LeafWrite::Unchanged, Some(leaf.values[i].clone())),
            Err(i) => {
                let value = take_value(&mut self.value)?;
                (LeafWrite::Inserted(leaf.with_inserted(i, key.clone(), value)), None)
            }
        })
    }

    fn remote_op(&self, key: &K) -> StorageOp {
        StorageOp::PutIfAbsent {
            key: key_to_bytes(key),
            value: self.value.as_ref().map(value_to_bytes).unwrap_or_default(),
        }
    }

    fn from_ack(ack: StorageAck) -> Result<Option<V>> {
        decode_previous(ack)
    }
}

/// Compare-and-replace.
pub(crate) struct Replace<V> {
    old: V,
    new: Option<V>,
}

impl<V> Replace<V> {
    pub(crate) fn new(old: V, new: V) -> Self {
        Self {
            old,
            new: Some(new),
        }
    }
}

impl<K: KeyCodec, V: ValCodec> WriteAction<K, V> for Replace<V> {
    type Output = bool;

    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        _key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, bool)> {
        let Ok(i) = index else {
            return Ok((LeafWrite::Unchanged, false));
        };
        if !V::same_value(&leaf.values[i], &self.old) {
            return Ok((LeafWrite::Unchanged, false));
        }
        let value = take_value(&mut self.new)?;
        Ok((LeafWrite::Updated(leaf.with_value(i, value)), true))
    }

    fn remote_op(&self, key: &K) -> StorageOp {
        StorageOp::Replace {
            key: key_to_bytes(key),
            old_value: value_to_bytes(&self.old),
            new_value: self.new.as_ref().map(value_to_bytes).unwrap_or_default(),
        }
    }

    fn from_ack(ack: StorageAck) -> Result<bool> {
        ack.into_replaced()
    }
}

/// Delete.
pub(crate) struct Remove;

impl<K: KeyCodec, V: ValCodec> WriteAction<K, V> for Remove {
    type Output = Option<V>;

    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        _key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, Option<V>)> {
        Ok(match index {
            Ok(i) => {
                let old = leaf.values[i].clone();
                (LeafWrite::Removed(leaf.with_removed(i)), Some(old))
            }
            Err(_) => (LeafWrite::Unchanged, None),
        })
    }

    fn remote_op(&self, key: &K) -> StorageOp {
        StorageOp::Remove {
            key: key_to_bytes(key),
        }
    }

    fn from_ack(ack: StorageAck) -> Result<Option<V>> {
        decode_previous(ack)
    }
}

/// Insert under a generated key at the end of the map.
pub(crate) struct Append<V> {
    value: Option<V>,
}

impl<V> Append<V> {
    pub(crate) fn new(value: V) -> Self {
        Self { value: Some(value) }
    }
}

impl<K: KeyCodec, V: ValCodec> WriteAction<K, V> for Append<V> {
    type Output = K;

    fn rightmost(&self) -> bool {
        true
    }

    fn key_index(&self, leaf: &LeafPage<K, V>, key: &K) -> std::result::Result<usize, usize> {
        // A concurrent put may already have stored a larger key.
        match leaf.keys().last() {
            Some(last) if K::compare(last, key).is_ge() => leaf.search(key),
            _ => Err(leaf.key_count()),
        }
    }

    fn write_local(
        &mut self,
        leaf: &LeafPage<K, V>,
        key: &K,
        index: std::result::Result<usize, usize>,
    ) -> Result<(LeafWrite<K, V>, K)> {
        let value = take_value(&mut self.value)?;
        Ok(match index {
            Ok(i) => (LeafWrite::Updated(leaf.with_value(i, value)), key.clone()),
            Err(i) => (
                LeafWrite::Inserted(leaf.with_inserted(i, key.clone(), value)),
                key.clone(),
            ),
        })
    }

    fn remote_op(&self, _key: &K) -> StorageOp {
        StorageOp::Append {
            value: self.value.as_ref().map(value_to_bytes).unwrap_or_default(),
        }
    }

    fn from_ack(ack: StorageAck) -> Result<K> {
        key_from_bytes(&ack.into_key()?)
    }
}

/// Single-key write routed to the handler owning its leaf.
pub(crate) struct SingleWrite<K: KeyCodec, V: ValCodec, W: WriteAction<K, V>> {
    core: Arc<MapCore<K, V>>,
    key: K,
    action: W,
    handler: Option<AsyncHandler<W::Output>>,
    target: Option<Ref<K, V>>,
}

impl<K: KeyCodec, V: ValCodec, W: WriteAction<K, V>> SingleWrite<K, V, W> {
    pub(crate) fn new(
        core: Arc<MapCore<K, V>>,
        key: K,
        action: W,
        handler: AsyncHandler<W::Output>,
    ) -> Self {
        Self {
            core,
            key,
            action,
            handler: Some(handler),
            target: None,
        }
    }

    fn finish(&mut self, result: Result<W::Output>) {
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
    }

    fn locate(&self) -> (Ref<K, V>, PagePtr<K, V>) {
        if self.action.rightmost() {
            self.core.descend_rightmost()
        } else {
            self.core.descend(self.core.root.clone(), &self.key)
        }
    }

    fn write(mut self: Box<Self>, current: Option<HandlerId>, shift: bool) -> PageOperationResult {
        loop {
            // A cached reference may now hold a split page or, for the root
            // reference, a node; descending again resolves both.
            let (target, page) = match self.target.take() {
                Some(target) => self.core.descend(target, &self.key),
                None => self.locate(),
            };

            if let Some(hosts) = remote::delegation_hosts(&page) {
                self.write_remote(hosts);
                return PageOperationResult::Shifted;
            }

            if shift && current != Some(page.handler()) {
                self.target = Some(target);
                self.core.stats.inc_shifted();
                let pool = self.core.pool.clone();
                pool.dispatch(page.handler(), self);
                return PageOperationResult::Shifted;
            }

            match page.state() {
                PageState::Removed => {
                    self.core.stats.inc_restarts();
                    thread::yield_now();
                    continue;
                }
                PageState::Removing => {
                    if !page.transition(PageState::Removing, DynamicInfo::Normal) {
                        self.core.stats.inc_restarts();
                        continue;
                    }
                    trace!(map = %self.core.name, "btree.removal_cancelled");
                }
                PageState::Splitted => {
                    self.target = Some(target);
                    continue;
                }
                PageState::Normal => {}
            }
            return self.apply(target, page);
        }
    }

    fn apply(mut self: Box<Self>, target: Ref<K, V>, page: PagePtr<K, V>) -> PageOperationResult {
        let Some(leaf) = page.as_leaf() else {
            self.finish(Err(StrataError::Internal("write reached a non-leaf page".into())));
            return PageOperationResult::Succeeded;
        };
        let materialized;
        let leaf = if leaf.has_lazy_columns() {
            match leaf.materialized() {
                Ok(full) => {
                    materialized = full;
                    &materialized
                }
                Err(err) => {
                    self.finish(Err(err));
                    return PageOperationResult::Succeeded;
                }
            }
        } else {
            leaf
        };

        let core = self.core.clone();
        let (change, output) = {
            let _shared = core.shared_lock.read();
            let index = self.action.key_index(leaf, &self.key);
            match self.action.write_local(leaf, &self.key, index) {
                Ok(done) => done,
                Err(err) => {
                    drop(_shared);
                    self.finish(Err(err));
                    return PageOperationResult::Succeeded;
                }
            }
        };

        let handler = page.handler();
        let mut split_candidate = None;
        match change {
            LeafWrite::Unchanged => {}
            LeafWrite::Updated(new_leaf) => {
                target.replace_page(Page::leaf(handler, new_leaf));
            }
            LeafWrite::Inserted(new_leaf) => {
                let new_page = Page::leaf(handler, new_leaf);
                target.replace_page(new_page.clone());
                core.rows.fetch_add(1, AtomicOrdering::Relaxed);
                core.set_max_key(&self.key);
                split_candidate = Some(new_page);
            }
            LeafWrite::Removed(new_leaf) => {
                let empty = new_leaf.is_empty();
                let new_page = Page::leaf(handler, new_leaf);
                core.rows.fetch_sub(1, AtomicOrdering::Relaxed);
                if empty && !core.is_root(&target) {
                    new_page.set_dynamic_info(DynamicInfo::Removing);
                    target.replace_page(new_page.clone());
                    let task = RemoveChild {
                        core: core.clone(),
                        leaf: target.clone(),
                        page: new_page,
                        key: self.key.clone(),
                    };
                    core.pool.dispatch(core.pool.node_handler(), Box::new(task));
                } else {
                    target.replace_page(new_page);
                }
            }
        }

        // The caller is answered before any structural fix-up.
        self.finish(Ok(output));

        match split_candidate {
            Some(page) if page.needs_split(core.split_size) => {
                split_leaf(&core, &target, &page);
                PageOperationResult::Splitting
            }
            _ => PageOperationResult::Succeeded,
        }
    }

    fn write_remote(&mut self, hosts: Vec<HostId>) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        let Some(channel) = self.core.channel() else {
            handler(Err(StrataError::RemotePage(hosts)));
            return;
        };
        self.core.stats.inc_remote_writes();
        let request = StorageRequest::new(
            self.core.name.clone(),
            self.action.remote_op(&self.key),
        );
        trace!(map = %self.core.name, op = request.op.name(), ?hosts, "btree.remote_write");
        channel.send(
            &hosts,
            request,
            Box::new(move |ack| handler(ack.and_then(W::from_ack))),
        );
    }
}

impl<K: KeyCodec, V: ValCodec, W: WriteAction<K, V>> PageOperation for SingleWrite<K, V, W> {
    fn run(self: Box<Self>, current: Option<HandlerId>) -> PageOperationResult {
        // While the root is a single leaf every write would queue on one
        // handler; run inline under the map mutex instead.
        if !self.core.parallel_enabled() {
            let core = self.core.clone();
            let _serial = core.parallel_lock().lock();
            if !core.parallel_enabled() {
                let outcome = self.write(current, false);
                core.enable_parallel_if_needed();
                return outcome;
            }
        }
        self.write(current, true)
    }
}

fn split_key_marker<K>(key: &K, first: bool) -> PageKey<K>
where
    K: Clone,
{
    PageKey {
        key: Some(key.clone()),
        first,
    }
}

fn split_leaf<K: KeyCodec, V: ValCodec>(core: &Arc<MapCore<K, V>>, target: &Ref<K, V>, page: &PagePtr<K, V>) {
    let Some(leaf) = page.as_leaf() else {
        return;
    };
    let at = leaf.key_count() / 2;
    let key = leaf.keys()[at].clone();
    let (left, right) = leaf.split(at);
    let left = PageReference::new(Page::leaf(page.handler(), left), split_key_marker(&key, true));
    let right = PageReference::new(
        Page::leaf(core.pool.next_handler(), right),
        split_key_marker(&key, false),
    );
    let parent = Page::node(
        core.pool.node_handler(),
        NodePage::new(vec![key.clone()], vec![left.clone(), right.clone()]),
    );
    let tmp = TmpNodePage {
        parent,
        left,
        right,
        key,
    };
    core.stats.inc_leaf_splits();

    if core.is_root(target) {
        tmp.left.set_parent(&core.root);
        tmp.right.set_parent(&core.root);
        core.root.replace_page(tmp.parent.clone());
        page.set_dynamic_info(DynamicInfo::Splitted(tmp.parent));
        core.stats.inc_root_splits();
        debug!(map = %core.name, "btree.root_split");
        return;
    }

    if let Some(parent) = target.parent() {
        tmp.left.set_parent(&parent);
        tmp.right.set_parent(&parent);
    }
    let split_key = tmp.key.clone();
    let redirect = tmp.parent.clone();
    // AddChild must be queued before the old page redirects: a half split
    // again right away queues its own AddChild, which has to come second.
    core.pool.dispatch(
        core.pool.node_handler(),
        Box::new(AddChild {
            core: core.clone(),
            old: target.clone(),
            tmp,
        }),
    );
    page.set_dynamic_info(DynamicInfo::Splitted(redirect));
    trace!(map = %core.name, key = ?split_key, "btree.leaf_split");
    core.fire_leaf_split(&split_key);
}

/// Links the halves of a split leaf into the parent node.
pub(crate) struct AddChild<K, V> {
    core: Arc<MapCore<K, V>>,
    old: Ref<K, V>,
    tmp: TmpNodePage<K, V>,
}

impl<K: KeyCodec, V: ValCodec> PageOperation for AddChild<K, V> {
    fn run(self: Box<Self>, _current: Option<HandlerId>) -> PageOperationResult {
        let AddChild { core, old, tmp } = *self;
        link_split(&core, &old, tmp.key, tmp.left, tmp.right);
        PageOperationResult::Succeeded
    }
}

/// Node holding `child`, its page and the child's index.
fn find_parent<K: KeyCodec, V: ValCodec>(
    core: &MapCore<K, V>,
    child: &Ref<K, V>,
    key: &K,
) -> Option<(Ref<K, V>, PagePtr<K, V>, usize)> {
    if let Some(parent) = child.parent() {
        let page = parent.page();
        if let Some(index) = page.as_node().and_then(|node| node.position_of(child)) {
            return Some((parent, page, index));
        }
    }
    let mut current = core.root.clone();
    loop {
        let page = current.page();
        let node = page.as_node()?;
        if let Some(index) = node.position_of(child) {
            return Some((current, page, index));
        }
        let next = node.child_for(key).clone();
        current = next;
    }
}

fn link_split<K: KeyCodec, V: ValCodec>(
    core: &Arc<MapCore<K, V>>,
    old: &Ref<K, V>,
    key: K,
    left: Ref<K, V>,
    right: Ref<K, V>,
) {
    let Some((parent_ref, parent_page, index)) = find_parent(core, old, &key) else {
        warn!(map = %core.name, ?key, "btree.add_child_parent_missing");
        return;
    };
    let Some(node) = parent_page.as_node() else {
        return;
    };
    left.set_parent(&parent_ref);
    right.set_parent(&parent_ref);
    let updated = Page::node(
        core.pool.node_handler(),
        node.with_split_child(index, key, left, right),
    );
    parent_ref.replace_page(updated.clone());
    if updated.needs_split(core.split_size) {
        split_node(core, &parent_ref, &updated);
    }
}

fn split_node<K: KeyCodec, V: ValCodec>(
    core: &Arc<MapCore<K, V>>,
    node_ref: &Ref<K, V>,
    page: &PagePtr<K, V>,
) {
    let Some(node) = page.as_node() else {
        return;
    };
    let at = node.keys().len() / 2;
    let (left, key, right) = node.split(at);
    let node_handler = core.pool.node_handler();
    let left = PageReference::new(Page::node(node_handler, left), split_key_marker(&key, true));
    let right = PageReference::new(Page::node(node_handler, right), split_key_marker(&key, false));
    for half in [&left, &right] {
        let half_page = half.page();
        if let Some(half_node) = half_page.as_node() {
            for child in half_node.children() {
                child.set_parent(half);
            }
        }
    }
    core.stats.inc_node_splits();

    if core.is_root(node_ref) {
        left.set_parent(&core.root);
        right.set_parent(&core.root);
        let root = Page::node(node_handler, NodePage::new(vec![key], vec![left, right]));
        core.root.replace_page(root);
        core.stats.inc_root_splits();
        debug!(map = %core.name, "btree.root_node_split");
        return;
    }
    trace!(map = %core.name, key = ?key, "btree.node_split");
    link_split(core, node_ref, key, left, right);
}

/// Detaches an emptied leaf from the tree.
pub(crate) struct RemoveChild<K, V> {
    core: Arc<MapCore<K, V>>,
    leaf: Ref<K, V>,
    page: PagePtr<K, V>,
    key: K,
}

impl<K: KeyCodec, V: ValCodec> PageOperation for RemoveChild<K, V> {
    fn run(self: Box<Self>, _current: Option<HandlerId>) -> PageOperationResult {
        self.remove();
        PageOperationResult::Succeeded
    }
}

impl<K: KeyCodec, V: ValCodec> RemoveChild<K, V> {
    fn remove(&self) {
        let core = &self.core;
        // A put that arrived after the delete revives the leaf.
        if self.page.state() != PageState::Removing || !Arc::ptr_eq(&self.leaf.page(), &self.page) {
            return;
        }

        let mut path: SmallVec<[(Ref<K, V>, PagePtr<K, V>); 8]> = SmallVec::new();
        let mut current = core.root.clone();
        let mut child_index = loop {
            let page = current.page();
            let Some(node) = page.as_node() else {
                warn!(map = %core.name, "btree.remove_child_detached");
                return;
            };
            let found = node.position_of(&self.leaf);
            let next = node.child_for(&self.key).clone();
            path.push((current, page));
            if let Some(index) = found {
                break index;
            }
            current = next;
        };

        // Walk up to the first ancestor that keeps at least one child.
        let mut replacement = None;
        while let Some((reference, page)) = path.pop() {
            let Some(node) = page.as_node() else {
                return;
            };
            if node.children().len() > 1 {
                let without = node.without_child(child_index);
                replacement = Some((reference, Page::node(core.pool.node_handler(), without)));
                break;
            }
            match path.last() {
                Some((_, parent)) => {
                    let Some(index) = parent.as_node().and_then(|p| p.position_of(&reference)) else {
                        warn!(map = %core.name, "btree.remove_child_path_changed");
                        return;
                    };
                    child_index = index;
                }
                None => {
                    replacement = Some((reference, core.empty_root()));
                }
            }
        }
        let Some((reference, page)) = replacement else {
            return;
        };

        if !self.page.transition(PageState::Removing, DynamicInfo::Removed) {
            core.stats.inc_abandoned_removals();
            debug!(map = %core.name, "btree.remove_child_abandoned");
            return;
        }
        reference.replace_page(page);
        core.stats.inc_removed_leaves();
        trace!(map = %core.name, key = ?self.leaf.page_key().key, "btree.leaf_removed");
        core.fire_leaf_remove(self.leaf.page_key());
    }
}
