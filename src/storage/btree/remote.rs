//! Distributed page ownership: delegation of writes on relocated key
//! ranges, leaf move plans, and root-page replication.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::format::{child_page_key, decode_shipped_page, leaf_row_image, remote_image};
use super::map::{BTreeMap, MapCore};
use super::page::{DynamicInfo, LeafPage, NodePage, Page, PageBody, PagePtr, PageState, RemotePage};
use super::reference::PageReference;
use crate::primitives::bytes::{put_bytes, var, ByteReader};
use crate::primitives::concurrency::{Completion, PageOperation, RunnableOperation};
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::types::{HandlerId, HostId, Result, StrataError};

const ROOT_IS_LEAF: u8 = 0;
const ROOT_IS_NODE: u8 = 1;
const MOVE_PASSES: usize = 16;

/// Pending relocation of one leaf to other nodes.
///
/// While a leaf carries a plan every write to it is forwarded to
/// `replication_hosts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafPageMovePlan {
    /// Node driving the move.
    pub moving_host: HostId,
    /// Nodes that will own the leaf.
    pub replication_hosts: Vec<HostId>,
    /// Election round; a plan only replaces one from an earlier round or
    /// from the same mover.
    pub index: u32,
}

impl LeafPageMovePlan {
    /// First-round plan.
    pub fn new(moving_host: impl Into<HostId>, replication_hosts: Vec<HostId>) -> Self {
        Self {
            moving_host: moving_host.into(),
            replication_hosts,
            index: 0,
        }
    }

    /// Same plan entered in the next election round.
    pub fn next_round(&self) -> Self {
        Self {
            index: self.index + 1,
            ..self.clone()
        }
    }

    fn supersedes(&self, existing: &LeafPageMovePlan) -> bool {
        self.index > existing.index || self.moving_host == existing.moving_host
    }
}

/// Hosts a write on `page` must be forwarded to, if any.
pub(crate) fn delegation_hosts<K, V>(page: &Page<K, V>) -> Option<Vec<HostId>> {
    match page.body() {
        PageBody::Remote(remote) => Some(remote.hosts().to_vec()),
        PageBody::Leaf(leaf) => leaf
            .move_plan
            .as_ref()
            .map(|plan| plan.replication_hosts.clone()),
        PageBody::Node(_) => None,
    }
}

/// Leaf payload of `page` if it is a live leaf.
fn live_leaf<K, V>(page: &PagePtr<K, V>) -> Option<&LeafPage<K, V>> {
    match page.state() {
        PageState::Normal => page.as_leaf(),
        _ => None,
    }
}

/// Writes serialized by the map mutex run off the handler threads; hold the
/// same mutex while the map is in that mode.
fn serial_guard<K: KeyCodec, V: ValCodec>(core: &MapCore<K, V>) -> Option<MutexGuard<'_, ()>> {
    if core.parallel_enabled() {
        None
    } else {
        Some(core.parallel_lock().lock())
    }
}

/// Distinct hosts serving the key range under `page`.
fn subtree_hosts<K: KeyCodec, V: ValCodec>(
    page: &PagePtr<K, V>,
    local: Option<&HostId>,
    out: &mut Vec<HostId>,
) {
    if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
        return subtree_hosts(tmp, local, out);
    }
    let mut add = |host: &HostId| {
        if !out.contains(host) {
            out.push(host.clone());
        }
    };
    match page.body() {
        PageBody::Leaf(leaf) if leaf.replication_hosts().is_empty() => {
            if let Some(local) = local {
                add(local);
            }
        }
        PageBody::Leaf(leaf) => leaf.replication_hosts().iter().for_each(add),
        PageBody::Remote(remote) => remote.hosts().iter().for_each(add),
        PageBody::Node(node) => {
            for child in node.children() {
                subtree_hosts(&child.page(), local, out);
            }
        }
    }
}

fn page_from_shipped<K, V>(body: PageBody<K, V>, handler: HandlerId) -> Result<PagePtr<K, V>> {
    match body {
        PageBody::Leaf(leaf) => Ok(Page::leaf(handler, leaf)),
        PageBody::Remote(remote) => Ok(Page::remote(handler, remote)),
        PageBody::Node(_) => Err(StrataError::Corruption("shipped page is a node")),
    }
}

impl<K: KeyCodec, V: ValCodec> BTreeMap<K, V> {
    /// Runs `task` on handler `target` and waits for its result.
    fn run_on<R, F>(&self, target: HandlerId, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let completion = Completion::new();
        let done = completion.handler();
        let op = RunnableOperation::new(self.core.pool.clone(), target, move || done(task()));
        let current = self.core.pool.current();
        Box::new(op).run(current);
        completion.wait()
    }

    /// Appends the transfer image of the root page.
    ///
    /// A leaf root is shipped whole. A node root is shipped as its keys plus
    /// one remote placeholder per child naming the hosts of that subtree.
    pub fn replicate_root_page(&self, out: &mut Vec<u8>) -> Result<()> {
        let root = self.core.root.page();
        let root = match &*root.dynamic_info() {
            DynamicInfo::Splitted(tmp) => tmp.clone(),
            _ => root.clone(),
        };
        match root.body() {
            PageBody::Leaf(leaf) => {
                out.push(ROOT_IS_LEAF);
                put_bytes(out, &leaf_row_image(leaf)?);
            }
            PageBody::Remote(remote) => {
                out.push(ROOT_IS_LEAF);
                put_bytes(out, &remote_image(remote.hosts()));
            }
            PageBody::Node(node) => {
                out.push(ROOT_IS_NODE);
                var::encode_u64(node.keys().len() as u64, out);
                for key in node.keys() {
                    K::encode_key(key, out);
                }
                for child in node.children() {
                    let mut hosts = Vec::new();
                    subtree_hosts(&child.page(), self.core.local_host.as_ref(), &mut hosts);
                    put_bytes(out, &remote_image(&hosts));
                }
            }
        }
        Ok(())
    }

    /// Replaces the tree with a root page written by
    /// [`BTreeMap::replicate_root_page`] on another node.
    pub fn read_root_page_from(&self, reader: &mut ByteReader<'_>) -> Result<()> {
        self.core.check_writable()?;
        let pool = &self.core.pool;
        let root = match reader.u8()? {
            ROOT_IS_LEAF => page_from_shipped(decode_shipped_page(reader.bytes()?)?, pool.next_handler())?,
            ROOT_IS_NODE => {
                let key_count = reader.var_count()?;
                let mut keys = Vec::with_capacity(key_count.min(1 << 16));
                for _ in 0..key_count {
                    keys.push(K::decode_key(reader)?);
                }
                let mut children = Vec::with_capacity(key_count + 1);
                for index in 0..=key_count {
                    let body = decode_shipped_page(reader.bytes()?)?;
                    let page = page_from_shipped(body, pool.next_handler())?;
                    children.push(PageReference::new(page, child_page_key(&keys, index)));
                }
                Page::node(pool.node_handler(), NodePage::new(keys, children))
            }
            _ => return Err(StrataError::Corruption("unknown root page kind")),
        };
        info!(map = %self.core.name, kind = root.kind_name(), "btree.root_page_received");
        self.core.install_root(root);
        Ok(())
    }

    /// Installs `plan` on the leaf covering `key` and ships the leaf's rows
    /// to the plan's hosts.
    ///
    /// Returns the plan in force afterwards, which is an earlier competing
    /// plan if that one wins the election.
    pub fn plan_leaf_move(&self, key: &K, plan: LeafPageMovePlan) -> Result<Arc<LeafPageMovePlan>> {
        self.core.check_writable()?;
        let channel = self
            .core
            .channel()
            .ok_or(StrataError::Invalid("leaf moves need a replication channel"))?;
        loop {
            let (target, page) = self.core.descend(self.core.root.clone(), key);
            if let PageBody::Remote(remote) = page.body() {
                return Err(StrataError::RemotePage(remote.hosts().to_vec()));
            }
            let core = self.core.clone();
            let channel = channel.clone();
            let plan = plan.clone();
            let outcome = self.run_on(page.handler(), move || {
                let _serial = serial_guard(&core);
                let current = target.page();
                let Some(leaf) = live_leaf(&current) else {
                    return Ok(None);
                };
                if let Some(existing) = &leaf.move_plan {
                    if !plan.supersedes(existing) {
                        return Ok(Some(existing.clone()));
                    }
                }
                let plan = Arc::new(plan);
                let image = leaf_row_image(leaf)?;
                channel.move_leaf_page(&plan.replication_hosts, &core.name, Bytes::from(image))?;
                let planned = leaf.with_move_plan(Some(plan.clone()));
                target.replace_page(Page::leaf(current.handler(), planned));
                debug!(map = %core.name, hosts = ?plan.replication_hosts, "btree.leaf_move_planned");
                Ok(Some(plan))
            })?;
            match outcome {
                Some(plan) => return Ok(plan),
                None => thread::yield_now(),
            }
        }
    }

    /// Replaces the planned leaf covering `key` with a remote placeholder.
    ///
    /// Returns false if the leaf carries no move plan.
    pub fn finalize_leaf_move(&self, key: &K) -> Result<bool> {
        self.core.check_writable()?;
        loop {
            let (target, page) = self.core.descend(self.core.root.clone(), key);
            if page.is_remote() {
                return Ok(false);
            }
            let core = self.core.clone();
            let outcome = self.run_on(page.handler(), move || {
                let _serial = serial_guard(&core);
                let current = target.page();
                let Some(leaf) = live_leaf(&current) else {
                    return Ok(None);
                };
                let Some(plan) = leaf.move_plan.clone() else {
                    return Ok(Some(false));
                };
                let remote = RemotePage::new(plan.replication_hosts.clone());
                target.replace_page(Page::remote(current.handler(), remote));
                core.rows
                    .fetch_sub(leaf.key_count() as u64, AtomicOrdering::Relaxed);
                debug!(map = %core.name, hosts = ?plan.replication_hosts, "btree.leaf_moved");
                Ok(Some(true))
            })?;
            match outcome {
                Some(done) => return Ok(done),
                None => thread::yield_now(),
            }
        }
    }

    /// Ships every local leaf to `hosts` and leaves remote placeholders.
    ///
    /// Returns the number of leaves moved.
    pub fn move_all_local_leaf_pages(&self, hosts: &[HostId]) -> Result<usize> {
        self.core.check_writable()?;
        if hosts.is_empty() {
            return Err(StrataError::Invalid("no target hosts"));
        }
        let channel = self
            .core
            .channel()
            .ok_or(StrataError::Invalid("leaf moves need a replication channel"))?;
        let mut moved = 0;
        for _ in 0..MOVE_PASSES {
            let leaves = self.local_leaves();
            if leaves.is_empty() {
                info!(map = %self.core.name, moved, "btree.local_leaves_moved");
                return Ok(moved);
            }
            for target in leaves {
                let handler = target.page().handler();
                let core = self.core.clone();
                let channel = channel.clone();
                let hosts = hosts.to_vec();
                let done = self.run_on(handler, move || {
                    let _serial = serial_guard(&core);
                    let current = target.page();
                    let Some(leaf) = live_leaf(&current) else {
                        return Ok(false);
                    };
                    if !leaf.is_empty() {
                        let image = leaf_row_image(leaf)?;
                        channel.move_leaf_page(&hosts, &core.name, Bytes::from(image))?;
                    }
                    target.replace_page(Page::remote(current.handler(), RemotePage::new(hosts)));
                    core.rows
                        .fetch_sub(leaf.key_count() as u64, AtomicOrdering::Relaxed);
                    Ok(true)
                })?;
                if done {
                    moved += 1;
                }
            }
            // Let pending splits and removals settle before the next pass.
            self.core.pool.wait_idle(Duration::from_millis(200));
        }
        warn!(map = %self.core.name, moved, "btree.local_leaves_remaining");
        Err(StrataError::Internal(format!(
            "map {} still has local leaves after {MOVE_PASSES} passes",
            self.core.name
        )))
    }

    /// Inserts the rows of a leaf shipped by another node.
    ///
    /// Returns the number of rows received.
    pub fn receive_leaf_page(&self, image: &[u8]) -> Result<usize> {
        let PageBody::Leaf(leaf) = decode_shipped_page::<K, V>(image)? else {
            return Err(StrataError::Corruption("moved page is not a leaf"));
        };
        for (key, value) in leaf.keys().iter().zip(leaf.values.iter()) {
            self.put(key.clone(), value.clone())?;
        }
        debug!(map = %self.core.name, rows = leaf.key_count(), "btree.leaf_received");
        Ok(leaf.key_count())
    }

    /// References of every live local leaf.
    fn local_leaves(&self) -> Vec<Arc<PageReference<K, V>>> {
        fn walk<K: KeyCodec, V>(
            reference: &Arc<PageReference<K, V>>,
            out: &mut Vec<Arc<PageReference<K, V>>>,
        ) {
            let page = reference.page();
            let node = match &*page.dynamic_info() {
                DynamicInfo::Splitted(tmp) => tmp.clone(),
                _ => page.clone(),
            };
            match node.body() {
                PageBody::Node(node) => {
                    for child in node.children() {
                        walk(child, out);
                    }
                }
                PageBody::Leaf(_) => out.push(reference.clone()),
                PageBody::Remote(_) => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.core.root, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_rounds_supersede_competing_plans() {
        let first = LeafPageMovePlan::new("n1", vec!["n3".into()]);
        let rival = LeafPageMovePlan::new("n2", vec!["n4".into()]);
        assert!(!rival.supersedes(&first));
        assert!(rival.next_round().supersedes(&first));
        assert!(first.supersedes(&first));
    }

    #[test]
    fn delegation_targets_follow_page_kind() {
        let remote: PagePtr<u64, u64> =
            Page::remote(HandlerId(0), RemotePage::new(vec!["n2".into()]));
        assert_eq!(delegation_hosts(&remote), Some(vec!["n2".to_string()]));

        let leaf = LeafPage::<u64, u64>::new(vec![1], vec![1], Arc::from(Vec::new()));
        let plain = Page::leaf(HandlerId(0), leaf.with_move_plan(None));
        assert_eq!(delegation_hosts(&plain), None);
        let plan = Arc::new(LeafPageMovePlan::new("n1", vec!["n5".into()]));
        let planned = Page::leaf(HandlerId(0), leaf.with_move_plan(Some(plan)));
        assert_eq!(delegation_hosts(&planned), Some(vec!["n5".to_string()]));
    }
}
