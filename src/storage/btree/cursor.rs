use std::collections::VecDeque;

use tracing::trace;

use super::map::BTreeMap;
use super::page::{ColumnSelection, DynamicInfo, LeafPage, PageBody};
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::types::Result;

/// Ascending iterator over the local rows of a [`BTreeMap`].
///
/// The cursor holds no locks. Each leaf is located by a fresh descent from
/// the root, so concurrent splits and removals are tolerated: a row is
/// never returned twice, and rows inserted behind the cursor are skipped.
/// Key ranges hosted on other nodes are skipped.
pub struct Cursor<K, V> {
    map: BTreeMap<K, V>,
    /// Inclusive lower bound of the next leaf to visit.
    seek: Option<K>,
    /// Last key returned.
    last: Option<K>,
    columns: Option<Vec<usize>>,
    buffer: VecDeque<(K, V)>,
    done: bool,
}

impl<K: KeyCodec, V: ValCodec> Cursor<K, V> {
    pub(crate) fn new(map: BTreeMap<K, V>, from: Option<K>, columns: Option<Vec<usize>>) -> Self {
        Self {
            map,
            seek: from,
            last: None,
            columns,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Buffers the rows of the next leaf and advances `seek` past it.
    fn load_leaf(&mut self) -> Result<()> {
        let mut upper: Option<K> = None;
        let mut current = self.map.core.root.page();
        loop {
            let page = match &*current.dynamic_info() {
                DynamicInfo::Splitted(tmp) => tmp.clone(),
                _ => current.clone(),
            };
            match page.body() {
                PageBody::Node(node) => {
                    let index = match &self.seek {
                        Some(key) => node.child_index(key),
                        None => 0,
                    };
                    if let Some(bound) = node.keys().get(index) {
                        upper = Some(bound.clone());
                    }
                    current = node.children()[index].page();
                }
                PageBody::Leaf(leaf) => {
                    let selection = match &self.columns {
                        Some(columns) => ColumnSelection::Only(columns),
                        None => ColumnSelection::All,
                    };
                    collect_rows(
                        leaf,
                        self.seek.as_ref(),
                        self.last.as_ref(),
                        selection,
                        &mut self.buffer,
                    )?;
                    break;
                }
                PageBody::Remote(remote) => {
                    trace!(map = %self.map.core.name, hosts = ?remote.hosts(), "btree.cursor_skip_remote");
                    break;
                }
            }
        }
        match upper {
            Some(bound) => self.seek = Some(bound),
            None => self.done = true,
        }
        Ok(())
    }
}

fn collect_rows<K: KeyCodec, V: ValCodec>(
    leaf: &LeafPage<K, V>,
    seek: Option<&K>,
    last: Option<&K>,
    columns: ColumnSelection<'_>,
    out: &mut VecDeque<(K, V)>,
) -> Result<()> {
    let start = match seek {
        Some(key) => leaf.search(key).unwrap_or_else(|insert_at| insert_at),
        None => 0,
    };
    for (index, key) in leaf.keys().iter().enumerate().skip(start) {
        if last.is_some_and(|last| K::compare(key, last).is_le()) {
            continue;
        }
        out.push_back((key.clone(), leaf.value(index, columns)?));
    }
    Ok(())
}

impl<K: KeyCodec, V: ValCodec> Iterator for Cursor<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.buffer.pop_front() {
                self.last = Some(key.clone());
                return Some(Ok((key, value)));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.load_leaf() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
