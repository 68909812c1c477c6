//! Page byte format.
//!
//! Every page image starts with a fixed header:
//!
//! ```text
//! u32 page_len | u8 page_type | u8 storage_mode | u32 crc32 | payload
//! ```
//!
//! `page_len` covers the whole image and the CRC covers type, mode and
//! payload. Payloads by page type:
//!
//! * leaf, row mode: `varint n, key * n, value * n, hosts`
//! * leaf, column mode: `varint n, varint cols, u64 column_pos * cols,
//!   key * n, meta * n, hosts`
//! * column: `varint n, (varint len, cell) * n`
//! * node: `varint n, u64 child_pos * (n + 1), key * n, hosts`
//! * remote: `hosts`
//!
//! `hosts` is a varint count followed by length-prefixed strings. Child and
//! column positions precede keys so a page tree can be walked without
//! knowing the key type.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tracing::error;

use super::page::{DynamicInfo, LeafPage, NodePage, Page, PageBody, PagePtr, RemotePage};
use super::reference::{PageKey, PageReference};
use crate::primitives::bytes::{put_bytes, put_str, var, ByteReader};
use crate::primitives::concurrency::HandlerPool;
use crate::storage::chunk::ChunkStore;
use crate::storage::codec::{KeyCodec, ValCodec};
use crate::storage::options::PageStorageMode;
use crate::types::checksum::page_crc32;
use crate::types::{HostId, PagePos, Result, StrataError};

/// Length of the fixed page header.
pub const PAGE_HEADER_LEN: usize = 10;

/// Page type tag of leaf pages.
pub const PAGE_TYPE_LEAF: u8 = 0;
/// Page type tag of node pages.
pub const PAGE_TYPE_NODE: u8 = 1;
/// Page type tag of column pages.
pub const PAGE_TYPE_COLUMN: u8 = 2;
/// Page type tag of remote placeholders.
pub const PAGE_TYPE_REMOTE: u8 = 3;

/// Wraps a payload into a complete page image.
pub fn page_image(page_type: u8, mode: PageStorageMode, payload: &[u8]) -> Vec<u8> {
    let mode = mode.as_byte();
    let total = (PAGE_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(PAGE_HEADER_LEN + payload.len());
    out.extend_from_slice(&total.to_be_bytes());
    out.push(page_type);
    out.push(mode);
    out.extend_from_slice(&page_crc32(page_type, mode, payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decoded page header plus payload slice.
pub struct PageHeader<'a> {
    /// Page type tag.
    pub page_type: u8,
    /// Storage mode of the page.
    pub mode: PageStorageMode,
    /// Payload following the header.
    pub payload: &'a [u8],
}

/// Validates the header of an image read from position `pos`.
pub fn open_image(pos: PagePos, image: &[u8], verify: bool) -> Result<PageHeader<'_>> {
    let mut reader = ByteReader::new(image);
    let total = reader.u32()? as usize;
    if total != image.len() || total < PAGE_HEADER_LEN {
        return Err(StrataError::Corruption("page length does not match image"));
    }
    let page_type = reader.u8()?;
    let mode_byte = reader.u8()?;
    let expected = reader.u32()?;
    let payload = &image[PAGE_HEADER_LEN..];
    if verify {
        let actual = page_crc32(page_type, mode_byte, payload);
        if actual != expected {
            error!(pos = pos.0, expected, actual, "page.checksum_mismatch");
            return Err(StrataError::Checksum {
                pos: pos.0,
                expected,
                actual,
            });
        }
    }
    let mode = PageStorageMode::from_byte(mode_byte)
        .ok_or(StrataError::Corruption("unknown storage mode"))?;
    Ok(PageHeader {
        page_type,
        mode,
        payload,
    })
}

fn put_hosts(out: &mut Vec<u8>, hosts: &[HostId]) {
    var::encode_u64(hosts.len() as u64, out);
    for host in hosts {
        put_str(out, host);
    }
}

fn read_hosts(reader: &mut ByteReader<'_>) -> Result<Arc<[HostId]>> {
    let count = reader.var_count()?;
    let mut hosts = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        hosts.push(reader.str()?.to_owned());
    }
    Ok(hosts.into())
}

/// Column pages of a leaf loaded from column storage.
///
/// Each column page is read once, on first access, and then shared by all
/// copies of the leaf.
pub struct LazyColumns {
    store: Arc<dyn ChunkStore>,
    positions: Vec<PagePos>,
    loaded: Vec<OnceLock<Arc<[Bytes]>>>,
    row_count: usize,
    verify: bool,
}

impl LazyColumns {
    /// Number of column pages.
    pub fn column_count(&self) -> usize {
        self.positions.len()
    }

    /// Whether column `column` has been read.
    pub fn is_loaded(&self, column: usize) -> bool {
        self.loaded
            .get(column)
            .is_some_and(|slot| slot.get().is_some())
    }

    fn column(&self, column: usize) -> Result<&Arc<[Bytes]>> {
        let slot = self
            .loaded
            .get(column)
            .ok_or(StrataError::Invalid("column index out of range"))?;
        if let Some(cells) = slot.get() {
            return Ok(cells);
        }
        let cells = read_column_page(&*self.store, self.positions[column], self.verify)?;
        if cells.len() != self.row_count {
            return Err(StrataError::Corruption("column page row count differs from leaf"));
        }
        Ok(slot.get_or_init(|| cells))
    }

    pub(crate) fn fill<V: ValCodec>(&self, value: &mut V, row: usize, column: usize) -> Result<()> {
        let cells = self.column(column)?;
        let cell = cells
            .get(row)
            .ok_or(StrataError::Corruption("column page shorter than leaf"))?;
        V::decode_column(value, column, cell)
    }
}

fn read_column_page(store: &dyn ChunkStore, pos: PagePos, verify: bool) -> Result<Arc<[Bytes]>> {
    let image = store.read_page(pos)?;
    let header = open_image(pos, &image, verify)?;
    if header.page_type != PAGE_TYPE_COLUMN {
        return Err(StrataError::Corruption("expected a column page"));
    }
    let mut reader = ByteReader::new(header.payload);
    let rows = reader.var_count()?;
    let mut cells = Vec::with_capacity(rows.min(1 << 16));
    for _ in 0..rows {
        cells.push(Bytes::copy_from_slice(reader.bytes()?));
    }
    Ok(cells.into())
}

/// Row-mode image of a leaf, used for saving and for shipping pages.
pub fn leaf_row_image<K: KeyCodec, V: ValCodec>(leaf: &LeafPage<K, V>) -> Result<Vec<u8>> {
    let materialized;
    let leaf = if leaf.has_lazy_columns() {
        materialized = leaf.materialized()?;
        &materialized
    } else {
        leaf
    };
    let mut payload = Vec::new();
    var::encode_u64(leaf.keys.len() as u64, &mut payload);
    for key in leaf.keys.iter() {
        K::encode_key(key, &mut payload);
    }
    for value in leaf.values.iter() {
        V::encode_val(value, &mut payload);
    }
    put_hosts(&mut payload, &leaf.replication_hosts);
    Ok(page_image(PAGE_TYPE_LEAF, PageStorageMode::Row, &payload))
}

/// Image of a remote placeholder.
pub fn remote_image(hosts: &[HostId]) -> Vec<u8> {
    let mut payload = Vec::new();
    put_hosts(&mut payload, hosts);
    page_image(PAGE_TYPE_REMOTE, PageStorageMode::Row, &payload)
}

fn write_leaf_columns<K: KeyCodec, V: ValCodec>(
    store: &dyn ChunkStore,
    leaf: &LeafPage<K, V>,
) -> Result<PagePos> {
    let materialized;
    let leaf = if leaf.has_lazy_columns() {
        materialized = leaf.materialized()?;
        &materialized
    } else {
        leaf
    };
    let columns = leaf.values.iter().map(V::column_count).max().unwrap_or(0);
    let mut positions = Vec::with_capacity(columns);
    let mut cell = Vec::new();
    for column in 0..columns {
        let mut payload = Vec::new();
        var::encode_u64(leaf.values.len() as u64, &mut payload);
        for value in leaf.values.iter() {
            cell.clear();
            V::encode_column(value, column, &mut cell);
            put_bytes(&mut payload, &cell);
        }
        positions.push(store.write_page(&page_image(
            PAGE_TYPE_COLUMN,
            PageStorageMode::Column,
            &payload,
        ))?);
    }

    let mut payload = Vec::new();
    var::encode_u64(leaf.keys.len() as u64, &mut payload);
    var::encode_u64(columns as u64, &mut payload);
    for pos in &positions {
        payload.extend_from_slice(&pos.0.to_be_bytes());
    }
    for key in leaf.keys.iter() {
        K::encode_key(key, &mut payload);
    }
    for value in leaf.values.iter() {
        V::encode_meta(value, &mut payload);
    }
    put_hosts(&mut payload, &leaf.replication_hosts);
    store.write_page(&page_image(PAGE_TYPE_LEAF, PageStorageMode::Column, &payload))
}

/// Writes every unsaved page reachable from `page`, children first.
///
/// Leaf and remote instances already carrying a position are reused. Node
/// pages are always rewritten: a child can be replaced in its reference
/// without the node instance changing. A page that was split but not yet
/// linked into its parent is written as its temporary parent so rows written
/// to the new halves are kept.
pub(crate) fn write_tree<K: KeyCodec, V: ValCodec>(
    store: &dyn ChunkStore,
    page: &PagePtr<K, V>,
    mode: PageStorageMode,
) -> Result<PagePos> {
    if let DynamicInfo::Splitted(tmp) = &*page.dynamic_info() {
        return write_tree(store, tmp, mode);
    }
    let saved = page.pos();
    if saved.is_saved() && !page.is_node() {
        return Ok(saved);
    }
    let pos = match page.body() {
        PageBody::Leaf(leaf) => match mode {
            PageStorageMode::Row => store.write_page(&leaf_row_image(leaf)?)?,
            PageStorageMode::Column => write_leaf_columns(store, leaf)?,
        },
        PageBody::Node(node) => {
            let mut child_positions = Vec::with_capacity(node.children.len());
            for child in node.children.iter() {
                child_positions.push(write_tree(store, &child.page(), mode)?);
            }
            let mut payload = Vec::new();
            var::encode_u64(node.keys.len() as u64, &mut payload);
            for pos in &child_positions {
                payload.extend_from_slice(&pos.0.to_be_bytes());
            }
            for key in node.keys.iter() {
                K::encode_key(key, &mut payload);
            }
            put_hosts(&mut payload, &[]);
            store.write_page(&page_image(PAGE_TYPE_NODE, mode, &payload))?
        }
        PageBody::Remote(remote) => store.write_page(&remote_image(&remote.hosts))?,
    };
    page.set_pos(pos);
    Ok(pos)
}

/// Everything needed to rebuild pages from a chunk.
pub(crate) struct ReadContext<'a> {
    pub(crate) store: &'a Arc<dyn ChunkStore>,
    pub(crate) pool: &'a HandlerPool,
    pub(crate) verify: bool,
}

/// Decodes a leaf payload in either storage mode.
fn decode_leaf<K: KeyCodec, V: ValCodec>(
    header: &PageHeader<'_>,
    columns_from: Option<&ReadContext<'_>>,
) -> Result<LeafPage<K, V>> {
    let mut reader = ByteReader::new(header.payload);
    let rows = reader.var_count()?;
    match header.mode {
        PageStorageMode::Row => {
            let mut keys = Vec::with_capacity(rows.min(1 << 16));
            for _ in 0..rows {
                keys.push(K::decode_key(&mut reader)?);
            }
            let mut values = Vec::with_capacity(rows.min(1 << 16));
            for _ in 0..rows {
                values.push(V::decode_val(&mut reader)?);
            }
            let hosts = read_hosts(&mut reader)?;
            Ok(LeafPage::new(keys, values, hosts))
        }
        PageStorageMode::Column => {
            let ctx = columns_from
                .ok_or(StrataError::Invalid("column-mode leaf needs its chunk"))?;
            let column_count = reader.var_count()?;
            let mut positions = Vec::with_capacity(column_count.min(1024));
            for _ in 0..column_count {
                positions.push(PagePos(reader.u64()?));
            }
            let mut keys = Vec::with_capacity(rows.min(1 << 16));
            for _ in 0..rows {
                keys.push(K::decode_key(&mut reader)?);
            }
            let mut metas = Vec::with_capacity(rows.min(1 << 16));
            for _ in 0..rows {
                metas.push(V::decode_meta(&mut reader, column_count)?);
            }
            let hosts = read_hosts(&mut reader)?;
            let mut leaf = LeafPage::new(keys, metas, hosts);
            if column_count > 0 {
                leaf.columns = Some(Arc::new(LazyColumns {
                    store: ctx.store.clone(),
                    loaded: (0..column_count).map(|_| OnceLock::new()).collect(),
                    positions,
                    row_count: rows,
                    verify: ctx.verify,
                }));
            }
            Ok(leaf)
        }
    }
}

/// Key-range marker of child `index` of a node with split keys `keys`.
pub(crate) fn child_page_key<K: Clone>(keys: &[K], index: usize) -> PageKey<K> {
    match index {
        0 => PageKey {
            key: keys.first().cloned(),
            first: true,
        },
        _ => PageKey {
            key: keys.get(index - 1).cloned(),
            first: false,
        },
    }
}

/// Reads the subtree stored at `pos` and returns a reference to its root.
pub(crate) fn read_tree<K: KeyCodec, V: ValCodec>(
    ctx: &ReadContext<'_>,
    pos: PagePos,
    page_key: PageKey<K>,
) -> Result<Arc<PageReference<K, V>>> {
    let image = ctx.store.read_page(pos)?;
    let header = open_image(pos, &image, ctx.verify)?;
    let (page, children) = match header.page_type {
        PAGE_TYPE_LEAF => {
            let leaf = decode_leaf(&header, Some(ctx))?;
            (Page::leaf(ctx.pool.next_handler(), leaf), Vec::new())
        }
        PAGE_TYPE_NODE => {
            let mut reader = ByteReader::new(header.payload);
            let key_count = reader.var_count()?;
            let mut child_positions = Vec::with_capacity(key_count.min(1 << 16) + 1);
            for _ in 0..=key_count {
                child_positions.push(PagePos(reader.u64()?));
            }
            let mut keys: Vec<K> = Vec::with_capacity(key_count.min(1 << 16));
            for _ in 0..key_count {
                keys.push(K::decode_key(&mut reader)?);
            }
            let mut children = Vec::with_capacity(child_positions.len());
            for (i, child_pos) in child_positions.into_iter().enumerate() {
                children.push(read_tree(ctx, child_pos, child_page_key(&keys, i))?);
            }
            let node = NodePage::new(keys, children.clone());
            (Page::node(ctx.pool.node_handler(), node), children)
        }
        PAGE_TYPE_REMOTE => {
            let mut reader = ByteReader::new(header.payload);
            let hosts = read_hosts(&mut reader)?;
            let remote = RemotePage { hosts };
            (Page::remote(ctx.pool.next_handler(), remote), Vec::new())
        }
        PAGE_TYPE_COLUMN => {
            return Err(StrataError::Corruption("column page where a tree page was expected"))
        }
        _ => return Err(StrataError::Corruption("unknown page type")),
    };
    page.set_pos(pos);
    let reference = PageReference::new(page, page_key);
    for child in &children {
        child.set_parent(&reference);
    }
    Ok(reference)
}

/// Decodes a self-contained leaf or remote image received from another node.
pub(crate) fn decode_shipped_page<K: KeyCodec, V: ValCodec>(
    image: &[u8],
) -> Result<PageBody<K, V>> {
    let header = open_image(PagePos::UNSAVED, image, true)?;
    match header.page_type {
        PAGE_TYPE_LEAF => Ok(PageBody::Leaf(decode_leaf(&header, None)?)),
        PAGE_TYPE_REMOTE => {
            let mut reader = ByteReader::new(header.payload);
            Ok(PageBody::Remote(RemotePage {
                hosts: read_hosts(&mut reader)?,
            }))
        }
        _ => Err(StrataError::Corruption("shipped page must be a leaf or remote page")),
    }
}

/// Page counts of a chunk, gathered without knowing key or value types.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PageCensus {
    /// Leaf pages reachable from the root.
    pub leaves: u64,
    /// Node pages reachable from the root.
    pub nodes: u64,
    /// Remote placeholders reachable from the root.
    pub remotes: u64,
    /// Column pages referenced by column-mode leaves.
    pub column_pages: u64,
    /// Rows stored in reachable leaves.
    pub rows: u64,
    /// Bytes of all reachable page images.
    pub bytes: u64,
    /// Height of the tree, 1 for a single leaf.
    pub depth: u32,
}

/// Walks the page tree from `root`, verifying every checksum.
pub fn census(store: &dyn ChunkStore, root: PagePos) -> Result<PageCensus> {
    let mut census = PageCensus::default();
    census_page(store, root, 1, &mut census)?;
    Ok(census)
}

fn census_page(store: &dyn ChunkStore, pos: PagePos, depth: u32, out: &mut PageCensus) -> Result<()> {
    let image = store.read_page(pos)?;
    let header = open_image(pos, &image, true)?;
    out.bytes += image.len() as u64;
    out.depth = out.depth.max(depth);
    let mut reader = ByteReader::new(header.payload);
    match header.page_type {
        PAGE_TYPE_LEAF => {
            out.leaves += 1;
            out.rows += reader.var_u64()?;
            if header.mode == PageStorageMode::Column {
                let columns = reader.var_count()?;
                for _ in 0..columns {
                    let column_pos = PagePos(reader.u64()?);
                    let column = store.read_page(column_pos)?;
                    open_image(column_pos, &column, true)?;
                    out.column_pages += 1;
                    out.bytes += column.len() as u64;
                }
            }
        }
        PAGE_TYPE_NODE => {
            out.nodes += 1;
            let key_count = reader.var_count()?;
            for _ in 0..=key_count {
                census_page(store, PagePos(reader.u64()?), depth + 1, out)?;
            }
        }
        PAGE_TYPE_REMOTE => out.remotes += 1,
        _ => return Err(StrataError::Corruption("unexpected page type in tree")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk::MemoryChunkStore;
    use crate::storage::row::Row;
    use crate::types::HandlerId;

    fn rows(n: u64) -> LeafPage<u64, Row> {
        let keys: Vec<u64> = (1..=n).collect();
        let values = keys
            .iter()
            .map(|k| Row::from_strs(&[format!("a{k}"), format!("b{k}")]))
            .collect();
        LeafPage::new(keys, values, Arc::from(vec!["n1:9000".to_string()]))
    }

    fn reload(
        store: &Arc<dyn ChunkStore>,
        pool: &HandlerPool,
        pos: PagePos,
    ) -> Arc<PageReference<u64, Row>> {
        let ctx = ReadContext {
            store,
            pool,
            verify: true,
        };
        read_tree(&ctx, pos, PageKey::root()).unwrap()
    }

    #[test]
    fn column_leaf_loads_columns_on_demand() {
        let pool = HandlerPool::new(1).unwrap();
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let page = Page::leaf(HandlerId(0), rows(20));
        let pos = write_tree(&*store, &page, PageStorageMode::Column).unwrap();

        let loaded = reload(&store, &pool, pos).page();
        let leaf = loaded.as_leaf().unwrap();
        let lazy = leaf.columns.as_ref().unwrap();
        assert!(!lazy.is_loaded(0) && !lazy.is_loaded(1));

        let partial = leaf.value(4, super::super::page::ColumnSelection::Only(&[1])).unwrap();
        assert!(!partial.is_loaded(0));
        assert_eq!(partial.column_str(1), Some("b5"));
        assert!(lazy.is_loaded(1) && !lazy.is_loaded(0));

        let full = leaf.materialized().unwrap();
        assert_eq!(full.values[19], Row::from_strs(&["a20", "b20"]));
        assert_eq!(full.replication_hosts(), &["n1:9000".to_string()]);
    }

    #[test]
    fn saved_pages_are_not_rewritten() {
        let store = MemoryChunkStore::new();
        let page = Page::leaf(HandlerId(0), rows(3));
        let first = write_tree(&store, &page, PageStorageMode::Row).unwrap();
        let used = store.len();
        let second = write_tree(&store, &page, PageStorageMode::Row).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), used);
    }

    #[test]
    fn damaged_payload_fails_checksum() {
        let pool = HandlerPool::new(1).unwrap();
        let memory = Arc::new(MemoryChunkStore::new());
        let store: Arc<dyn ChunkStore> = memory.clone();
        let pos = write_tree(&*store, &Page::leaf(HandlerId(0), rows(4)), PageStorageMode::Row)
            .unwrap();
        memory.with_bytes_mut(|bytes| bytes[pos.0 as usize + PAGE_HEADER_LEN + 2] ^= 0xff);
        let ctx = ReadContext {
            store: &store,
            pool: &pool,
            verify: true,
        };
        let err = read_tree::<u64, Row>(&ctx, pos, PageKey::root()).unwrap_err();
        assert!(matches!(err, StrataError::Checksum { .. }), "{err:?}");
    }

    #[test]
    fn census_counts_column_pages() {
        let store = MemoryChunkStore::new();
        let pos = write_tree(&store, &Page::leaf(HandlerId(0), rows(7)), PageStorageMode::Column)
            .unwrap();
        let census = census(&store, pos).unwrap();
        assert_eq!(census.leaves, 1);
        assert_eq!(census.rows, 7);
        assert_eq!(census.column_pages, 2);
        assert_eq!(census.depth, 1);
    }
}
