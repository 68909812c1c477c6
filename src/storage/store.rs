//! Registry of the maps of one node.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::btree::BTreeMap;
use super::chunk::{ChunkStore, FileChunkStore, MemoryChunkStore};
use super::codec::{key_from_bytes, key_to_bytes, value_from_bytes, value_to_bytes, KeyCodec, ValCodec};
use super::options::{MapOptions, RunMode, StorageConfig};
use super::replication::{AckResult, ReplicationChannel, StorageAck, StorageOp, StorageRequest};
use crate::primitives::bytes::{put_str, ByteReader};
use crate::primitives::concurrency::HandlerPool;
use crate::types::{HostId, PagePos, Result, StrataError};

/// Name of the map holding database metadata.
pub const SYSTEM_MAP_NAME: &str = "sys";
/// Maps whose name starts with this prefix are discarded on open.
pub const TEMP_MAP_PREFIX: &str = "temp.";
const MAP_FILE_SUFFIX: &str = "db";
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Type-erased view of an open map.
pub trait StorageMap: Send + Sync + 'static {
    /// Map name.
    fn name(&self) -> &str;
    /// Local row count.
    fn row_count(&self) -> u64;
    /// Applies a wire operation whose key and value bytes use the map codecs.
    fn apply(&self, op: &StorageOp) -> Result<AckResult>;
    /// Writes unsaved pages.
    fn save(&self) -> Result<PagePos>;
    /// Appends the root-page transfer image.
    fn replicate_root_page(&self, out: &mut Vec<u8>) -> Result<()>;
    /// Replaces the tree with a received root page.
    fn read_root_page_from(&self, reader: &mut ByteReader<'_>) -> Result<()>;
    /// Ships every local leaf to `hosts`.
    fn move_all_local_leaf_pages(&self, hosts: &[HostId]) -> Result<usize>;
    /// Inserts the rows of a shipped leaf.
    fn receive_leaf_page(&self, image: &[u8]) -> Result<usize>;
    /// Channel used for delegated writes.
    fn set_replication_channel(&self, channel: Arc<dyn ReplicationChannel>);
    /// Concrete map, for typed lookups.
    fn as_any(&self) -> &dyn Any;
}

impl<K: KeyCodec, V: ValCodec> StorageMap for BTreeMap<K, V> {
    fn name(&self) -> &str {
        BTreeMap::name(self)
    }

    fn row_count(&self) -> u64 {
        self.len()
    }

    fn apply(&self, op: &StorageOp) -> Result<AckResult> {
        let previous = |value: Option<V>| AckResult::Value(value.as_ref().map(value_to_bytes));
        Ok(match op {
            StorageOp::Put { key, value } => {
                previous(self.put(key_from_bytes(key)?, value_from_bytes(value)?)?)
            }
            StorageOp::PutIfAbsent { key, value } => {
                previous(self.put_if_absent(key_from_bytes(key)?, value_from_bytes(value)?)?)
            }
            StorageOp::Replace {
                key,
                old_value,
                new_value,
            } => AckResult::Replaced(self.replace(
                key_from_bytes(key)?,
                value_from_bytes(old_value)?,
                value_from_bytes(new_value)?,
            )?),
            StorageOp::Remove { key } => previous(self.remove(key_from_bytes(key)?)?),
            StorageOp::Append { value } => {
                AckResult::Key(key_to_bytes(&self.append(value_from_bytes(value)?)?))
            }
        })
    }

    fn save(&self) -> Result<PagePos> {
        BTreeMap::save(self)
    }

    fn replicate_root_page(&self, out: &mut Vec<u8>) -> Result<()> {
        BTreeMap::replicate_root_page(self, out)
    }

    fn read_root_page_from(&self, reader: &mut ByteReader<'_>) -> Result<()> {
        BTreeMap::read_root_page_from(self, reader)
    }

    fn move_all_local_leaf_pages(&self, hosts: &[HostId]) -> Result<usize> {
        BTreeMap::move_all_local_leaf_pages(self, hosts)
    }

    fn receive_leaf_page(&self, image: &[u8]) -> Result<usize> {
        BTreeMap::receive_leaf_page(self, image)
    }

    fn set_replication_channel(&self, channel: Arc<dyn ReplicationChannel>) {
        BTreeMap::set_replication_channel(self, channel)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Database-level collaborator notified when replicated metadata arrives.
pub trait DatabaseHook: Send + Sync + 'static {
    /// Called after the system map received its root page; the database
    /// copies its metadata from it.
    fn copy_metadata(&self, system_map: &dyn StorageMap) -> Result<()>;
}

/// The maps of one node, sharing one handler pool.
pub struct Storage {
    config: StorageConfig,
    pool: Arc<HandlerPool>,
    maps: RwLock<HashMap<String, Arc<dyn StorageMap>>>,
    open_lock: Mutex<()>,
    channel: RwLock<Option<Arc<dyn ReplicationChannel>>>,
    database: RwLock<Option<Arc<dyn DatabaseHook>>>,
    closed: AtomicBool,
}

impl Storage {
    /// Opens the storage, creating its directory and discarding temporary
    /// maps left by a previous run.
    pub fn open(config: StorageConfig) -> Result<Self> {
        if let Some(dir) = &config.storage_path {
            fs::create_dir_all(dir)?;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(TEMP_MAP_PREFIX) {
                    debug!(file = ?entry.path(), "storage.temp_map_deleted");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        let pool = HandlerPool::new(config.handler_count)?;
        info!(
            path = ?config.storage_path,
            handlers = config.handler_count,
            run_mode = ?config.run_mode,
            "storage.opened"
        );
        Ok(Self {
            config,
            pool,
            maps: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            channel: RwLock::new(None),
            database: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Handler pool shared by every map.
    pub fn pool(&self) -> &Arc<HandlerPool> {
        &self.pool
    }

    /// Whether writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn map_path(&self, name: &str) -> Option<PathBuf> {
        self.config
            .storage_path
            .as_ref()
            .map(|dir| dir.join(format!("{name}.{MAP_FILE_SUFFIX}")))
    }

    /// Opens (or returns the already open) map `name`.
    ///
    /// Fails with [`StrataError::MapTypeMismatch`] when the map is open with
    /// other key or value types.
    pub fn open_map<K: KeyCodec, V: ValCodec>(
        &self,
        name: &str,
        options: &MapOptions,
    ) -> Result<BTreeMap<K, V>> {
        if let Some(map) = self.maps.read().get(name) {
            return typed(name, map.as_ref());
        }
        let _opening = self.open_lock.lock();
        if let Some(map) = self.maps.read().get(name) {
            return typed(name, map.as_ref());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::Shutdown);
        }
        let store: Arc<dyn ChunkStore> = match self.map_path(name) {
            Some(path) => Arc::new(FileChunkStore::open(path)?),
            None => Arc::new(MemoryChunkStore::new()),
        };
        let map: BTreeMap<K, V> =
            BTreeMap::open(name, store, self.pool.clone(), options.resolve(&self.config))?;
        if let Some(channel) = self.channel.read().clone() {
            map.set_replication_channel(channel);
        }
        self.maps
            .write()
            .insert(name.to_string(), Arc::new(map.clone()));
        Ok(map)
    }

    /// Open map `name`, if any.
    pub fn map(&self, name: &str) -> Option<Arc<dyn StorageMap>> {
        self.maps.read().get(name).cloned()
    }

    /// Names of the open maps.
    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn require(&self, name: &str) -> Result<Arc<dyn StorageMap>> {
        self.map(name)
            .ok_or_else(|| StrataError::MapNotFound(name.to_string()))
    }

    /// Sets the channel used by every open and future map.
    pub fn set_replication_channel(&self, channel: Arc<dyn ReplicationChannel>) {
        for map in self.maps.read().values() {
            map.set_replication_channel(channel.clone());
        }
        *self.channel.write() = Some(channel);
    }

    /// Sets the database notified by [`Storage::replicate_from`].
    pub fn set_database_hook(&self, hook: Arc<dyn DatabaseHook>) {
        *self.database.write() = Some(hook);
    }

    /// Applies a write delegated by another node.
    ///
    /// The write is applied directly to the map, outside any transaction,
    /// so the ack never carries a conflict. The distributed flag is only
    /// logged.
    pub fn handle_request(&self, request: &StorageRequest) -> Result<StorageAck> {
        let map = self.require(&request.map_name)?;
        debug!(
            map = %request.map_name,
            op = request.op.name(),
            distributed = request.is_distributed_transaction,
            "storage.request"
        );
        Ok(StorageAck::ok(map.apply(&request.op)?))
    }

    /// Inserts the rows of a leaf moved here from another node.
    pub fn receive_leaf_page(&self, map_name: &str, image: &[u8]) -> Result<usize> {
        self.require(map_name)?.receive_leaf_page(image)
    }

    /// Builds the root-page transfer buffer: a system-map flag, the map
    /// count, then each map's name and root page, system map first.
    pub fn root_pages(&self) -> Result<Vec<u8>> {
        let maps = self.maps.read().clone();
        let system = maps.get(SYSTEM_MAP_NAME).cloned();
        let mut out = Vec::new();
        out.push(u8::from(system.is_some()));
        out.extend_from_slice(&(maps.len() as u32).to_be_bytes());
        let mut ordered: Vec<&Arc<dyn StorageMap>> = system.iter().collect();
        let mut rest: Vec<&Arc<dyn StorageMap>> = maps
            .iter()
            .filter(|(name, _)| name.as_str() != SYSTEM_MAP_NAME)
            .map(|(_, map)| map)
            .collect();
        rest.sort_by(|a, b| a.name().cmp(b.name()));
        ordered.extend(rest);
        for map in ordered {
            put_str(&mut out, map.name());
            map.replicate_root_page(&mut out)?;
        }
        Ok(out)
    }

    /// Ships every map's root page to `new_nodes`.
    pub fn scale_out(&self, new_nodes: &[HostId]) -> Result<()> {
        let channel = self
            .channel
            .read()
            .clone()
            .ok_or(StrataError::Invalid("scale-out needs a replication channel"))?;
        let pages = self.root_pages()?;
        info!(nodes = ?new_nodes, bytes = pages.len(), "storage.scale_out");
        channel.replicate_pages(new_nodes, Bytes::from(pages))
    }

    /// Installs the root pages of a buffer built by [`Storage::root_pages`].
    ///
    /// Every named map must already be open.
    pub fn replicate_from(&self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let contains_system_map = reader.u8()? == 1;
        let count = reader.u32()?;
        for index in 0..count {
            let name = reader.str()?;
            let map = self.require(name)?;
            map.read_root_page_from(&mut reader)?;
            if contains_system_map && index == 0 {
                match self.database.read().clone() {
                    Some(database) => database.copy_metadata(map.as_ref())?,
                    None => warn!(map = name, "storage.system_map_without_database"),
                }
            }
        }
        info!(maps = count, "storage.replicated_from");
        Ok(())
    }

    /// Moves every local leaf to `new_nodes` when this node leaves a
    /// sharded cluster.
    ///
    /// Other run modes are handled above the storage layer. Returns the
    /// number of leaves moved.
    pub fn scale_in(
        &self,
        old_run_mode: RunMode,
        old_nodes: &[HostId],
        new_nodes: &[HostId],
    ) -> Result<usize> {
        if old_run_mode != RunMode::Sharding {
            return Ok(0);
        }
        let Some(local) = &self.config.local_host else {
            return Ok(0);
        };
        if !old_nodes.contains(local) {
            return Ok(0);
        }
        let maps: Vec<Arc<dyn StorageMap>> = self.maps.read().values().cloned().collect();
        let mut moved = 0;
        for map in maps {
            moved += map.move_all_local_leaf_pages(new_nodes)?;
        }
        info!(local = %local, nodes = ?new_nodes, moved, "storage.scale_in");
        Ok(moved)
    }

    /// Saves every map.
    pub fn save(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let maps: Vec<Arc<dyn StorageMap>> = self.maps.read().values().cloned().collect();
        for map in maps {
            map.save()?;
        }
        Ok(())
    }

    /// Saves every map and stops the handler pool.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.pool.wait_idle(SHUTDOWN_DRAIN) {
            warn!("storage.close_pending_operations");
        }
        let saved = self.save();
        self.maps.write().clear();
        self.pool.shutdown();
        info!("storage.closed");
        saved
    }
}

fn typed<K: KeyCodec, V: ValCodec>(name: &str, map: &dyn StorageMap) -> Result<BTreeMap<K, V>> {
    map.as_any()
        .downcast_ref::<BTreeMap<K, V>>()
        .cloned()
        .ok_or_else(|| StrataError::MapTypeMismatch(name.to_string()))
}
