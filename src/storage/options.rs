use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::HostId;

/// Default leaf/node size (estimated in-memory bytes) that triggers a split.
pub const DEFAULT_PAGE_SPLIT_SIZE: usize = 16 * 1024;

/// Layout used when serializing leaf pages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStorageMode {
    /// Keys followed by full values.
    #[default]
    Row,
    /// Keys and per-row metadata inline, each column in its own page.
    Column,
}

impl PageStorageMode {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            PageStorageMode::Row => 0,
            PageStorageMode::Column => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PageStorageMode::Row),
            1 => Some(PageStorageMode::Column),
            _ => None,
        }
    }
}

/// How this node participates in the cluster.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Single node, no replication.
    #[default]
    ClientServer,
    /// Every node holds a full copy.
    Replication,
    /// Key ranges are spread across nodes.
    Sharding,
}

/// Options applied when opening a [`super::Storage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one chunk file per map; `None` keeps maps in memory.
    pub storage_path: Option<PathBuf>,
    /// Estimated page size in bytes above which pages split.
    pub page_split_size: usize,
    /// Number of leaf page-operation handlers.
    pub handler_count: usize,
    /// Leaf layout for maps that do not override it.
    pub page_storage_mode: PageStorageMode,
    /// Whether page checksums are verified on every read.
    pub verify_checksums: bool,
    /// Rejects writes when set.
    pub read_only: bool,
    /// Cluster role of this node.
    pub run_mode: RunMode,
    /// Identifier of this node in host lists.
    pub local_host: Option<HostId>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
            handler_count: default_handler_count(),
            page_storage_mode: PageStorageMode::Row,
            verify_checksums: true,
            read_only: false,
            run_mode: RunMode::ClientServer,
            local_host: None,
        }
    }
}

fn default_handler_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 16)
}

impl StorageConfig {
    /// In-memory storage with default settings.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed storage rooted at `path`.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            storage_path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Sets the split threshold.
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    /// Sets the number of leaf handlers.
    pub fn handler_count(mut self, count: usize) -> Self {
        self.handler_count = count;
        self
    }

    /// Sets the default leaf layout.
    pub fn page_storage_mode(mut self, mode: PageStorageMode) -> Self {
        self.page_storage_mode = mode;
        self
    }

    /// Enables or disables checksum verification on reads.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Opens the storage read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the cluster role and local host identifier.
    pub fn run_mode(mut self, mode: RunMode, local_host: impl Into<HostId>) -> Self {
        self.run_mode = mode;
        self.local_host = Some(local_host.into());
        self
    }
}

/// Per-map overrides of the storage defaults.
#[derive(Clone, Debug, Default)]
pub struct MapOptions {
    /// Split threshold for this map.
    pub page_split_size: Option<usize>,
    /// Leaf layout for this map.
    pub page_storage_mode: Option<PageStorageMode>,
    /// Nodes replicating this map.
    pub replication_hosts: Vec<HostId>,
}

impl MapOptions {
    /// Options inheriting every storage default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the split threshold.
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = Some(bytes);
        self
    }

    /// Overrides the leaf layout.
    pub fn page_storage_mode(mut self, mode: PageStorageMode) -> Self {
        self.page_storage_mode = Some(mode);
        self
    }

    /// Records the nodes replicating this map.
    pub fn replication_hosts(mut self, hosts: Vec<HostId>) -> Self {
        self.replication_hosts = hosts;
        self
    }

    pub(crate) fn resolve(&self, storage: &StorageConfig) -> ResolvedMapOptions {
        ResolvedMapOptions {
            page_split_size: self
                .page_split_size
                .unwrap_or(storage.page_split_size)
                .max(1),
            page_storage_mode: self
                .page_storage_mode
                .unwrap_or(storage.page_storage_mode),
            replication_hosts: self.replication_hosts.clone(),
            verify_checksums: storage.verify_checksums,
            read_only: storage.read_only,
            local_host: storage.local_host.clone(),
        }
    }
}

/// Map options with every storage default filled in.
#[derive(Clone, Debug)]
pub struct ResolvedMapOptions {
    /// Split threshold in estimated bytes.
    pub page_split_size: usize,
    /// Initial leaf layout.
    pub page_storage_mode: PageStorageMode,
    /// Nodes replicating the map.
    pub replication_hosts: Vec<HostId>,
    /// Whether page reads verify checksums.
    pub verify_checksums: bool,
    /// Whether writes are rejected.
    pub read_only: bool,
    /// Identifier of this node.
    pub local_host: Option<HostId>,
}

impl Default for ResolvedMapOptions {
    fn default() -> Self {
        MapOptions::default().resolve(&StorageConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_options_fall_back_to_storage() {
        let storage = StorageConfig::in_memory()
            .page_split_size(4096)
            .page_storage_mode(PageStorageMode::Column);
        let resolved = MapOptions::new().resolve(&storage);
        assert_eq!(resolved.page_split_size, 4096);
        assert_eq!(resolved.page_storage_mode, PageStorageMode::Column);

        let resolved = MapOptions::new()
            .page_split_size(128)
            .page_storage_mode(PageStorageMode::Row)
            .resolve(&storage);
        assert_eq!(resolved.page_split_size, 128);
        assert_eq!(resolved.page_storage_mode, PageStorageMode::Row);
    }

    #[test]
    fn storage_mode_byte_roundtrip() {
        for mode in [PageStorageMode::Row, PageStorageMode::Column] {
            assert_eq!(PageStorageMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(PageStorageMode::from_byte(7), None);
    }
}
