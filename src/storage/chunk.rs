//! Append-only page containers.
//!
//! A chunk starts with an 8-byte header holding the position of the most
//! recently saved root page, followed by page images. Every page image
//! starts with its own big-endian `u32` length.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PagePos, Result, StrataError};

const CHUNK_HEADER_LEN: u64 = 8;

/// Storage for serialized pages addressed by position.
pub trait ChunkStore: Send + Sync + 'static {
    /// Appends a page image and returns its position.
    fn write_page(&self, image: &[u8]) -> Result<PagePos>;
    /// Reads the page image stored at `pos`.
    fn read_page(&self, pos: PagePos) -> Result<Bytes>;
    /// Records the root page of the last completed save.
    fn set_root(&self, pos: PagePos) -> Result<()>;
    /// Root page of the last completed save.
    fn root(&self) -> Result<Option<PagePos>>;
    /// Makes previous writes durable.
    fn sync(&self) -> Result<()>;
}

fn image_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len < 4 {
        return Err(StrataError::Corruption("page length shorter than its prefix"));
    }
    Ok(len)
}

/// Chunk kept entirely in memory.
pub struct MemoryChunkStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryChunkStore {
    /// Empty in-memory chunk.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(vec![0u8; CHUNK_HEADER_LEN as usize]),
        }
    }

    /// Bytes used, header included.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether no page has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == CHUNK_HEADER_LEN as usize
    }

    /// Applies `f` to the raw chunk bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn write_page(&self, image: &[u8]) -> Result<PagePos> {
        let mut data = self.data.write();
        let pos = data.len() as u64;
        data.extend_from_slice(image);
        Ok(PagePos(pos))
    }

    fn read_page(&self, pos: PagePos) -> Result<Bytes> {
        let data = self.data.read();
        let start = usize::try_from(pos.0).map_err(|_| StrataError::Invalid("page position"))?;
        if pos.0 < CHUNK_HEADER_LEN || start + 4 > data.len() {
            return Err(StrataError::Corruption("page position outside chunk"));
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&data[start..start + 4]);
        let len = image_len(prefix)?;
        let image = data
            .get(start..start + len)
            .ok_or(StrataError::Corruption("page image truncated"))?;
        Ok(Bytes::copy_from_slice(image))
    }

    fn set_root(&self, pos: PagePos) -> Result<()> {
        self.data.write()[..8].copy_from_slice(&pos.0.to_be_bytes());
        Ok(())
    }

    fn root(&self) -> Result<Option<PagePos>> {
        let data = self.data.read();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[..8]);
        let pos = PagePos(u64::from_be_bytes(raw));
        Ok(pos.is_saved().then_some(pos))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Chunk backed by one file.
pub struct FileChunkStore {
    io: Arc<dyn FileIo>,
    end: Mutex<u64>,
}

impl FileChunkStore {
    /// Opens or creates the chunk file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_io(Arc::new(StdFileIo::open(path)?))
    }

    /// Uses an existing I/O handle.
    pub fn with_io(io: Arc<dyn FileIo>) -> Result<Self> {
        let mut len = io.len()?;
        if len < CHUNK_HEADER_LEN {
            io.write_at(0, &[0u8; CHUNK_HEADER_LEN as usize])?;
            len = CHUNK_HEADER_LEN;
        }
        Ok(Self {
            io,
            end: Mutex::new(len),
        })
    }
}

impl ChunkStore for FileChunkStore {
    fn write_page(&self, image: &[u8]) -> Result<PagePos> {
        let mut end = self.end.lock();
        let pos = *end;
        self.io.write_at(pos, image)?;
        *end += image.len() as u64;
        Ok(PagePos(pos))
    }

    fn read_page(&self, pos: PagePos) -> Result<Bytes> {
        if pos.0 < CHUNK_HEADER_LEN {
            return Err(StrataError::Corruption("page position inside chunk header"));
        }
        let mut prefix = [0u8; 4];
        self.io.read_at(pos.0, &mut prefix)?;
        let len = image_len(prefix)?;
        let mut image = vec![0u8; len];
        self.io.read_at(pos.0, &mut image)?;
        Ok(Bytes::from(image))
    }

    fn set_root(&self, pos: PagePos) -> Result<()> {
        self.io.write_at(0, &pos.0.to_be_bytes())
    }

    fn root(&self) -> Result<Option<PagePos>> {
        let mut raw = [0u8; 8];
        self.io.read_at(0, &mut raw)?;
        let pos = PagePos(u64::from_be_bytes(raw));
        Ok(pos.is_saved().then_some(pos))
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}
