#![forbid(unsafe_code)]

//! Append-only redo log of committed transactions.
//!
//! File layout: an 8-byte header (`SRDO` magic, big-endian format version)
//! followed by records framed as
//! `u32 payload_len | u64 tid | u32 crc32(tid ++ payload) | payload`.
//! A record whose frame or checksum does not verify ends the log; everything
//! after it is a torn tail and is discarded when the log is reopened.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{Result, StrataError, TxId};

const MAGIC: [u8; 4] = *b"SRDO";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 16;
const MAX_PAYLOAD: u32 = 256 << 20;

/// Statistics of one redo log instance.
#[derive(Clone, Debug, Default)]
pub struct RedoStats {
    /// Records appended since open or the last reset.
    pub records_appended: u64,
    /// Bytes appended since open or the last reset.
    pub bytes_appended: u64,
    /// Calls to [`RedoLog::sync`].
    pub syncs: u64,
    /// Bytes dropped from a torn tail on open.
    pub truncated_tail: u64,
}

struct RedoState {
    append_offset: u64,
    stats: RedoStats,
}

/// One committed transaction read back from the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedoRecord {
    /// Transaction that produced the record.
    pub tid: TxId,
    /// Serialized row changes.
    pub payload: Vec<u8>,
}

/// Redo log over positioned file I/O.
pub struct RedoLog {
    io: Arc<dyn FileIo>,
    state: Mutex<RedoState>,
}

fn record_crc(tid: TxId, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&tid.0.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn header_bytes() -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..4].copy_from_slice(&MAGIC);
    buf[4..].copy_from_slice(&VERSION.to_be_bytes());
    buf
}

impl RedoLog {
    /// Opens or creates the log file at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Arc::new(StdFileIo::open(path)?))
    }

    /// Opens a log, validating its header and cutting off a torn tail.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len < HEADER_LEN {
            io.write_at(0, &header_bytes())?;
            io.truncate(HEADER_LEN)?;
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            io.read_at(0, &mut header)?;
            if header[..4] != MAGIC {
                return Err(StrataError::Corruption("redo log magic mismatch"));
            }
            let mut version = [0u8; 4];
            version.copy_from_slice(&header[4..]);
            if u32::from_be_bytes(version) != VERSION {
                return Err(StrataError::Corruption("unsupported redo log version"));
            }
        }
        let log = Self {
            io,
            state: Mutex::new(RedoState {
                append_offset: HEADER_LEN,
                stats: RedoStats::default(),
            }),
        };
        let mut iter = log.iter()?;
        while iter.next_record()?.is_some() {}
        let valid = iter.valid_up_to();
        let end = log.io.len()?;
        if valid < end {
            warn!(valid, end, "redo.torn_tail_truncated");
            log.io.truncate(valid)?;
        }
        {
            let mut state = log.state.lock();
            state.append_offset = valid;
            state.stats.truncated_tail = end - valid;
        }
        Ok(log)
    }

    /// Appends one record; durable only after [`RedoLog::sync`].
    pub fn append(&self, tid: TxId, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD)
            .ok_or(StrataError::Invalid("redo record too large"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&tid.0.to_be_bytes());
        frame.extend_from_slice(&record_crc(tid, payload).to_be_bytes());
        frame.extend_from_slice(payload);
        let mut state = self.state.lock();
        self.io.write_at(state.append_offset, &frame)?;
        state.append_offset += frame.len() as u64;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        debug!(tid = %tid, bytes = frame.len(), "redo.appended");
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Drops every record; called once all logged changes are saved.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.io.truncate(HEADER_LEN)?;
        self.io.sync_all()?;
        state.append_offset = HEADER_LEN;
        state.stats = RedoStats::default();
        Ok(())
    }

    /// Iterator over the valid records, oldest first.
    pub fn iter(&self) -> Result<RedoIterator> {
        Ok(RedoIterator {
            io: self.io.clone(),
            offset: HEADER_LEN,
            end: self.io.len()?,
        })
    }

    /// Reads every valid record.
    pub fn records(&self) -> Result<Vec<RedoRecord>> {
        let mut iter = self.iter()?;
        let mut out = Vec::new();
        while let Some(record) = iter.next_record()? {
            out.push(record);
        }
        Ok(out)
    }

    /// Returns true when no record has been appended since the last reset.
    pub fn is_empty(&self) -> bool {
        self.state.lock().append_offset == HEADER_LEN
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RedoStats {
        self.state.lock().stats.clone()
    }
}

/// Sequential reader over a [`RedoLog`].
pub struct RedoIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
}

fn is_eof(err: &StrataError) -> bool {
    matches!(err, StrataError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}

impl RedoIterator {
    /// Next record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<RedoRecord>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.io.read_at(self.offset, &mut header) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(None),
            Err(err) => return Err(err),
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&header[..4]);
        let len = u32::from_be_bytes(word);
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&header[4..12]);
        let tid = TxId(u64::from_be_bytes(tid));
        word.copy_from_slice(&header[12..16]);
        let stored_crc = u32::from_be_bytes(word);
        let payload_at = self.offset + FRAME_HEADER_LEN as u64;
        if len > MAX_PAYLOAD || payload_at + u64::from(len) > self.end {
            return Ok(None);
        }
        let mut payload = vec![0u8; len as usize];
        match self.io.read_at(payload_at, &mut payload) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(None),
            Err(err) => return Err(err),
        }
        if record_crc(tid, &payload) != stored_crc {
            return Ok(None);
        }
        self.offset = payload_at + u64::from(len);
        Ok(Some(RedoRecord { tid, payload }))
    }

    /// File offset just past the last record returned.
    pub fn valid_up_to(&self) -> u64 {
        self.offset
    }
}
