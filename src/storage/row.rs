use bytes::Bytes;

use super::codec::{ValCodec, BUFFER_MEMORY};
use crate::primitives::bytes::{put_bytes, var, ByteReader};
use crate::types::{Result, StrataError};

/// Multi-column table row.
///
/// Rows read from a column-mode leaf start with every column unloaded; the
/// leaf fills in the columns a reader asks for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Row with every column present.
    pub fn new(columns: Vec<Bytes>) -> Self {
        Self {
            columns: columns.into_iter().map(Some).collect(),
        }
    }

    /// Row built from string columns.
    pub fn from_strs<S: AsRef<str>>(columns: &[S]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|c| Bytes::copy_from_slice(c.as_ref().as_bytes()))
                .collect(),
        )
    }

    fn unloaded(column_count: usize) -> Self {
        Self {
            columns: vec![None; column_count],
        }
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column bytes, or `None` when out of range or not loaded.
    pub fn column(&self, index: usize) -> Option<&Bytes> {
        self.columns.get(index).and_then(Option::as_ref)
    }

    /// Column as UTF-8 text.
    pub fn column_str(&self, index: usize) -> Option<&str> {
        self.column(index)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Whether column `index` holds data.
    pub fn is_loaded(&self, index: usize) -> bool {
        self.column(index).is_some()
    }

    /// Whether every column holds data.
    pub fn is_fully_loaded(&self) -> bool {
        self.columns.iter().all(Option::is_some)
    }
}

fn column_bytes(column: &Option<Bytes>) -> &[u8] {
    column.as_deref().unwrap_or_default()
}

impl ValCodec for Row {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        debug_assert!(value.is_fully_loaded(), "encoding a partially loaded row");
        var::encode_u64(value.columns.len() as u64, out);
        for column in &value.columns {
            put_bytes(out, column_bytes(column));
        }
    }

    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
        let count = src.var_count()?;
        let mut columns = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            columns.push(Some(Bytes::copy_from_slice(src.bytes()?)));
        }
        Ok(Self { columns })
    }

    fn memory(value: &Self) -> usize {
        16 + value
            .columns
            .iter()
            .map(|c| BUFFER_MEMORY + column_bytes(c).len())
            .sum::<usize>()
    }

    fn same_value(a: &Self, b: &Self) -> bool {
        a == b
    }

    fn column_count(value: &Self) -> usize {
        value.columns.len()
    }

    fn encode_meta(value: &Self, out: &mut Vec<u8>) {
        var::encode_u64(value.columns.len() as u64, out);
    }

    fn decode_meta(src: &mut ByteReader<'_>, column_count: usize) -> Result<Self> {
        let count = src.var_count()?;
        if count > column_count {
            return Err(StrataError::Corruption("row has more columns than its leaf"));
        }
        Ok(Self::unloaded(count))
    }

    fn encode_column(value: &Self, column: usize, out: &mut Vec<u8>) {
        let bytes = value.columns.get(column).map(column_bytes).unwrap_or_default();
        put_bytes(out, bytes);
    }

    fn decode_column(value: &mut Self, column: usize, src: &[u8]) -> Result<()> {
        let Some(slot) = value.columns.get_mut(column) else {
            return Ok(());
        };
        let mut reader = ByteReader::new(src);
        *slot = Some(Bytes::copy_from_slice(reader.bytes()?));
        Ok(())
    }
}
