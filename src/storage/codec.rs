use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::primitives::bytes::{put_bytes, ByteReader};
use crate::types::{Result, StrataError};

/// Estimated heap overhead of a boxed/owned buffer.
pub const BUFFER_MEMORY: usize = 24;

/// Trait implemented by map key types.
pub trait KeyCodec: Clone + Send + Sync + fmt::Debug + 'static {
    /// Total order of the map.
    fn compare(a: &Self, b: &Self) -> Ordering;

    /// Appends a self-delimiting encoding of `key`.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Reads one key written by [`KeyCodec::encode_key`].
    fn decode_key(src: &mut ByteReader<'_>) -> Result<Self>;

    /// Estimated in-memory footprint used for split decisions.
    fn memory(_key: &Self) -> usize {
        16
    }

    /// First key generated by `append` on an empty map.
    ///
    /// Key types that cannot be generated return `None`.
    fn sequence_start() -> Option<Self> {
        None
    }

    /// Key generated after `key` by `append`.
    fn sequence_next(_key: &Self) -> Option<Self> {
        None
    }
}

/// Trait implemented by map value types.
///
/// The column hooks let a value spread over per-column pages when a leaf is
/// written in column mode; values without columns keep the defaults and are
/// stored whole as their metadata.
pub trait ValCodec: Clone + Send + Sync + fmt::Debug + 'static {
    /// Appends a self-delimiting encoding of `value`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Reads one value written by [`ValCodec::encode_val`].
    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self>;

    /// Estimated in-memory footprint used for split decisions.
    fn memory(value: &Self) -> usize;

    /// Equality used by compare-and-replace.
    fn same_value(a: &Self, b: &Self) -> bool;

    /// Number of independently stored columns.
    fn column_count(_value: &Self) -> usize {
        0
    }

    /// Appends the part of the value kept inline in a column-mode leaf.
    fn encode_meta(value: &Self, out: &mut Vec<u8>) {
        Self::encode_val(value, out)
    }

    /// Reads inline metadata; columns stay unloaded.
    fn decode_meta(src: &mut ByteReader<'_>, _column_count: usize) -> Result<Self> {
        Self::decode_val(src)
    }

    /// Appends the bytes of one column.
    fn encode_column(_value: &Self, _column: usize, _out: &mut Vec<u8>) {}

    /// Fills one column from the bytes produced by [`ValCodec::encode_column`].
    fn decode_column(_value: &mut Self, _column: usize, _src: &[u8]) -> Result<()> {
        Ok(())
    }
}

macro_rules! fixed_width_codec {
    ($ty:ty, $width:expr) => {
        impl KeyCodec for $ty {
            fn compare(a: &Self, b: &Self) -> Ordering {
                a.cmp(b)
            }

            fn encode_key(key: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&key.to_be_bytes());
            }

            fn decode_key(src: &mut ByteReader<'_>) -> Result<Self> {
                let mut raw = [0u8; $width];
                raw.copy_from_slice(src.take($width)?);
                Ok(<$ty>::from_be_bytes(raw))
            }

            fn sequence_start() -> Option<Self> {
                Some(1)
            }

            fn sequence_next(key: &Self) -> Option<Self> {
                key.checked_add(1)
            }
        }

        impl ValCodec for $ty {
            fn encode_val(value: &Self, out: &mut Vec<u8>) {
                out.extend_from_slice(&value.to_be_bytes());
            }

            fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
                <$ty as KeyCodec>::decode_key(src)
            }

            fn memory(_value: &Self) -> usize {
                16
            }

            fn same_value(a: &Self, b: &Self) -> bool {
                a == b
            }
        }
    };
}

fixed_width_codec!(u32, 4);
fixed_width_codec!(u64, 8);
fixed_width_codec!(i64, 8);

impl KeyCodec for String {
    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        put_bytes(out, key.as_bytes());
    }

    fn decode_key(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(src.str()?.to_owned())
    }

    fn memory(key: &Self) -> usize {
        BUFFER_MEMORY + key.len()
    }
}

impl ValCodec for String {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        put_bytes(out, value.as_bytes());
    }

    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(src.str()?.to_owned())
    }

    fn memory(value: &Self) -> usize {
        BUFFER_MEMORY + value.len()
    }

    fn same_value(a: &Self, b: &Self) -> bool {
        a == b
    }
}

impl KeyCodec for Vec<u8> {
    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        put_bytes(out, key);
    }

    fn decode_key(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(src.bytes()?.to_vec())
    }

    fn memory(key: &Self) -> usize {
        BUFFER_MEMORY + key.len()
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        put_bytes(out, value);
    }

    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(src.bytes()?.to_vec())
    }

    fn memory(value: &Self) -> usize {
        BUFFER_MEMORY + value.len()
    }

    fn same_value(a: &Self, b: &Self) -> bool {
        a == b
    }
}

impl KeyCodec for Bytes {
    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        put_bytes(out, key);
    }

    fn decode_key(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Bytes::copy_from_slice(src.bytes()?))
    }

    fn memory(key: &Self) -> usize {
        BUFFER_MEMORY + key.len()
    }
}

impl ValCodec for Bytes {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        put_bytes(out, value);
    }

    fn decode_val(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Bytes::copy_from_slice(src.bytes()?))
    }

    fn memory(value: &Self) -> usize {
        BUFFER_MEMORY + value.len()
    }

    fn same_value(a: &Self, b: &Self) -> bool {
        a == b
    }
}

/// Encodes a key into a fresh buffer.
pub fn key_to_bytes<K: KeyCodec>(key: &K) -> Bytes {
    let mut out = Vec::new();
    K::encode_key(key, &mut out);
    Bytes::from(out)
}

/// Encodes a value into a fresh buffer.
pub fn value_to_bytes<V: ValCodec>(value: &V) -> Bytes {
    let mut out = Vec::new();
    V::encode_val(value, &mut out);
    Bytes::from(out)
}

/// Decodes a key that must span the whole buffer.
pub fn key_from_bytes<K: KeyCodec>(raw: &[u8]) -> Result<K> {
    let mut reader = ByteReader::new(raw);
    let key = K::decode_key(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(StrataError::Corruption("trailing bytes after key"));
    }
    Ok(key)
}

/// Decodes a value that must span the whole buffer.
pub fn value_from_bytes<V: ValCodec>(raw: &[u8]) -> Result<V> {
    let mut reader = ByteReader::new(raw);
    let value = V::decode_val(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(StrataError::Corruption("trailing bytes after value"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_sequence_generation() {
        assert_eq!(<u64 as KeyCodec>::sequence_start(), Some(1));
        assert_eq!(<u64 as KeyCodec>::sequence_next(&41), Some(42));
        assert_eq!(<u64 as KeyCodec>::sequence_next(&u64::MAX), None);
        assert_eq!(<String as KeyCodec>::sequence_start(), None);
    }

    #[test]
    fn whole_buffer_decoding_rejects_trailing_bytes() {
        let mut raw = key_to_bytes(&"k1".to_string()).to_vec();
        assert_eq!(key_from_bytes::<String>(&raw).unwrap(), "k1");
        raw.push(0);
        assert!(key_from_bytes::<String>(&raw).is_err());
    }

    #[test]
    fn signed_keys_use_numeric_order() {
        assert_eq!(<i64 as KeyCodec>::compare(&-5, &3), Ordering::Less);
        let bytes = key_to_bytes(&-5i64);
        assert_eq!(key_from_bytes::<i64>(&bytes).unwrap(), -5);
    }
}
