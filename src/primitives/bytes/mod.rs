#![forbid(unsafe_code)]

use crate::types::{Result, StrataError};

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{Result, StrataError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(StrataError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StrataError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StrataError::Corruption("varint longer than 10 bytes"))
    }

    /// Number of bytes `encode_u64` produces for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - (v | 1).leading_zeros() as usize;
        bits.div_ceil(7)
    }
}

/// Appends a varint length followed by the raw bytes.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    var::encode_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

/// Overwrites four bytes at `at` with a big-endian u32.
pub fn patch_u32(out: &mut [u8], at: usize, v: u32) -> Result<()> {
    let slot = out
        .get_mut(at..at + 4)
        .ok_or(StrataError::Invalid("patch offset beyond buffer"))?;
    slot.copy_from_slice(&v.to_be_bytes());
    Ok(())
}

/// Bounds-checked cursor over an encoded buffer.
///
/// Every read past the end reports [`StrataError::Corruption`].
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Current offset into the buffer.
    pub fn position(&self) -> usize {
        self.off
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }

    /// Returns the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(StrataError::Corruption("buffer truncated"))?;
        let out = &self.buf[self.off..end];
        self.off = end;
        Ok(out)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian u16.
    pub fn u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Reads a big-endian u32.
    pub fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    /// Reads a big-endian u64.
    pub fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads an unsigned varint.
    pub fn var_u64(&mut self) -> Result<u64> {
        var::decode_u64(self.buf, &mut self.off)
    }

    /// Reads a varint that must fit a `usize` length.
    pub fn var_len(&mut self) -> Result<usize> {
        let len = self.var_u64()?;
        let len = usize::try_from(len).map_err(|_| StrataError::Corruption("length overflow"))?;
        if len > self.remaining() {
            return Err(StrataError::Corruption("length exceeds buffer"));
        }
        Ok(len)
    }

    /// Reads a varint count without the remaining-bytes bound.
    pub fn var_count(&mut self) -> Result<usize> {
        usize::try_from(self.var_u64()?).map_err(|_| StrataError::Corruption("count overflow"))
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.var_len()?;
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.bytes()?).map_err(|_| StrataError::Corruption("invalid utf-8"))
    }
}
