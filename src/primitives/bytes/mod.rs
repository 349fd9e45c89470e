#![forbid(unsafe_code)]
//! Varint and cursor utilities shared by the page and value-log codecs.

use crate::types::{Result, StrataError};

pub mod var {
    //! Unsigned LEB128 varints.

    use super::{Result, StrataError};

    /// Longest encoding of a `u64`.
    pub const MAX_VARINT_LEN: usize = 10;

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

    /// Number of bytes `encode_u64(v)` produces.
    pub fn encoded_len(mut v: u64) -> usize {
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    /// Decodes a u64 varint from `src`, advancing `off`.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_VARINT_LEN {
            let byte = *src
                .get(*off)
                .ok_or(StrataError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && payload > 1 {
                return Err(StrataError::Corruption("varint exceeds 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StrataError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing encoded records.

    use super::{var, Result, StrataError};
    use crate::types::{Digest, DIGEST_LEN};

    /// Reads fixed-width and varint fields from a byte slice.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a cursor at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Current read offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len() - self.off
        }

        /// Returns true once the cursor has consumed the whole slice.
        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(StrataError::Corruption("cursor offset overflow"))?;
            let out = self
                .buf
                .get(self.off..end)
                .ok_or(StrataError::Corruption("record truncated"))?;
            self.off = end;
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            let b = self.take(2)?;
            Ok(u16::from_be_bytes([b[0], b[1]]))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(arr))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads a varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length followed by that many bytes.
        pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.varint()?)
                .map_err(|_| StrataError::Corruption("length prefix too large"))?;
            self.take(len)
        }

        /// Reads a content digest.
        pub fn digest(&mut self) -> Result<Digest> {
            let mut out = [0u8; DIGEST_LEN];
            out.copy_from_slice(self.take(DIGEST_LEN)?);
            Ok(out)
        }
    }
}
