#![forbid(unsafe_code)]
//! Identifiers, errors, and the shared on-disk page header.

use std::fmt;

/// Page checksums and the pooled content digest.
pub mod checksum;

pub use checksum::{page_crc32, Digest, HashPool, DIGEST_LEN, ZERO_DIGEST};

/// Identifier of a page in the page file. `PageId(0)` means "no page".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Identifier of a commit transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl PageId {
    /// Sentinel for an absent page.
    pub const NONE: PageId = PageId(0);

    /// Returns true if this id does not reference a page.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// The key does not carry a routable prefix.
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    /// Underlying I/O failure, including short reads and writes.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A page read returned a different overflow than requested.
    #[error("overflow mismatch on page {page}: want {want}, got {got}")]
    OverflowMismatch {
        /// Page that was read.
        page: u64,
        /// Overflow the caller asked for.
        want: u32,
        /// Overflow recorded in the page header.
        got: u32,
    },
    /// A write-batch lookup missed.
    #[error("key not found")]
    KeyNotFound,
    /// A programming contract was broken; the operation is abandoned.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
    /// Malformed on-disk data.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed or validated.
    #[error("configuration: {0}")]
    Config(String),
    /// Work skipped because another task of the same commit failed.
    #[error("commit aborted")]
    Aborted,
    /// The meta record of `tx` may be on disk: its sync failed and the slot
    /// could not be cleared afterwards.
    #[error("commit {tx} in doubt: {source}")]
    InDoubt {
        /// Transaction whose meta record may be durable.
        tx: u64,
        /// Failure that interrupted the meta write.
        #[source]
        source: Box<StrataError>,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Reads a big-endian `u16` at `off`, failing on truncation.
pub(crate) fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf
        .get(off..off + 2)
        .ok_or(StrataError::Corruption("u16 field truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a big-endian `u32` at `off`, failing on truncation.
pub(crate) fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or(StrataError::Corruption("u32 field truncated"))?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(arr))
}

/// Reads a big-endian `u64` at `off`, failing on truncation.
pub(crate) fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    let bytes = buf
        .get(off..off + 8)
        .ok_or(StrataError::Corruption("u64 field truncated"))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(arr))
}

/// Reads a digest at `off`, failing on truncation.
pub(crate) fn read_digest(buf: &[u8], off: usize) -> Result<Digest> {
    let bytes = buf
        .get(off..off + DIGEST_LEN)
        .ok_or(StrataError::Corruption("digest truncated"))?;
    let mut out = ZERO_DIGEST;
    out.copy_from_slice(bytes);
    Ok(out)
}

pub mod page {
    //! Fixed page header shared by the page store and the node codec.

    use super::{read_digest, read_u16, read_u32, read_u64, Digest, PageId, Result, StrataError};

    /// Magic bytes opening every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"STRP";
    /// Current page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default block size.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Bytes occupied by the page header.
    pub const PAGE_HDR_LEN: usize = 64;
    /// Entry count ceiling; a page with this many entries is malformed.
    pub const MAX_PAGE_ENTRIES: usize = 0xFFFF;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const FLAGS: Range<usize> = 6..8;
        pub const PAGE_NO: Range<usize> = 8..16;
        pub const OVERFLOW: Range<usize> = 16..20;
        pub const COUNT: Range<usize> = 20..22;
        pub const RESERVED: Range<usize> = 22..24;
        pub const SIZE: Range<usize> = 24..28;
        pub const CRC32: Range<usize> = 28..32;
        pub const HASH: Range<usize> = 32..52;
        pub const RESERVED_TAIL: Range<usize> = 52..64;
    }

    /// Page flag bits.
    pub mod flags {
        /// Page holds leaf entries.
        pub const LEAF: u16 = 0x0001;
        /// Page holds branch entries.
        pub const BRANCH: u16 = 0x0002;
        /// Payload is compressed.
        pub const COMPRESSED: u16 = 0x0010;
    }

    /// Decoded page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version.
        pub format_version: u16,
        /// Flag bits, see [`flags`].
        pub flags: u16,
        /// Page id the page was written at.
        pub page_no: PageId,
        /// Extra contiguous blocks beyond the first.
        pub overflow: u32,
        /// Number of entries in the payload.
        pub count: u16,
        /// Serialized payload size in bytes.
        pub size: u32,
        /// Page checksum.
        pub crc32: u32,
        /// Node content hash.
        pub hash: Digest,
    }

    impl PageHeader {
        /// Returns true if the leaf flag is set.
        pub fn is_leaf(&self) -> bool {
            self.flags & flags::LEAF != 0
        }

        /// Returns true if the payload is compressed.
        pub fn is_compressed(&self) -> bool {
            self.flags & flags::COMPRESSED != 0
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(StrataError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::FLAGS].copy_from_slice(&self.flags.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::OVERFLOW].copy_from_slice(&self.overflow.to_be_bytes());
            hdr[header::COUNT].copy_from_slice(&self.count.to_be_bytes());
            hdr[header::RESERVED].fill(0);
            hdr[header::SIZE].copy_from_slice(&self.size.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            hdr[header::HASH].copy_from_slice(&self.hash);
            hdr[header::RESERVED_TAIL].fill(0);
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(StrataError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(StrataError::Corruption("invalid page magic"));
            }
            let format_version = read_u16(hdr, header::FORMAT_VERSION.start)?;
            if format_version != PAGE_FORMAT_VERSION {
                return Err(StrataError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED].iter().any(|b| *b != 0)
                || hdr[header::RESERVED_TAIL].iter().any(|b| *b != 0)
            {
                return Err(StrataError::Corruption("page header reserved bytes not zero"));
            }
            let flags = read_u16(hdr, header::FLAGS.start)?;
            let kind = flags & (flags::LEAF | flags::BRANCH);
            if kind != flags::LEAF && kind != flags::BRANCH {
                return Err(StrataError::Corruption("page is neither leaf nor branch"));
            }
            Ok(Self {
                format_version,
                flags,
                page_no: PageId(read_u64(hdr, header::PAGE_NO.start)?),
                overflow: read_u32(hdr, header::OVERFLOW.start)?,
                count: read_u16(hdr, header::COUNT.start)?,
                size: read_u32(hdr, header::SIZE.start)?,
                crc32: read_u32(hdr, header::CRC32.start)?,
                hash: read_digest(hdr, header::HASH.start)?,
            })
        }
    }

    /// Zeroes the checksum field of an encoded header.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(StrataError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, flags, PageHeader};
    use super::*;

    fn sample_header() -> PageHeader {
        PageHeader {
            format_version: page::PAGE_FORMAT_VERSION,
            flags: flags::LEAF | flags::COMPRESSED,
            page_no: PageId(42),
            overflow: 3,
            count: 17,
            size: 9000,
            crc32: 0xDEADBEEF,
            hash: [7u8; DIGEST_LEN],
        }
    }

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let header = sample_header();
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_leaf());
        assert!(decoded.is_compressed());
    }

    #[test]
    fn header_rejects_bad_magic_and_kind() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        sample_header().encode(&mut buf).unwrap();
        let mut bad_magic = buf;
        bad_magic[0] = b'X';
        assert!(matches!(
            PageHeader::decode(&bad_magic),
            Err(StrataError::Corruption("invalid page magic"))
        ));

        let mut no_kind = sample_header();
        no_kind.flags = flags::COMPRESSED;
        no_kind.encode(&mut buf).unwrap();
        assert!(PageHeader::decode(&buf).is_err());
    }

    #[test]
    fn clear_crc32_zeroes_field() {
        let mut buf = [0xFFu8; page::PAGE_HDR_LEN];
        page::clear_crc32(&mut buf).unwrap();
        assert!(buf[page::header::CRC32].iter().all(|&b| b == 0));
    }

    #[test]
    fn fixed_width_readers_report_truncation() {
        let buf = [1u8, 2, 3];
        assert_eq!(read_u16(&buf, 0).unwrap(), 0x0102);
        assert!(read_u32(&buf, 0).is_err());
        assert!(read_u64(&buf, 0).is_err());
    }
}
