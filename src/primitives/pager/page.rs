use crate::types::page::{self, flags, PageHeader, MAX_PAGE_ENTRIES, PAGE_HDR_LEN};
use crate::types::{page_crc32, Digest, PageId, Result, StrataError};

/// Number of extra blocks needed to hold `payload_len` bytes behind a header.
///
/// A logical page spans `ceil((payload_len + header) / page_size)` blocks; the
/// overflow is that count minus one.
pub fn page_span(payload_len: usize, page_size: usize) -> Result<u32> {
    if page_size <= PAGE_HDR_LEN {
        return Err(StrataError::Invalid("page size smaller than header"));
    }
    let total = payload_len
        .checked_add(PAGE_HDR_LEN)
        .ok_or(StrataError::InvariantViolation("page size overflow"))?;
    let blocks = total.div_ceil(page_size);
    u32::try_from(blocks - 1)
        .map_err(|_| StrataError::InvariantViolation("page overflow too large"))
}

/// One logical page: a header followed by a packed payload, spanning
/// `overflow + 1` contiguous blocks.
#[derive(Clone, Debug)]
pub struct Page {
    header: PageHeader,
    buf: Vec<u8>,
}

impl Page {
    /// Lays out a new page and seals its checksum.
    pub fn build(
        id: PageId,
        page_size: usize,
        page_flags: u16,
        count: usize,
        hash: Digest,
        payload: &[u8],
    ) -> Result<Self> {
        if id.is_none() {
            return Err(StrataError::InvariantViolation("page 0 is reserved"));
        }
        if count >= MAX_PAGE_ENTRIES {
            return Err(StrataError::InvariantViolation("page entry count overflow"));
        }
        let overflow = page_span(payload.len(), page_size)?;
        let size = u32::try_from(payload.len())
            .map_err(|_| StrataError::InvariantViolation("page payload too large"))?;
        let header = PageHeader {
            format_version: page::PAGE_FORMAT_VERSION,
            flags: page_flags,
            page_no: id,
            overflow,
            count: count as u16,
            size,
            crc32: 0,
            hash,
        };
        let mut buf = vec![0u8; (overflow as usize + 1) * page_size];
        header.encode(&mut buf)?;
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + payload.len()].copy_from_slice(payload);
        let mut page = Self { header, buf };
        page.seal();
        Ok(page)
    }

    /// Parses a page read from storage. The checksum is not checked here.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let header = PageHeader::decode(&buf)?;
        let end = PAGE_HDR_LEN
            .checked_add(header.size as usize)
            .ok_or(StrataError::Corruption("page size overflow"))?;
        if end > buf.len() {
            return Err(StrataError::Corruption("page payload exceeds page span"));
        }
        Ok(Self { header, buf })
    }

    fn seal(&mut self) {
        self.buf[page::header::CRC32].fill(0);
        let crc = page_crc32(self.header.page_no.0, &self.buf);
        self.header.crc32 = crc;
        self.buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    }

    /// Recomputes the checksum and compares it with the stored one.
    pub fn verify_crc(&self) -> Result<()> {
        let mut scratch = self.buf.clone();
        page::clear_crc32(&mut scratch)?;
        if page_crc32(self.header.page_no.0, &scratch) != self.header.crc32 {
            return Err(StrataError::Corruption("page crc mismatch"));
        }
        Ok(())
    }

    /// Page id.
    pub fn id(&self) -> PageId {
        self.header.page_no
    }

    /// Extra blocks beyond the first.
    pub fn overflow(&self) -> u32 {
        self.header.overflow
    }

    /// Decoded header.
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    /// Returns true for leaf pages.
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    /// Returns true if the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.header.flags & flags::COMPRESSED != 0
    }

    /// Serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf[PAGE_HDR_LEN..PAGE_HDR_LEN + self.header.size as usize]
    }

    /// Full on-disk image.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_rounds_up_to_blocks() {
        assert_eq!(page_span(0, 512).unwrap(), 0);
        assert_eq!(page_span(512 - PAGE_HDR_LEN, 512).unwrap(), 0);
        assert_eq!(page_span(512 - PAGE_HDR_LEN + 1, 512).unwrap(), 1);
        assert_eq!(page_span(3 * 512, 512).unwrap(), 3);
        assert!(page_span(10, 32).is_err());
    }

    #[test]
    fn build_parse_and_verify() {
        let payload = vec![9u8; 700];
        let page = Page::build(PageId(5), 512, flags::LEAF, 3, [1u8; 20], &payload).unwrap();
        assert_eq!(page.overflow(), 1);
        assert_eq!(page.bytes().len(), 1024);
        page.verify_crc().unwrap();

        let parsed = Page::from_bytes(page.bytes().to_vec()).unwrap();
        assert_eq!(parsed.payload(), &payload[..]);
        assert_eq!(parsed.header(), page.header());

        let mut tampered = page.bytes().to_vec();
        tampered[PAGE_HDR_LEN + 10] ^= 0xFF;
        let tampered = Page::from_bytes(tampered).unwrap();
        assert!(matches!(
            tampered.verify_crc(),
            Err(StrataError::Corruption("page crc mismatch"))
        ));
    }

    #[test]
    fn page_zero_is_rejected() {
        assert!(matches!(
            Page::build(PageId::NONE, 512, flags::LEAF, 0, [0u8; 20], &[]),
            Err(StrataError::InvariantViolation(_))
        ));
    }
}
