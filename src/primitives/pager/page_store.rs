use std::sync::Arc;

use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::page::{PageHeader, PAGE_HDR_LEN};
use crate::types::{PageId, Result, StrataError};

use super::page::Page;

/// Durable block storage addressed by page id and overflow.
pub trait PageStore: Send + Sync {
    /// Block size in bytes.
    fn page_size(&self) -> usize;
    /// Writes a page at its id. Pages are never rewritten in place by the tree.
    fn write(&self, page: &Page) -> Result<()>;
    /// Reads the page at `id`; fails with [`StrataError::OverflowMismatch`]
    /// when the stored overflow differs from `overflow`.
    fn read(&self, id: PageId, overflow: u32) -> Result<Page>;
    /// Flushes written pages to stable storage.
    fn sync(&self) -> Result<()>;
    /// Number of blocks the backing file currently spans.
    fn blocks(&self) -> Result<u64>;
}

/// [`PageStore`] over a single positioned-I/O file.
pub struct FilePageStore {
    io: Arc<dyn FileIo>,
    page_size: usize,
    verify_crc: bool,
    no_sync: bool,
}

impl FilePageStore {
    /// Wraps `io`. Block 0 is never written.
    pub fn new(io: Arc<dyn FileIo>, page_size: usize) -> Result<Self> {
        if page_size <= PAGE_HDR_LEN {
            return Err(StrataError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            io,
            page_size,
            verify_crc: true,
            no_sync: false,
        })
    }

    /// Enables or disables checksum verification on read.
    pub fn with_verify_crc(mut self, enabled: bool) -> Self {
        self.verify_crc = enabled;
        self
    }

    /// Skips fsync in [`PageStore::sync`].
    pub fn with_no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        id.0.checked_mul(self.page_size as u64)
            .ok_or(StrataError::Invalid("page offset overflow"))
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn write(&self, page: &Page) -> Result<()> {
        if page.id().is_none() {
            return Err(StrataError::InvariantViolation("page 0 is reserved"));
        }
        debug!(
            page = page.id().0,
            overflow = page.overflow(),
            "pager.page.write"
        );
        self.io.write_at(self.offset(page.id())?, page.bytes())
    }

    fn read(&self, id: PageId, overflow: u32) -> Result<Page> {
        if id.is_none() {
            return Err(StrataError::InvariantViolation("read of page 0"));
        }
        let off = self.offset(id)?;
        let mut first = vec![0u8; self.page_size];
        self.io.read_at(off, &mut first)?;
        let header = PageHeader::decode(&first[..PAGE_HDR_LEN])?;
        if header.page_no != id {
            return Err(StrataError::Corruption("page id mismatch"));
        }
        if header.overflow != overflow {
            return Err(StrataError::OverflowMismatch {
                page: id.0,
                want: overflow,
                got: header.overflow,
            });
        }
        let mut buf = first;
        if overflow > 0 {
            let rest = overflow as usize * self.page_size;
            buf.resize(self.page_size + rest, 0);
            self.io
                .read_at(off + self.page_size as u64, &mut buf[self.page_size..])?;
        }
        let page = Page::from_bytes(buf)?;
        if self.verify_crc {
            page.verify_crc()?;
        }
        Ok(page)
    }

    fn sync(&self) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        self.io.sync_all()
    }

    fn blocks(&self) -> Result<u64> {
        Ok(self.io.len()?.div_ceil(self.page_size as u64))
    }
}
