use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{
    read_digest, read_u32, read_u64, Digest, PageId, Result, StrataError, TxId, ZERO_DIGEST,
};

/// Magic bytes opening every meta slot.
pub const META_MAGIC: [u8; 4] = *b"STRM";
/// Current meta record format.
pub const META_FORMAT_VERSION: u32 = 1;
/// Bytes per meta slot.
pub const META_SLOT_LEN: usize = 64;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_VERSION: Range<usize> = 4..8;
const META_ROOT: Range<usize> = 8..16;
const META_ROOT_OVERFLOW: Range<usize> = 16..20;
const META_SEQUENCE: Range<usize> = 20..28;
const META_TX: Range<usize> = 28..36;
const META_ROOT_HASH: Range<usize> = 36..56;
const META_RESERVED: Range<usize> = 56..60;
const META_CRC32: Range<usize> = 60..64;

/// Durable root pointer of the main tree as of one committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Root page, or [`PageId::NONE`] for an empty tree.
    pub root: PageId,
    /// Overflow of the root page.
    pub root_overflow: u32,
    /// Write sequence of the main tree.
    pub sequence: u64,
    /// Transaction that produced this record; also the record id.
    pub tx: TxId,
    /// Content hash of the root node.
    pub root_hash: Digest,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            root: PageId::NONE,
            root_overflow: 0,
            sequence: 0,
            tx: TxId(0),
            root_hash: ZERO_DIGEST,
        }
    }
}

impl Meta {
    /// Serializes the record into one slot.
    pub fn encode(&self) -> [u8; META_SLOT_LEN] {
        let mut buf = [0u8; META_SLOT_LEN];
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
        buf[META_VERSION].copy_from_slice(&META_FORMAT_VERSION.to_be_bytes());
        buf[META_ROOT].copy_from_slice(&self.root.0.to_be_bytes());
        buf[META_ROOT_OVERFLOW].copy_from_slice(&self.root_overflow.to_be_bytes());
        buf[META_SEQUENCE].copy_from_slice(&self.sequence.to_be_bytes());
        buf[META_TX].copy_from_slice(&self.tx.0.to_be_bytes());
        buf[META_ROOT_HASH].copy_from_slice(&self.root_hash);
        let crc = crc32fast::hash(&buf[..META_CRC32.start]);
        buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and validates one slot.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SLOT_LEN {
            return Err(StrataError::Corruption("meta slot truncated"));
        }
        if buf[META_MAGIC_RANGE] != META_MAGIC {
            return Err(StrataError::Corruption("invalid meta magic"));
        }
        if read_u32(buf, META_VERSION.start)? != META_FORMAT_VERSION {
            return Err(StrataError::Corruption("unsupported meta version"));
        }
        if buf[META_RESERVED].iter().any(|b| *b != 0) {
            return Err(StrataError::Corruption("meta reserved bytes not zero"));
        }
        let stored = read_u32(buf, META_CRC32.start)?;
        if crc32fast::hash(&buf[..META_CRC32.start]) != stored {
            return Err(StrataError::Corruption("meta crc mismatch"));
        }
        Ok(Self {
            root: PageId(read_u64(buf, META_ROOT.start)?),
            root_overflow: read_u32(buf, META_ROOT_OVERFLOW.start)?,
            sequence: read_u64(buf, META_SEQUENCE.start)?,
            tx: TxId(read_u64(buf, META_TX.start)?),
            root_hash: read_digest(buf, META_ROOT_HASH.start)?,
        })
    }
}

/// Versioned meta records rotated across a fixed set of files.
///
/// Record `id` lives in file `id mod n` at slot `id div n`, so consecutive
/// commits land in different files.
pub struct MetaStore {
    files: Vec<Arc<dyn FileIo>>,
    no_sync: bool,
}

impl MetaStore {
    /// Opens (creating as needed) `versions` meta files under `dir`.
    pub fn open(dir: &Path, versions: usize) -> Result<Self> {
        if versions == 0 {
            return Err(StrataError::Invalid("meta store needs at least one file"));
        }
        std::fs::create_dir_all(dir)?;
        let mut files: Vec<Arc<dyn FileIo>> = Vec::with_capacity(versions);
        for i in 0..versions {
            files.push(Arc::new(StdFileIo::open(dir.join(format!("{i:03}.meta")))?));
        }
        Self::with_files(files)
    }

    /// Uses caller-supplied files, in rotation order.
    pub fn with_files(files: Vec<Arc<dyn FileIo>>) -> Result<Self> {
        if files.is_empty() {
            return Err(StrataError::Invalid("meta store needs at least one file"));
        }
        Ok(Self {
            files,
            no_sync: false,
        })
    }

    /// Skips fsync after meta writes.
    pub fn with_no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    /// Number of rotating files.
    pub fn versions(&self) -> usize {
        self.files.len()
    }

    fn locate(&self, id: u64) -> (&Arc<dyn FileIo>, u64) {
        let n = self.files.len() as u64;
        let file = &self.files[(id % n) as usize];
        (file, (id / n) * META_SLOT_LEN as u64)
    }

    /// Writes `meta` into the slot for its transaction id and syncs that file.
    ///
    /// On failure the slot is zeroed and synced so the record cannot be
    /// picked up by [`MetaStore::latest`]. If that also fails the error is
    /// [`StrataError::InDoubt`]: the record may or may not be durable.
    pub fn write(&self, meta: &Meta) -> Result<()> {
        let (file, off) = self.locate(meta.tx.0);
        if let Err(err) = self.write_slot(file.as_ref(), off, &meta.encode()) {
            if let Err(clear) = self.write_slot(file.as_ref(), off, &[0u8; META_SLOT_LEN]) {
                warn!(tx = meta.tx.0, error = %clear, "pager.meta.clear_failed");
                return Err(StrataError::InDoubt {
                    tx: meta.tx.0,
                    source: Box::new(err),
                });
            }
            return Err(err);
        }
        debug!(
            tx = meta.tx.0,
            root = meta.root.0,
            file = meta.tx.0 % self.files.len() as u64,
            "pager.meta.write"
        );
        Ok(())
    }

    fn write_slot(&self, file: &dyn FileIo, off: u64, slot: &[u8]) -> Result<()> {
        file.write_at(off, slot)?;
        if !self.no_sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Reads the record with id `meta_id`.
    pub fn read(&self, meta_id: u64) -> Result<Meta> {
        let (file, off) = self.locate(meta_id);
        let mut buf = [0u8; META_SLOT_LEN];
        file.read_at(off, &mut buf)?;
        let meta = Meta::decode(&buf)?;
        if meta.tx.0 != meta_id {
            return Err(StrataError::Corruption("meta slot holds another record"));
        }
        Ok(meta)
    }

    /// Scans every slot of every file and returns the valid record with the
    /// highest transaction id.
    pub fn latest(&self) -> Result<Option<Meta>> {
        let mut best: Option<Meta> = None;
        for (idx, file) in self.files.iter().enumerate() {
            let len = file.len()?;
            let slots = len / META_SLOT_LEN as u64;
            let mut buf = [0u8; META_SLOT_LEN];
            for slot in 0..slots {
                file.read_at(slot * META_SLOT_LEN as u64, &mut buf)?;
                let Ok(meta) = Meta::decode(&buf) else {
                    continue;
                };
                let expected = slot * self.files.len() as u64 + idx as u64;
                if meta.tx.0 != expected {
                    continue;
                }
                if best.as_ref().map_or(true, |b| meta.tx > b.tx) {
                    best = Some(meta);
                }
            }
        }
        Ok(best)
    }
}
