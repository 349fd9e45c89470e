//! Out-of-line value storage.
//!
//! Values are appended to segment files as self-checking records and
//! addressed by `(file_id, index)`, the ordinal of the record in its segment.
//! Replacing or deleting a value retires its old record; retirements are
//! applied in place (state byte rewritten) only when the owning commit is
//! durable, so a failed commit leaves the previous tree fully readable.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::{read_u32, Digest, Result, StrataError, DIGEST_LEN};

/// Bytes preceding the value in a record.
pub const RECORD_HDR_LEN: usize = 4 + 1 + 8 + 4 + DIGEST_LEN;

const STATE_LIVE: u8 = 1;
const STATE_DELETED: u8 = 2;
const STATE_OFFSET: u64 = 4;

/// Back-reference from a leaf entry into the value log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VlogAddr {
    /// Segment id.
    pub file_id: u64,
    /// Record ordinal within the segment.
    pub index: u64,
}

impl VlogAddr {
    /// "No prior location", used for pure inserts.
    pub const NONE: VlogAddr = VlogAddr {
        file_id: u64::MAX,
        index: u64::MAX,
    };

    /// Creates an address.
    pub fn new(file_id: u64, index: u64) -> Self {
        Self { file_id, index }
    }

    /// Returns true for [`VlogAddr::NONE`].
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Debug for VlogAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("VlogAddr(none)")
        } else {
            write!(f, "VlogAddr({}:{})", self.file_id, self.index)
        }
    }
}

/// Storage for values redirected out of leaves.
pub trait ValueLog: Send + Sync {
    /// Stores `value` under content hash `hash` and returns its address.
    /// `old`, unless [`VlogAddr::NONE`], is the record being replaced.
    fn update(&self, hash: &Digest, value: &[u8], old: VlogAddr, seq: u64) -> Result<VlogAddr>;
    /// Retires the record at `addr`.
    fn delete(&self, addr: VlogAddr) -> Result<()>;
    /// Reads the value stored at `addr`.
    fn read(&self, addr: VlogAddr) -> Result<Vec<u8>>;
    /// Flushes appended records to stable storage.
    fn sync(&self) -> Result<()>;
    /// Applies retirements of the commit that just became durable.
    fn commit(&self) -> Result<usize>;
    /// Discards the current commit: appended records are marked deleted and
    /// retirements are forgotten.
    fn rollback(&self) -> Result<()>;
    /// Settles a commit that may or may not be durable: appended records
    /// stay live and retirements are dropped. Returns the number of
    /// retirements dropped.
    fn forget(&self) -> usize;
}

type SegmentOpener = Box<dyn Fn(u64) -> Result<Arc<dyn FileIo>> + Send + Sync>;

struct Segment {
    io: Arc<dyn FileIo>,
    offsets: Vec<u64>,
    len: u64,
}

#[derive(Default)]
struct VlogState {
    segments: BTreeMap<u64, Segment>,
    active: u64,
    retired: Vec<VlogAddr>,
    appended: Vec<VlogAddr>,
}

/// Segmented append-only [`ValueLog`].
pub struct FileValueLog {
    dir: Option<PathBuf>,
    opener: SegmentOpener,
    segment_bytes: u64,
    no_sync: bool,
    state: Mutex<VlogState>,
    appends: AtomicU64,
    deletes: AtomicU64,
}

fn segment_file_name(file_id: u64) -> String {
    format!("{file_id:08}.vlog")
}

impl FileValueLog {
    /// Opens the segments under `dir`, creating the directory as needed, and
    /// rescans every record.
    pub fn open(dir: &Path, segment_bytes: u64, no_sync: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".vlog") {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        let root = dir.to_path_buf();
        let opener_root = root.clone();
        let opener: SegmentOpener = Box::new(move |id| {
            let io = StdFileIo::open(opener_root.join(segment_file_name(id)))?;
            Ok(Arc::new(io) as Arc<dyn FileIo>)
        });
        let log = Self::with_opener(Some(root), opener, segment_bytes, no_sync);
        {
            let mut state = log.state.lock();
            for id in ids {
                let io = (log.opener)(id)?;
                let segment = scan_segment(id, io)?;
                state.segments.insert(id, segment);
                state.active = id;
            }
        }
        info!(
            dir = %dir.display(),
            segments = log.segment_count(),
            "vlog.open"
        );
        Ok(log)
    }

    /// Creates a value log whose segments live in memory.
    pub fn in_memory(segment_bytes: u64) -> Self {
        let opener: SegmentOpener =
            Box::new(|_| Ok(Arc::new(MemFileIo::new()) as Arc<dyn FileIo>));
        Self::with_opener(None, opener, segment_bytes, true)
    }

    fn with_opener(
        dir: Option<PathBuf>,
        opener: SegmentOpener,
        segment_bytes: u64,
        no_sync: bool,
    ) -> Self {
        Self {
            dir,
            opener,
            segment_bytes: segment_bytes.max(RECORD_HDR_LEN as u64),
            no_sync,
            state: Mutex::new(VlogState::default()),
            appends: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Directory holding the segments, if file-backed.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Records appended since open.
    pub fn appends(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    /// Retirements applied since open.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns true if the record at `addr` has not been deleted on disk.
    pub fn is_live(&self, addr: VlogAddr) -> Result<bool> {
        let (io, off) = self.locate(addr)?;
        let mut state = [0u8; 1];
        io.read_at(off + STATE_OFFSET, &mut state)?;
        Ok(state[0] == STATE_LIVE)
    }

    fn locate(&self, addr: VlogAddr) -> Result<(Arc<dyn FileIo>, u64)> {
        let state = self.state.lock();
        let segment = state
            .segments
            .get(&addr.file_id)
            .ok_or(StrataError::Corruption("value log segment missing"))?;
        let idx = usize::try_from(addr.index)
            .map_err(|_| StrataError::Corruption("value log index out of range"))?;
        let off = *segment
            .offsets
            .get(idx)
            .ok_or(StrataError::Corruption("value log index out of range"))?;
        Ok((segment.io.clone(), off))
    }

    fn append(&self, hash: &Digest, value: &[u8], seq: u64) -> Result<VlogAddr> {
        let record = encode_record(hash, value, seq)?;
        let mut state = self.state.lock();
        let needs_roll = match state.segments.get(&state.active) {
            None => true,
            Some(seg) => seg.len > 0 && seg.len + record.len() as u64 > self.segment_bytes,
        };
        if needs_roll {
            let next = if state.segments.is_empty() {
                0
            } else {
                state.active + 1
            };
            let io = (self.opener)(next)?;
            state.segments.insert(
                next,
                Segment {
                    io,
                    offsets: Vec::new(),
                    len: 0,
                },
            );
            state.active = next;
            debug!(file_id = next, "vlog.segment.roll");
        }
        let active = state.active;
        let segment = state
            .segments
            .get_mut(&active)
            .ok_or(StrataError::InvariantViolation("active value log segment missing"))?;
        segment.io.write_at(segment.len, &record)?;
        let addr = VlogAddr::new(active, segment.offsets.len() as u64);
        segment.offsets.push(segment.len);
        segment.len += record.len() as u64;
        state.appended.push(addr);
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn mark(&self, addr: VlogAddr, flag: u8) -> Result<()> {
        let (io, off) = self.locate(addr)?;
        io.write_at(off + STATE_OFFSET, &[flag])
    }
}

impl ValueLog for FileValueLog {
    fn update(&self, hash: &Digest, value: &[u8], old: VlogAddr, seq: u64) -> Result<VlogAddr> {
        let addr = self.append(hash, value, seq)?;
        if !old.is_none() {
            self.state.lock().retired.push(old);
        }
        Ok(addr)
    }

    fn delete(&self, addr: VlogAddr) -> Result<()> {
        if addr.is_none() {
            return Ok(());
        }
        self.state.lock().retired.push(addr);
        Ok(())
    }

    fn read(&self, addr: VlogAddr) -> Result<Vec<u8>> {
        if addr.is_none() {
            return Err(StrataError::Invalid("read of empty value log address"));
        }
        let (io, off) = self.locate(addr)?;
        let mut hdr = [0u8; RECORD_HDR_LEN];
        io.read_at(off, &mut hdr)?;
        if hdr[STATE_OFFSET as usize] != STATE_LIVE {
            return Err(StrataError::Corruption("value log record deleted"));
        }
        let len = read_u32(&hdr, 13)? as usize;
        let mut record = vec![0u8; RECORD_HDR_LEN + len];
        record[..RECORD_HDR_LEN].copy_from_slice(&hdr);
        io.read_at(off + RECORD_HDR_LEN as u64, &mut record[RECORD_HDR_LEN..])?;
        if crc32fast::hash(&record[5..]) != read_u32(&record, 0)? {
            return Err(StrataError::Corruption("value log crc mismatch"));
        }
        record.drain(..RECORD_HDR_LEN);
        Ok(record)
    }

    fn sync(&self) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        let ios: Vec<Arc<dyn FileIo>> = self
            .state
            .lock()
            .segments
            .values()
            .map(|s| s.io.clone())
            .collect();
        for io in ios {
            io.sync_all()?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<usize> {
        let retired = {
            let mut state = self.state.lock();
            state.appended.clear();
            std::mem::take(&mut state.retired)
        };
        for addr in &retired {
            self.mark(*addr, STATE_DELETED)?;
        }
        self.deletes
            .fetch_add(retired.len() as u64, Ordering::Relaxed);
        Ok(retired.len())
    }

    fn rollback(&self) -> Result<()> {
        let appended = {
            let mut state = self.state.lock();
            state.retired.clear();
            std::mem::take(&mut state.appended)
        };
        if !appended.is_empty() {
            warn!(records = appended.len(), "vlog.rollback");
        }
        for addr in appended {
            self.mark(addr, STATE_DELETED)?;
        }
        Ok(())
    }

    fn forget(&self) -> usize {
        let mut state = self.state.lock();
        state.appended.clear();
        let dropped = std::mem::take(&mut state.retired).len();
        if dropped > 0 {
            warn!(records = dropped, "vlog.forget");
        }
        dropped
    }
}

fn encode_record(hash: &Digest, value: &[u8], seq: u64) -> Result<Vec<u8>> {
    let len = u32::try_from(value.len()).map_err(|_| StrataError::Invalid("value too large"))?;
    let mut record = Vec::with_capacity(RECORD_HDR_LEN + value.len());
    record.extend_from_slice(&[0u8; 4]);
    record.push(STATE_LIVE);
    record.extend_from_slice(&seq.to_be_bytes());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(hash);
    record.extend_from_slice(value);
    let crc = crc32fast::hash(&record[5..]);
    record[..4].copy_from_slice(&crc.to_be_bytes());
    Ok(record)
}

/// Rebuilds the offsets table of a segment; a torn tail is cut off.
fn scan_segment(file_id: u64, io: Arc<dyn FileIo>) -> Result<Segment> {
    let file_len = io.len()?;
    let mut offsets = Vec::new();
    let mut off = 0u64;
    let mut hdr = [0u8; RECORD_HDR_LEN];
    while off + RECORD_HDR_LEN as u64 <= file_len {
        io.read_at(off, &mut hdr)?;
        let state = hdr[STATE_OFFSET as usize];
        if state != STATE_LIVE && state != STATE_DELETED {
            break;
        }
        let len = read_u32(&hdr, 13)? as u64;
        let end = off + RECORD_HDR_LEN as u64 + len;
        if end > file_len {
            break;
        }
        let mut body = vec![0u8; RECORD_HDR_LEN + len as usize];
        io.read_at(off, &mut body)?;
        if crc32fast::hash(&body[5..]) != read_u32(&body, 0)? {
            break;
        }
        offsets.push(off);
        off = end;
    }
    if off < file_len {
        warn!(file_id, valid = off, file_len, "vlog.segment.torn_tail");
        io.truncate(off)?;
    }
    Ok(Segment {
        io,
        offsets,
        len: off,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const H: Digest = [4u8; DIGEST_LEN];

    #[test]
    fn append_read_and_address_ordinals() {
        let log = FileValueLog::in_memory(1 << 20);
        let a = log.update(&H, b"alpha", VlogAddr::NONE, 1).unwrap();
        let b = log.update(&H, b"beta", VlogAddr::NONE, 1).unwrap();
        assert_eq!(a, VlogAddr::new(0, 0));
        assert_eq!(b, VlogAddr::new(0, 1));
        assert_eq!(log.read(a).unwrap(), b"alpha");
        assert_eq!(log.read(b).unwrap(), b"beta");
    }

    #[test]
    fn retirement_applies_on_commit_only() {
        let log = FileValueLog::in_memory(1 << 20);
        let old = log.update(&H, b"v1", VlogAddr::NONE, 1).unwrap();
        log.commit().unwrap();
        let new = log.update(&H, b"v2", old, 2).unwrap();
        assert!(log.is_live(old).unwrap());
        assert_eq!(log.commit().unwrap(), 1);
        assert!(!log.is_live(old).unwrap());
        assert!(log.read(old).is_err());
        assert_eq!(log.read(new).unwrap(), b"v2");
        assert_eq!(log.deletes(), 1);
    }

    #[test]
    fn rollback_discards_appends_and_keeps_old_values() {
        let log = FileValueLog::in_memory(1 << 20);
        let old = log.update(&H, b"v1", VlogAddr::NONE, 1).unwrap();
        log.commit().unwrap();
        let new = log.update(&H, b"v2", old, 2).unwrap();
        log.delete(old).unwrap();
        log.rollback().unwrap();
        assert!(log.is_live(old).unwrap());
        assert!(!log.is_live(new).unwrap());
        assert_eq!(log.commit().unwrap(), 0);
    }

    #[test]
    fn forget_keeps_both_generations_live() {
        let log = FileValueLog::in_memory(1 << 20);
        let old = log.update(&H, b"v1", VlogAddr::NONE, 1).unwrap();
        log.commit().unwrap();
        let new = log.update(&H, b"v2", old, 2).unwrap();
        assert_eq!(log.forget(), 1);
        log.rollback().unwrap();
        assert_eq!(log.commit().unwrap(), 0);
        assert_eq!(log.read(old).unwrap(), b"v1");
        assert_eq!(log.read(new).unwrap(), b"v2");
    }

    #[test]
    fn segments_roll_over() {
        let log = FileValueLog::in_memory(64);
        let a = log.update(&H, &[1u8; 20], VlogAddr::NONE, 1).unwrap();
        let b = log.update(&H, &[2u8; 20], VlogAddr::NONE, 1).unwrap();
        assert_eq!(a.file_id, 0);
        assert_eq!(b, VlogAddr::new(1, 0));
        assert_eq!(log.segment_count(), 2);
    }

    #[test]
    fn reopen_rescans_and_cuts_torn_tail() {
        let dir = tempdir().unwrap();
        let (a, b) = {
            let log = FileValueLog::open(dir.path(), 1 << 20, false).unwrap();
            let a = log.update(&H, b"first", VlogAddr::NONE, 1).unwrap();
            let b = log.update(&H, b"second", VlogAddr::NONE, 1).unwrap();
            log.sync().unwrap();
            (a, b)
        };
        let seg = StdFileIo::open(dir.path().join(segment_file_name(0))).unwrap();
        let len = seg.len().unwrap();
        seg.write_at(len, &[STATE_LIVE; 9]).unwrap();

        let log = FileValueLog::open(dir.path(), 1 << 20, false).unwrap();
        assert_eq!(log.read(a).unwrap(), b"first");
        assert_eq!(log.read(b).unwrap(), b"second");
        assert_eq!(seg.len().unwrap(), len);
        let c = log.update(&H, b"third", VlogAddr::NONE, 2).unwrap();
        assert_eq!(c, VlogAddr::new(0, 2));
    }
}
