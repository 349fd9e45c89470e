use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::primitives::compress::Compressor;
use crate::primitives::pager::PageStore;
use crate::storage::batch::BatchEntry;
use crate::storage::options::VerifyLevel;
use crate::types::page::PageHeader;
use crate::types::{Digest, HashPool, PageId, Result, StrataError, ZERO_DIGEST};

use super::inode::{decode_entries, Inode};

/// In-memory decode of one page.
///
/// Entries are kept sorted and unique by key. All mutation goes through the
/// node's lock, so sibling tasks may post their new pointers concurrently.
pub struct Node {
    page_id: PageId,
    overflow: u32,
    is_leaf: bool,
    key: Vec<u8>,
    hash: Digest,
    entries: Mutex<Vec<Inode>>,
    parent: Option<Weak<Node>>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("page_id", &self.page_id)
            .field("overflow", &self.overflow)
            .field("is_leaf", &self.is_leaf)
            .field("entries", &self.len())
            .finish()
    }
}

impl Node {
    /// Fresh, page-less leaf.
    pub fn empty_leaf(parent: Option<Weak<Node>>) -> Self {
        Self::with_entries(PageId::NONE, 0, true, ZERO_DIGEST, Vec::new(), parent)
    }

    /// Fresh, page-less branch. Also serves as the synthetic parent of a root.
    pub fn empty_branch(parent: Option<Weak<Node>>) -> Self {
        Self::with_entries(PageId::NONE, 0, false, ZERO_DIGEST, Vec::new(), parent)
    }

    pub(crate) fn with_entries(
        page_id: PageId,
        overflow: u32,
        is_leaf: bool,
        hash: Digest,
        entries: Vec<Inode>,
        parent: Option<Weak<Node>>,
    ) -> Self {
        let key = entries.first().map(|e| e.key.clone()).unwrap_or_default();
        Self {
            page_id,
            overflow,
            is_leaf,
            key,
            hash,
            entries: Mutex::new(entries),
            parent,
            pending: AtomicUsize::new(0),
        }
    }

    /// Page the node was read from, or [`PageId::NONE`].
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Overflow of the source page.
    pub fn overflow(&self) -> u32 {
        self.overflow
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// First key at load time; the key of this node's pointer in its parent.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Node hash recorded in the source page.
    pub fn hash(&self) -> Digest {
        self.hash
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<Inode> {
        self.entries.lock().clone()
    }

    /// Upgrades the parent reference.
    pub fn parent(&self) -> Result<Option<Arc<Node>>> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or(StrataError::InvariantViolation("parent node dropped mid-update")),
        }
    }

    /// Inserts `inode`, replacing the entry with the same key; `old_key`, if
    /// given and different, is removed first.
    pub fn put(&self, old_key: Option<&[u8]>, inode: Inode) -> Result<()> {
        if inode.key.is_empty() {
            return Err(StrataError::InvariantViolation("zero-length key"));
        }
        let mut entries = self.entries.lock();
        if let Some(old) = old_key.filter(|old| *old != inode.key.as_slice()) {
            if let Ok(pos) = entries.binary_search_by(|e| e.key.as_slice().cmp(old)) {
                entries.remove(pos);
            }
        }
        match entries.binary_search_by(|e| e.key.as_slice().cmp(&inode.key)) {
            Ok(pos) => entries[pos] = inode,
            Err(pos) => entries.insert(pos, inode),
        }
        Ok(())
    }

    /// Removes and returns the entry keyed `key`.
    pub fn del(&self, key: &[u8]) -> Result<Inode> {
        let mut entries = self.entries.lock();
        let pos = entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .map_err(|_| StrataError::InvariantViolation("child pointer not found"))?;
        Ok(entries.remove(pos))
    }

    /// Tasks dispatched by this node that have not finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn begin_child(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_child(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Index of the entry owning `key`: the last entry whose key is `<= key`,
/// clamped to 0.
pub fn owner_index(children: &[Inode], key: &[u8]) -> usize {
    children
        .partition_point(|c| c.key.as_slice() <= key)
        .saturating_sub(1)
}

/// Share of a batch range routed to one child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildRange {
    /// Index of the child entry.
    pub child: usize,
    /// Half-open range into the batch dump.
    pub range: Range<usize>,
}

/// Partitions `kvs[range]` across `children`.
///
/// Child `i` receives the keys below child `i + 1`'s key; a key equal to a
/// boundary belongs to the child that starts there. Keys below the first
/// child's key go to the first child. Children with an empty share are left
/// out. The returned ranges are contiguous and cover `range` exactly.
pub fn split_ranges(
    children: &[Inode],
    kvs: &[BatchEntry],
    range: Range<usize>,
) -> SmallVec<[ChildRange; 8]> {
    let mut out = SmallVec::new();
    if range.is_empty() || children.is_empty() {
        return out;
    }
    let first = owner_index(children, &kvs[range.start].key);
    let last = owner_index(children, &kvs[range.end - 1].key);
    if first == last {
        out.push(ChildRange {
            child: first,
            range,
        });
        return out;
    }
    let mut from = range.start;
    for i in first..last {
        let boundary = children[i + 1].key.as_slice();
        let split = from + kvs[from..range.end].partition_point(|kv| kv.key.as_slice() < boundary);
        if split > from {
            out.push(ChildRange {
                child: i,
                range: from..split,
            });
        }
        from = split;
    }
    out.push(ChildRange {
        child: last,
        range: from..range.end,
    });
    out
}

/// Hash of a node: digest over the concatenated entry hashes.
pub fn node_hash(hasher: &HashPool, entries: &[Inode]) -> Digest {
    let parts: Vec<&[u8]> = entries.iter().map(|e| &e.hash[..]).collect();
    hasher.digest(&parts)
}

/// Returns an error unless keys are strictly ascending.
pub fn check_sorted(entries: &[Inode]) -> Result<()> {
    if entries.windows(2).all(|w| w[0].key < w[1].key) {
        Ok(())
    } else {
        Err(StrataError::InvariantViolation("node keys out of order"))
    }
}

/// Reads and decodes pages into nodes.
#[derive(Clone, Copy)]
pub struct NodeReader<'a> {
    pub(crate) store: &'a dyn PageStore,
    pub(crate) compressor: &'a dyn Compressor,
    pub(crate) hasher: &'a HashPool,
    pub(crate) verify: VerifyLevel,
}

impl<'a> NodeReader<'a> {
    /// Reads a page and decodes its entries.
    pub fn read_entries(&self, page: PageId, overflow: u32) -> Result<(PageHeader, Vec<Inode>)> {
        let page = self.store.read(page, overflow)?;
        let header = page.header().clone();
        let entries = if page.is_compressed() {
            let mut plain = Vec::new();
            self.compressor.decode(&mut plain, page.payload())?;
            decode_entries(&plain, header.count as usize, header.is_leaf())?
        } else {
            decode_entries(page.payload(), header.count as usize, header.is_leaf())?
        };
        if self.verify == VerifyLevel::Full {
            check_sorted(&entries)
                .map_err(|_| StrataError::Corruption("page keys out of order"))?;
            if node_hash(self.hasher, &entries) != header.hash {
                return Err(StrataError::Corruption("node hash mismatch"));
            }
        }
        Ok((header, entries))
    }

    /// Loads the node stored at `page`.
    pub fn load(&self, page: PageId, overflow: u32, parent: Option<Weak<Node>>) -> Result<Node> {
        let (header, entries) = self.read_entries(page, overflow)?;
        Ok(Node::with_entries(
            page,
            overflow,
            header.is_leaf(),
            header.hash,
            entries,
            parent,
        ))
    }
}
