use crate::storage::vlog::ValueLog;
use crate::types::{PageId, Result, StrataError};

use super::inode::{Inode, InodeBody};
use super::node::{owner_index, NodeReader};
use super::update::RootPtr;

struct Frame {
    entries: Vec<Inode>,
    idx: usize,
    leaf: bool,
}

/// Ordered iterator over the committed entries of one tree.
///
/// The cursor reads pages directly and never sees uncommitted batch
/// entries. Sub-tree descriptors show up as ordinary entries with
/// [`super::INODE_SUBTREE`] set.
pub struct Cursor<'a> {
    reader: NodeReader<'a>,
    vlog: &'a dyn ValueLog,
    root: RootPtr,
    stack: Vec<Frame>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(reader: NodeReader<'a>, vlog: &'a dyn ValueLog, root: RootPtr) -> Self {
        Self {
            reader,
            vlog,
            root,
            stack: Vec::new(),
        }
    }

    /// Positions on the smallest key. Returns false for an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        self.seek(&[])
    }

    /// Positions on the smallest key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.stack.clear();
        if self.root.is_empty() {
            return Ok(false);
        }
        let (mut page, mut overflow) = (self.root.page, self.root.overflow);
        loop {
            let (header, entries) = self.reader.read_entries(page, overflow)?;
            if header.is_leaf() {
                let idx = entries.partition_point(|e| e.key.as_slice() < key);
                self.stack.push(Frame {
                    entries,
                    idx,
                    leaf: true,
                });
                break;
            }
            if entries.is_empty() {
                return Err(StrataError::Corruption("branch page without entries"));
            }
            let idx = owner_index(&entries, key);
            (page, overflow) = child_of(&entries[idx])?;
            self.stack.push(Frame {
                entries,
                idx,
                leaf: false,
            });
        }
        self.settle()
    }

    /// Moves to the next key. Returns false once the tree is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        match self.stack.last_mut() {
            Some(top) if top.leaf => top.idx += 1,
            _ => return Ok(false),
        }
        self.settle()
    }

    /// Current entry.
    pub fn entry(&self) -> Option<&Inode> {
        self.stack
            .last()
            .filter(|f| f.leaf)
            .and_then(|f| f.entries.get(f.idx))
    }

    /// Current key.
    pub fn key(&self) -> Option<&[u8]> {
        self.entry().map(|e| e.key.as_slice())
    }

    /// Current entry flags.
    pub fn flags(&self) -> Option<u16> {
        self.entry().map(|e| e.flags)
    }

    /// Current value, read from the value log when stored there.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        self.entry().map(|e| resolve_value(self.vlog, e)).transpose()
    }

    fn settle(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last() else {
                return Ok(false);
            };
            if top.idx < top.entries.len() {
                if top.leaf {
                    return Ok(true);
                }
                let (page, overflow) = child_of(&top.entries[top.idx])?;
                let (header, entries) = self.reader.read_entries(page, overflow)?;
                self.stack.push(Frame {
                    entries,
                    idx: 0,
                    leaf: header.is_leaf(),
                });
                continue;
            }
            self.stack.pop();
            if let Some(parent) = self.stack.last_mut() {
                parent.idx += 1;
            }
        }
    }
}

fn child_of(entry: &Inode) -> Result<(PageId, u32)> {
    entry
        .child_ptr()
        .ok_or(StrataError::Corruption("branch entry without child pointer"))
}

/// Reads the value of a leaf entry.
pub(crate) fn resolve_value(vlog: &dyn ValueLog, entry: &Inode) -> Result<Vec<u8>> {
    match &entry.body {
        InodeBody::Inline(value) => Ok(value.clone()),
        InodeBody::Indirect(addr) => vlog.read(*addr),
        InodeBody::Child { .. } => Err(StrataError::Corruption("child pointer in leaf page")),
    }
}

/// Point lookup of `key` in the tree rooted at `root`.
pub(crate) fn lookup(reader: &NodeReader<'_>, root: RootPtr, key: &[u8]) -> Result<Option<Inode>> {
    if root.is_empty() {
        return Ok(None);
    }
    let (mut page, mut overflow) = (root.page, root.overflow);
    loop {
        let (header, mut entries) = reader.read_entries(page, overflow)?;
        if header.is_leaf() {
            return Ok(entries
                .binary_search_by(|e| e.key.as_slice().cmp(key))
                .ok()
                .map(|pos| entries.swap_remove(pos)));
        }
        if entries.is_empty() {
            return Err(StrataError::Corruption("branch page without entries"));
        }
        (page, overflow) = child_of(&entries[owner_index(&entries, key)])?;
    }
}
