use crate::primitives::bytes::{buf::Cursor, var};
use crate::storage::vlog::VlogAddr;
use crate::types::{Digest, PageId, Result, StrataError, DIGEST_LEN};

/// Entry flag: the inline value is a sub-tree descriptor.
pub const INODE_SUBTREE: u16 = 0x0001;

const TAG_CHILD: u8 = 0;
const TAG_INLINE: u8 = 1;
const TAG_INDIRECT: u8 = 2;

/// Payload of one node entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InodeBody {
    /// Branch entry: pointer to a child page.
    Child {
        /// Child page id.
        page: PageId,
        /// Child page overflow.
        overflow: u32,
    },
    /// Leaf entry with its value stored in the page.
    Inline(Vec<u8>),
    /// Leaf entry with its value in the value log.
    Indirect(VlogAddr),
}

/// One entry of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    /// Entry key. For branch entries, the first key of the child.
    pub key: Vec<u8>,
    /// Entry flags.
    pub flags: u16,
    /// Content hash: `H(key ‖ value)` for leaf entries, the child's node hash
    /// for branch entries.
    pub hash: Digest,
    /// Pointer or value.
    pub body: InodeBody,
}

impl Inode {
    /// Builds a branch entry.
    pub fn child(key: Vec<u8>, page: PageId, overflow: u32, hash: Digest) -> Self {
        Self {
            key,
            flags: 0,
            hash,
            body: InodeBody::Child { page, overflow },
        }
    }

    /// Child pointer of a branch entry.
    pub fn child_ptr(&self) -> Option<(PageId, u32)> {
        match self.body {
            InodeBody::Child { page, overflow } => Some((page, overflow)),
            _ => None,
        }
    }

    /// Returns true if the entry describes a sub-tree.
    pub fn is_subtree(&self) -> bool {
        self.flags & INODE_SUBTREE != 0
    }

    /// Value-log address of an indirect leaf entry.
    pub fn vlog_addr(&self) -> VlogAddr {
        match self.body {
            InodeBody::Indirect(addr) => addr,
            _ => VlogAddr::NONE,
        }
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        let body = match &self.body {
            InodeBody::Child { .. } => 12,
            InodeBody::Inline(value) => var::encoded_len(value.len() as u64) + value.len(),
            InodeBody::Indirect(_) => 16,
        };
        var::encoded_len(self.key.len() as u64) + self.key.len() + 2 + 1 + body + DIGEST_LEN
    }

    /// Appends the serialized entry to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(self.key.len() as u64, out);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.flags.to_be_bytes());
        match &self.body {
            InodeBody::Child { page, overflow } => {
                out.push(TAG_CHILD);
                out.extend_from_slice(&page.0.to_be_bytes());
                out.extend_from_slice(&overflow.to_be_bytes());
            }
            InodeBody::Inline(value) => {
                out.push(TAG_INLINE);
                var::encode_u64(value.len() as u64, out);
                out.extend_from_slice(value);
            }
            InodeBody::Indirect(addr) => {
                out.push(TAG_INDIRECT);
                out.extend_from_slice(&addr.file_id.to_be_bytes());
                out.extend_from_slice(&addr.index.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.hash);
    }

    /// Reads one entry; `leaf` selects which tags are legal.
    pub fn decode(cur: &mut Cursor<'_>, leaf: bool) -> Result<Self> {
        let key = cur.len_prefixed()?.to_vec();
        if key.is_empty() {
            return Err(StrataError::Corruption("zero-length key in page"));
        }
        let flags = cur.u16()?;
        let tag = cur.u8()?;
        let body = match (tag, leaf) {
            (TAG_CHILD, false) => {
                let page = PageId(cur.u64()?);
                let overflow = cur.u32()?;
                if page.is_none() {
                    return Err(StrataError::Corruption("branch entry points at page 0"));
                }
                InodeBody::Child { page, overflow }
            }
            (TAG_INLINE, true) => InodeBody::Inline(cur.len_prefixed()?.to_vec()),
            (TAG_INDIRECT, true) => {
                let file_id = cur.u64()?;
                let index = cur.u64()?;
                InodeBody::Indirect(VlogAddr::new(file_id, index))
            }
            (TAG_CHILD, true) => return Err(StrataError::Corruption("child pointer in leaf page")),
            (TAG_INLINE | TAG_INDIRECT, false) => {
                return Err(StrataError::Corruption("value entry in branch page"))
            }
            _ => return Err(StrataError::Corruption("unknown entry tag")),
        };
        let hash = cur.digest()?;
        Ok(Self {
            key,
            flags,
            hash,
            body,
        })
    }
}

/// Serializes a node's entries.
pub fn encode_entries(entries: &[Inode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.iter().map(Inode::encoded_len).sum());
    for entry in entries {
        entry.encode(&mut out);
    }
    out
}

/// Parses exactly `count` entries filling `payload`.
pub fn decode_entries(payload: &[u8], count: usize, leaf: bool) -> Result<Vec<Inode>> {
    let mut cur = Cursor::new(payload);
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(Inode::decode(&mut cur, leaf)?);
    }
    if !cur.is_empty() {
        return Err(StrataError::Corruption("trailing bytes after page entries"));
    }
    Ok(entries)
}
