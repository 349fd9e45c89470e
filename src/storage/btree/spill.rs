use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::primitives::pager::{page_span, Page};
use crate::storage::batch::BatchEntry;
use crate::storage::vlog::VlogAddr;
use crate::types::page::flags;
use crate::types::Result;

use super::inode::{encode_entries, Inode, InodeBody, INODE_SUBTREE};
use super::node::{check_sorted, node_hash, Node};
use super::update::UpdateCtx;

/// A page never closes with fewer entries than this unless the whole
/// output is smaller.
pub const MIN_ENTRIES_PER_PAGE: usize = 4;

#[derive(Default)]
struct SpillBuffer {
    entries: Vec<Inode>,
    size: usize,
}

impl SpillBuffer {
    fn push(&mut self, inode: Inode, encoded: usize) {
        self.size += encoded;
        self.entries.push(inode);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn absorb(&mut self, other: SpillBuffer) {
        self.size += other.size;
        self.entries.extend(other.entries);
    }
}

/// Double-buffered page writer for one node's output.
///
/// Entries accumulate in the active buffer until the next entry would push it
/// past the threshold (and it already holds [`MIN_ENTRIES_PER_PAGE`]). The
/// active buffer then moves to the flush slot, whose previous content is
/// written as a new page first. Every page written posts a pointer keyed by
/// its first entry into `parent`.
pub(crate) struct PageSpiller<'c, 'a> {
    ctx: &'c UpdateCtx<'a>,
    parent: Arc<Node>,
    leaf: bool,
    active: SpillBuffer,
    flush_slot: Option<SpillBuffer>,
}

impl<'c, 'a> PageSpiller<'c, 'a> {
    pub(crate) fn new(ctx: &'c UpdateCtx<'a>, parent: Arc<Node>, leaf: bool) -> Self {
        Self {
            ctx,
            parent,
            leaf,
            active: SpillBuffer::default(),
            flush_slot: None,
        }
    }

    /// Adds the next entry in key order.
    pub(crate) fn append(&mut self, inode: Inode) -> Result<()> {
        let encoded = inode.encoded_len();
        if self.active.len() >= MIN_ENTRIES_PER_PAGE
            && self.active.size + encoded > self.ctx.spill.threshold
        {
            self.rotate()?;
        }
        if self.leaf {
            self.ctx.stats.inc_entries_emitted();
        }
        self.active.push(inode, encoded);
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if self.flush_slot.is_some() {
            self.flush()?;
        }
        self.flush_slot = Some(std::mem::take(&mut self.active));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.flush_slot.as_ref().map_or(0, SpillBuffer::len)
    }

    /// Writes the flush slot as a new page and returns the pointer posted to
    /// the parent.
    pub(crate) fn flush(&mut self) -> Result<Option<Inode>> {
        match self.flush_slot.take() {
            Some(buf) if !buf.is_empty() => self.write_page(buf).map(Some),
            _ => Ok(None),
        }
    }

    /// Writes everything still buffered. A short trailing buffer is folded
    /// into the flush slot instead of becoming its own page.
    pub(crate) fn close(mut self) -> Result<()> {
        let tail = std::mem::take(&mut self.active);
        let fold_limit = self.ctx.spill.threshold as f64 * self.ctx.spill.fill_ratio;
        let fold = !tail.is_empty()
            && self.flush_slot.is_some()
            && ((tail.size as f64) < fold_limit || tail.len() < MIN_ENTRIES_PER_PAGE);
        if fold {
            if let Some(slot) = self.flush_slot.as_mut() {
                slot.absorb(tail);
            }
            self.flush()?;
        } else {
            self.flush()?;
            if !tail.is_empty() {
                self.flush_slot = Some(tail);
                self.flush()?;
            }
        }
        Ok(())
    }

    fn write_page(&self, buf: SpillBuffer) -> Result<Inode> {
        let ctx = self.ctx;
        if ctx.spill.verify_writes {
            check_sorted(&buf.entries)?;
        }
        let raw = encode_entries(&buf.entries);
        let mut page_flags = if self.leaf { flags::LEAF } else { flags::BRANCH };
        let payload = if ctx.spill.compress {
            page_flags |= flags::COMPRESSED;
            let mut out = Vec::with_capacity(raw.len() / 2);
            ctx.reader.compressor.encode(&mut out, &raw)?;
            out
        } else {
            raw
        };
        let hash = node_hash(ctx.reader.hasher, &buf.entries);
        let overflow = page_span(payload.len(), ctx.spill.page_size)?;
        let id = ctx.alloc.allocate(overflow + 1);
        let page = Page::build(
            id,
            ctx.spill.page_size,
            page_flags,
            buf.entries.len(),
            hash,
            &payload,
        )?;
        ctx.reader.store.write(&page)?;
        ctx.stats.inc_pages_written(self.leaf);
        let first_key = buf.entries[0].key.clone();
        debug!(
            page = id.0,
            overflow,
            entries = buf.entries.len(),
            bytes = buf.size,
            leaf = self.leaf,
            "btree.page.flush"
        );
        let pointer = Inode::child(first_key, id, overflow, hash);
        self.parent.put(None, pointer.clone())?;
        Ok(pointer)
    }
}

/// Merges a leaf's entries with its share of the batch, in key order.
///
/// Each incoming key is compared once against the same snapshot of existing
/// entries. Tombstones drop the existing entry and retire its value-log
/// record; tombstones for absent keys emit nothing.
pub(crate) fn merge_leaf(
    ctx: &UpdateCtx<'_>,
    existing: &[Inode],
    kvs: &[BatchEntry],
    out: &mut PageSpiller<'_, '_>,
) -> Result<()> {
    let (mut i, mut j) = (0, 0);
    loop {
        let ord = match (existing.get(i), kvs.get(j)) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(old), Some(kv)) => old.key.as_slice().cmp(kv.key.as_slice()),
        };
        match ord {
            Ordering::Less => {
                out.append(existing[i].clone())?;
                i += 1;
            }
            Ordering::Greater => {
                if let Some(inode) = new_entry(ctx, &kvs[j], VlogAddr::NONE)? {
                    out.append(inode)?;
                }
                j += 1;
            }
            Ordering::Equal => {
                let old_addr = existing[i].vlog_addr();
                match new_entry(ctx, &kvs[j], old_addr)? {
                    Some(inode) => out.append(inode)?,
                    None => {
                        if !old_addr.is_none() {
                            ctx.vlog.delete(old_addr)?;
                            ctx.stats.inc_vlog_deletes();
                        }
                    }
                }
                i += 1;
                j += 1;
            }
        }
    }
    Ok(())
}

/// Builds the leaf entry for an incoming write; `None` for tombstones.
fn new_entry(ctx: &UpdateCtx<'_>, kv: &BatchEntry, old: VlogAddr) -> Result<Option<Inode>> {
    let Some(value) = kv.value.as_deref() else {
        return Ok(None);
    };
    let hash = ctx.reader.hasher.digest(&[&kv.key, value]);
    let inline = kv.flags & INODE_SUBTREE != 0 || value.len() <= ctx.spill.inline_value_max;
    let body = if inline {
        if !old.is_none() {
            ctx.vlog.delete(old)?;
            ctx.stats.inc_vlog_deletes();
        }
        InodeBody::Inline(value.to_vec())
    } else {
        let addr = ctx.vlog.update(&hash, value, old, ctx.seq)?;
        ctx.stats.inc_vlog_updates();
        InodeBody::Indirect(addr)
    };
    Ok(Some(Inode {
        key: kv.key.clone(),
        flags: kv.flags,
        hash,
        body,
    }))
}
