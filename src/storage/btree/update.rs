use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Scope};

use tracing::{debug, trace};

use crate::primitives::concurrency::{TaskGroup, WorkerPool};
use crate::primitives::pager::Freelist;
use crate::storage::batch::BatchEntry;
use crate::storage::vlog::ValueLog;
use crate::types::{Digest, PageId, Result, StrataError, TxId, ZERO_DIGEST};

use super::inode::Inode;
use super::node::{split_ranges, Node, NodeReader};
use super::spill::{merge_leaf, PageSpiller};
use super::stats::CommitStats;

/// Hands out page runs for one commit: reclaimed extents first, then fresh
/// blocks past the end of the file.
#[derive(Clone, Copy)]
pub(crate) struct Allocator<'a> {
    pub(crate) freelist: &'a Freelist,
    pub(crate) high_water: &'a AtomicU64,
    pub(crate) tx: TxId,
}

impl<'a> Allocator<'a> {
    pub(crate) fn allocate(&self, pages: u32) -> PageId {
        let reused = self.freelist.allocate(self.tx, pages);
        if !reused.is_none() {
            return reused;
        }
        PageId(self.high_water.fetch_add(pages as u64, Ordering::AcqRel))
    }

    pub(crate) fn free(&self, id: PageId, overflow: u32) -> Result<()> {
        self.freelist.free(self.tx, id, overflow)
    }
}

/// Page-building limits shared by every spiller of a commit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SpillConfig {
    pub(crate) page_size: usize,
    pub(crate) threshold: usize,
    pub(crate) fill_ratio: f64,
    pub(crate) inline_value_max: usize,
    pub(crate) compress: bool,
    pub(crate) verify_writes: bool,
}

/// Everything one tree update needs, borrowed for the duration of a commit.
pub(crate) struct UpdateCtx<'a> {
    pub(crate) reader: NodeReader<'a>,
    pub(crate) vlog: &'a dyn ValueLog,
    pub(crate) alloc: Allocator<'a>,
    pub(crate) leaf_pool: &'a WorkerPool,
    pub(crate) branch_pool: &'a WorkerPool,
    pub(crate) stats: &'a CommitStats,
    pub(crate) abort: &'a AtomicBool,
    pub(crate) seq: u64,
    pub(crate) spill: SpillConfig,
}

/// Location and hash of a tree root. `page` is [`PageId::NONE`] for an empty
/// tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootPtr {
    /// Root page.
    pub page: PageId,
    /// Root page overflow.
    pub overflow: u32,
    /// Root node hash.
    pub hash: Digest,
}

impl RootPtr {
    /// The empty tree.
    pub const EMPTY: RootPtr = RootPtr {
        page: PageId::NONE,
        overflow: 0,
        hash: ZERO_DIGEST,
    };

    /// Returns true for the empty tree.
    pub fn is_empty(&self) -> bool {
        self.page.is_none()
    }
}

/// Applies the sorted batch dump `kvs` to the tree rooted at `root` and
/// returns the new root. Old pages are handed to the freelist; nothing is
/// overwritten.
pub(crate) fn update_root(
    ctx: &UpdateCtx<'_>,
    root: RootPtr,
    kvs: &[BatchEntry],
) -> Result<RootPtr> {
    if kvs.is_empty() {
        return Ok(root);
    }
    let sentinel = Arc::new(Node::empty_branch(None));
    let parent = Some(Arc::downgrade(&sentinel));
    let node = if root.is_empty() {
        Node::empty_leaf(parent)
    } else {
        ctx.reader.load(root.page, root.overflow, parent)?
    };
    let node = Arc::new(node);
    thread::scope(|scope| update_node(ctx, scope, node, kvs, 0..kvs.len()))?;
    finalize_root(ctx, sentinel)
}

/// Rebuilds the subtree under `node` with `kvs[range]` merged in, posting
/// the resulting page pointers into the node's parent.
fn update_node<'scope, 'env>(
    ctx: &'env UpdateCtx<'env>,
    scope: &'scope Scope<'scope, 'env>,
    node: Arc<Node>,
    kvs: &'env [BatchEntry],
    range: Range<usize>,
) -> Result<()> {
    let parent = node
        .parent()?
        .ok_or(StrataError::InvariantViolation("node updated without a parent"))?;
    if node.is_leaf() {
        trace!(page = node.page_id().0, keys = range.len(), "btree.leaf.update");
        let existing = node.snapshot();
        let mut spiller = PageSpiller::new(ctx, parent, true);
        merge_leaf(ctx, &existing, &kvs[range], &mut spiller)?;
        spiller.close()?;
    } else {
        update_branch(ctx, scope, &node, kvs, range)?;
        let entries = node.snapshot();
        if entries.is_empty() {
            debug!(page = node.page_id().0, "btree.branch.dropped");
        } else {
            let mut spiller = PageSpiller::new(ctx, parent, false);
            for entry in entries {
                spiller.append(entry)?;
            }
            spiller.close()?;
        }
    }
    free_source(ctx, &node)
}

fn update_branch<'scope, 'env>(
    ctx: &'env UpdateCtx<'env>,
    scope: &'scope Scope<'scope, 'env>,
    node: &Arc<Node>,
    kvs: &'env [BatchEntry],
    range: Range<usize>,
) -> Result<()> {
    let mut group = TaskGroup::new(scope, ctx.abort);
    let dispatched = dispatch_children(ctx, scope, node, kvs, range, &mut group);
    if dispatched.is_err() {
        ctx.abort.store(true, Ordering::Release);
    }
    let joined = group.join();
    dispatched?;
    joined?;
    if node.pending() != 0 {
        return Err(StrataError::InvariantViolation(
            "branch materialized with children in flight",
        ));
    }
    Ok(())
}

fn dispatch_children<'scope, 'env>(
    ctx: &'env UpdateCtx<'env>,
    scope: &'scope Scope<'scope, 'env>,
    node: &Arc<Node>,
    kvs: &'env [BatchEntry],
    range: Range<usize>,
    group: &mut TaskGroup<'scope, 'env, ()>,
) -> Result<()> {
    let children = node.snapshot();
    if children.is_empty() {
        let leaf = Arc::new(Node::empty_leaf(Some(Arc::downgrade(node))));
        spawn_child(ctx, scope, node, leaf, kvs, range, group);
        return Ok(());
    }
    for share in split_ranges(&children, kvs, range) {
        let pointer = &children[share.child];
        let (page, overflow) = pointer
            .child_ptr()
            .ok_or(StrataError::Corruption("branch entry without child pointer"))?;
        let child = ctx
            .reader
            .load(page, overflow, Some(Arc::downgrade(node)))?;
        if child.key() != pointer.key.as_slice() {
            return Err(StrataError::Corruption("child first key differs from pointer key"));
        }
        node.del(&pointer.key)?;
        spawn_child(ctx, scope, node, Arc::new(child), kvs, share.range, group);
    }
    Ok(())
}

fn spawn_child<'scope, 'env>(
    ctx: &'env UpdateCtx<'env>,
    scope: &'scope Scope<'scope, 'env>,
    node: &Arc<Node>,
    child: Arc<Node>,
    kvs: &'env [BatchEntry],
    range: Range<usize>,
    group: &mut TaskGroup<'scope, 'env, ()>,
) {
    let pool = if child.is_leaf() {
        ctx.leaf_pool
    } else {
        ctx.branch_pool
    };
    let parent = Arc::clone(node);
    parent.begin_child();
    group.spawn(pool, move || {
        let result = update_node(ctx, scope, child, kvs, range);
        parent.end_child();
        result
    });
}

fn free_source(ctx: &UpdateCtx<'_>, node: &Node) -> Result<()> {
    if node.page_id().is_none() {
        return Ok(());
    }
    ctx.alloc.free(node.page_id(), node.overflow())?;
    ctx.stats.inc_pages_freed();
    Ok(())
}

/// Turns the pointers collected under the synthetic root parent into a
/// single root: extra levels are built while more than one pointer remains,
/// then branch roots with a single child are collapsed.
fn finalize_root(ctx: &UpdateCtx<'_>, sentinel: Arc<Node>) -> Result<RootPtr> {
    let mut level = sentinel;
    let mut pointers = level.snapshot();
    while pointers.len() > 1 {
        let next = Arc::new(Node::empty_branch(None));
        let mut spiller = PageSpiller::new(ctx, Arc::clone(&next), false);
        for pointer in pointers {
            spiller.append(pointer)?;
        }
        spiller.close()?;
        level = next;
        pointers = level.snapshot();
    }
    let Some(mut root) = pointers.into_iter().next() else {
        debug!("btree.root.empty");
        return Ok(RootPtr::EMPTY);
    };
    loop {
        let (page, overflow) = root
            .child_ptr()
            .ok_or(StrataError::InvariantViolation("root pointer without child"))?;
        let (header, entries) = ctx.reader.read_entries(page, overflow)?;
        if header.is_leaf() || entries.len() != 1 {
            return Ok(RootPtr {
                page,
                overflow,
                hash: root.hash,
            });
        }
        ctx.alloc.free(page, overflow)?;
        ctx.stats.inc_pages_freed();
        debug!(page = page.0, "btree.root.collapse");
        root = single(entries)?;
    }
}

fn single(entries: Vec<Inode>) -> Result<Inode> {
    entries
        .into_iter()
        .next()
        .ok_or(StrataError::InvariantViolation("collapsed root has no child"))
}
