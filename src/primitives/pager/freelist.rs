use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{PageId, Result, StrataError, TxId};

/// Contiguous run of pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages.
    pub len: u32,
}

impl Extent {
    /// Creates an extent.
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    /// Extends `self` by `other` if `other` begins where `self` ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    fn end(&self) -> u64 {
        self.start.0 + self.len as u64
    }
}

#[derive(Default, Debug)]
struct FreeState {
    free: Vec<Extent>,
    pending: BTreeMap<TxId, Vec<Extent>>,
    allocated: BTreeMap<TxId, Vec<Extent>>,
}

impl FreeState {
    fn insert_free(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.free.append(&mut extents);
        self.free.sort_by_key(|e| e.start.0);
        let mut merged: Vec<Extent> = Vec::with_capacity(self.free.len());
        for extent in self.free.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.free = merged;
    }
}

/// Reclaimed page runs, tagged by the transaction that freed them.
///
/// Pages freed in transaction `t` stay pending until [`Freelist::release`] is
/// called with a bound `>= t`; only then may they be handed out again.
/// Allocations are remembered per transaction so a failed commit can return
/// them with [`Freelist::rollback`].
#[derive(Default, Debug)]
pub struct Freelist {
    state: Mutex<FreeState>,
}

impl Freelist {
    /// Creates an empty freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `count` contiguous pages for `tx`. Returns [`PageId::NONE`] when
    /// no free run is long enough; the caller then grows the file.
    pub fn allocate(&self, tx: TxId, count: u32) -> PageId {
        if count == 0 {
            return PageId::NONE;
        }
        let mut state = self.state.lock();
        let Some(pos) = state.free.iter().position(|e| e.len >= count) else {
            return PageId::NONE;
        };
        let extent = &mut state.free[pos];
        let start = extent.start;
        if extent.len == count {
            state.free.remove(pos);
        } else {
            extent.start = PageId(extent.start.0 + count as u64);
            extent.len -= count;
        }
        state
            .allocated
            .entry(tx)
            .or_default()
            .push(Extent::new(start, count));
        start
    }

    /// Marks the page run `[id, id + overflow]` free as of `tx`.
    pub fn free(&self, tx: TxId, id: PageId, overflow: u32) -> Result<()> {
        if id.is_none() {
            return Err(StrataError::InvariantViolation("free of page 0"));
        }
        let len = overflow
            .checked_add(1)
            .ok_or(StrataError::InvariantViolation("page overflow too large"))?;
        self.state
            .lock()
            .pending
            .entry(tx)
            .or_default()
            .push(Extent::new(id, len));
        Ok(())
    }

    /// Makes pages freed by transactions up to and including `upto` allocatable.
    pub fn release(&self, upto: TxId) -> u64 {
        let mut state = self.state.lock();
        let later = state.pending.split_off(&TxId(upto.0.saturating_add(1)));
        let ready = std::mem::replace(&mut state.pending, later);
        let extents: Vec<Extent> = ready.into_values().flatten().collect();
        let pages = extents.iter().map(|e| e.len as u64).sum();
        state.insert_free(extents);
        if pages > 0 {
            debug!(upto = upto.0, pages, "pager.freelist.release");
        }
        pages
    }

    /// Forgets the allocation record of a committed transaction.
    pub fn commit_tx(&self, tx: TxId) {
        self.state.lock().allocated.remove(&tx);
    }

    /// Undoes a failed transaction: drops its pending frees and returns the
    /// pages it took from the freelist.
    pub fn rollback(&self, tx: TxId) {
        let mut state = self.state.lock();
        state.pending.remove(&tx);
        if let Some(taken) = state.allocated.remove(&tx) {
            debug!(tx = tx.0, extents = taken.len(), "pager.freelist.rollback");
            state.insert_free(taken);
        }
    }

    /// Settles a transaction whose commit may or may not be durable: its
    /// allocations stay taken and its frees are dropped, so neither the
    /// previous tree nor the new one loses pages.
    pub fn retain(&self, tx: TxId) {
        let mut state = self.state.lock();
        state.pending.remove(&tx);
        if let Some(kept) = state.allocated.remove(&tx) {
            debug!(tx = tx.0, extents = kept.len(), "pager.freelist.retain");
        }
    }

    /// Pages currently allocatable.
    pub fn free_pages(&self) -> u64 {
        self.state.lock().free.iter().map(|e| e.len as u64).sum()
    }

    /// Pages freed but not yet released.
    pub fn pending_pages(&self) -> u64 {
        self.state
            .lock()
            .pending
            .values()
            .flatten()
            .map(|e| e.len as u64)
            .sum()
    }

    /// Snapshot of the free runs, ordered by start page.
    pub fn extents(&self) -> Vec<Extent> {
        self.state.lock().free.clone()
    }

    /// Highest page number covered by a free run, if any.
    pub fn max_free_end(&self) -> Option<u64> {
        self.state.lock().free.last().map(Extent::end)
    }
}
