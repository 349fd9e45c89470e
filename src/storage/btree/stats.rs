use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of commit statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitStatsSnapshot {
    /// Commits that made a new root durable
    pub commits: u64,
    /// Commits that failed and were rolled back
    pub aborted_commits: u64,
    /// Leaf pages written
    pub leaf_pages_written: u64,
    /// Branch pages written
    pub branch_pages_written: u64,
    /// Pages handed to the freelist
    pub pages_freed: u64,
    /// Values written through the value log
    pub vlog_updates: u64,
    /// Value-log records retired by deletes
    pub vlog_deletes: u64,
    /// Leaf entries emitted by merges
    pub entries_emitted: u64,
}

/// Thread-safe commit counters shared by every tree of one engine.
#[derive(Default, Debug)]
pub struct CommitStats {
    commits: AtomicU64,
    aborted_commits: AtomicU64,
    leaf_pages_written: AtomicU64,
    branch_pages_written: AtomicU64,
    pages_freed: AtomicU64,
    vlog_updates: AtomicU64,
    vlog_deletes: AtomicU64,
    entries_emitted: AtomicU64,
}

impl CommitStats {
    /// Returns a consistent-enough copy of every counter.
    pub fn snapshot(&self) -> CommitStatsSnapshot {
        CommitStatsSnapshot {
            commits: self.commits.load(AtomicOrdering::Relaxed),
            aborted_commits: self.aborted_commits.load(AtomicOrdering::Relaxed),
            leaf_pages_written: self.leaf_pages_written.load(AtomicOrdering::Relaxed),
            branch_pages_written: self.branch_pages_written.load(AtomicOrdering::Relaxed),
            pages_freed: self.pages_freed.load(AtomicOrdering::Relaxed),
            vlog_updates: self.vlog_updates.load(AtomicOrdering::Relaxed),
            vlog_deletes: self.vlog_deletes.load(AtomicOrdering::Relaxed),
            entries_emitted: self.entries_emitted.load(AtomicOrdering::Relaxed),
        }
    }

    pub(crate) fn inc_commits(&self) {
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_aborted_commits(&self) {
        self.aborted_commits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_written(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_pages_written
        } else {
            &self.branch_pages_written
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_freed(&self) {
        self.pages_freed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_vlog_updates(&self) {
        self.vlog_updates.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_vlog_deletes(&self) {
        self.vlog_deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_entries_emitted(&self) {
        self.entries_emitted.fetch_add(1, AtomicOrdering::Relaxed);
    }
}
