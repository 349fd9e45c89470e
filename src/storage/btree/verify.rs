use serde::Serialize;

use crate::storage::vlog::ValueLog;
use crate::types::PageId;

use super::inode::{Inode, InodeBody};
use super::node::{check_sorted, node_hash, NodeReader};
use super::update::RootPtr;

const MAX_FINDINGS: usize = 32;

/// Page and entry totals gathered while walking a tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyCounts {
    /// Leaf pages visited.
    pub leaves: u64,
    /// Branch pages visited.
    pub branches: u64,
    /// Leaf entries visited.
    pub entries: u64,
    /// Leaf entries whose value lives in the value log.
    pub indirect_values: u64,
    /// Sub-tree descriptors seen.
    pub subtrees: u64,
    /// Depth of the leaves, root included.
    pub depth: u32,
}

/// Outcome of a structural check of one tree.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// True when no finding was recorded.
    pub success: bool,
    /// Human-readable problems, capped.
    pub findings: Vec<String>,
    /// Totals for the pages that could be read.
    pub counts: VerifyCounts,
}

impl VerifyReport {
    fn finding(&mut self, message: String) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(message);
        }
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: VerifyReport) {
        for finding in other.findings {
            self.finding(finding);
        }
        self.counts.leaves += other.counts.leaves;
        self.counts.branches += other.counts.branches;
        self.counts.entries += other.counts.entries;
        self.counts.indirect_values += other.counts.indirect_values;
        self.counts.subtrees += other.counts.subtrees;
        self.counts.depth = self.counts.depth.max(other.counts.depth);
        self.success = self.findings.is_empty();
    }
}

struct Walker<'r, 'a> {
    reader: &'r NodeReader<'a>,
    vlog: Option<&'r dyn ValueLog>,
    report: VerifyReport,
    leaf_depth: Option<u32>,
}

/// Walks every page reachable from `root` and checks key order, key bounds,
/// pointer keys and hashes, and uniform leaf depth. With `vlog`, indirect
/// values are also read back.
///
/// Problems become findings; the walk never stops at the first one.
pub(crate) fn verify_tree(
    reader: &NodeReader<'_>,
    vlog: Option<&dyn ValueLog>,
    root: RootPtr,
) -> VerifyReport {
    let mut walker = Walker {
        reader,
        vlog,
        report: VerifyReport::default(),
        leaf_depth: None,
    };
    if !root.is_empty() {
        walker.visit(root.page, root.overflow, Some(root.hash), None, None, None, 1);
    }
    let mut report = walker.report;
    report.counts.depth = walker.leaf_depth.unwrap_or(0);
    report.success = report.findings.is_empty();
    report
}

impl<'r, 'a> Walker<'r, 'a> {
    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        page: PageId,
        overflow: u32,
        expect_hash: Option<[u8; 20]>,
        expect_key: Option<&[u8]>,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: u32,
    ) {
        let (header, entries) = match self.reader.read_entries(page, overflow) {
            Ok(read) => read,
            Err(err) => {
                self.report.finding(format!("page {}: unreadable: {err}", page.0));
                return;
            }
        };
        if entries.is_empty() {
            self.report.finding(format!("page {}: no entries", page.0));
            return;
        }
        if check_sorted(&entries).is_err() {
            self.report.finding(format!("page {}: keys out of order", page.0));
        }
        if node_hash(self.reader.hasher, &entries) != header.hash {
            self.report.finding(format!("page {}: node hash mismatch", page.0));
        }
        if expect_hash.is_some_and(|h| h != header.hash) {
            self.report
                .finding(format!("page {}: parent pointer hash differs", page.0));
        }
        if expect_key.is_some_and(|k| k != entries[0].key.as_slice()) {
            self.report
                .finding(format!("page {}: parent pointer key differs from first key", page.0));
        }
        let out_of_bounds = entries.iter().any(|e| {
            lo.is_some_and(|lo| e.key.as_slice() < lo)
                || hi.is_some_and(|hi| e.key.as_slice() >= hi)
        });
        if out_of_bounds {
            self.report.finding(format!("page {}: key outside parent range", page.0));
        }
        if header.is_leaf() {
            self.visit_leaf(page, &entries, depth);
            return;
        }
        self.report.counts.branches += 1;
        for (i, entry) in entries.iter().enumerate() {
            let InodeBody::Child { page: child, overflow } = entry.body else {
                self.report
                    .finding(format!("page {}: branch entry without pointer", page.0));
                continue;
            };
            let child_lo = if i == 0 { lo } else { Some(entry.key.as_slice()) };
            let child_hi = entries.get(i + 1).map(|e| e.key.as_slice()).or(hi);
            self.visit(
                child,
                overflow,
                Some(entry.hash),
                Some(&entry.key),
                child_lo,
                child_hi,
                depth + 1,
            );
        }
    }

    fn visit_leaf(&mut self, page: PageId, entries: &[Inode], depth: u32) {
        self.report.counts.leaves += 1;
        self.report.counts.entries += entries.len() as u64;
        match self.leaf_depth {
            None => self.leaf_depth = Some(depth),
            Some(d) if d != depth => self
                .report
                .finding(format!("page {}: leaf at depth {depth}, expected {d}", page.0)),
            Some(_) => {}
        }
        for entry in entries {
            if entry.is_subtree() {
                self.report.counts.subtrees += 1;
            }
            let InodeBody::Indirect(addr) = entry.body else {
                continue;
            };
            self.report.counts.indirect_values += 1;
            let Some(vlog) = self.vlog else {
                continue;
            };
            match vlog.read(addr) {
                Ok(value) => {
                    if self.reader.hasher.digest(&[&entry.key, &value]) != entry.hash {
                        self.report
                            .finding(format!("page {}: value hash mismatch at {addr:?}", page.0));
                    }
                }
                Err(err) => self
                    .report
                    .finding(format!("page {}: value at {addr:?} unreadable: {err}", page.0)),
            }
        }
    }
}
