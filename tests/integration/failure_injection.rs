#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use strata::primitives::io::{FileIo, MemFileIo};
use strata::storage::vlog::{FileValueLog, ValueLog, VlogAddr};
use strata::storage::{account_key, storage_key, SubTreeName};
use strata::types::{Digest, Result, StrataError, TxId};
use strata::{Tree, TreeOptions};

/// In-memory file whose writes fail once armed.
#[derive(Default)]
struct FlakyFile {
    inner: MemFileIo,
    armed: AtomicBool,
    /// Writes allowed through after arming before failures start.
    grace: AtomicUsize,
    /// Syncs still to fail.
    failing_syncs: AtomicUsize,
}

impl FlakyFile {
    fn arm(&self, grace: usize) {
        self.grace.store(grace, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.failing_syncs.store(0, Ordering::SeqCst);
    }

    fn fail_syncs(&self, count: usize) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> StrataError {
    StrataError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {what} failure"),
    ))
}

impl FileIo for FlakyFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            let left = self.grace.load(Ordering::SeqCst);
            if left == 0 {
                return Err(injected("write"));
            }
            self.grace.store(left - 1, Ordering::SeqCst);
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        let left = self.failing_syncs.load(Ordering::SeqCst);
        if left > 0 {
            self.failing_syncs.store(left - 1, Ordering::SeqCst);
            return Err(injected("sync"));
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

/// Value log handle that outlives the tree, so a second tree can reopen it.
struct SharedLog(Arc<FileValueLog>);

impl ValueLog for SharedLog {
    fn update(&self, hash: &Digest, value: &[u8], old: VlogAddr, seq: u64) -> Result<VlogAddr> {
        self.0.update(hash, value, old, seq)
    }

    fn delete(&self, addr: VlogAddr) -> Result<()> {
        self.0.delete(addr)
    }

    fn read(&self, addr: VlogAddr) -> Result<Vec<u8>> {
        self.0.read(addr)
    }

    fn sync(&self) -> Result<()> {
        self.0.sync()
    }

    fn commit(&self) -> Result<usize> {
        self.0.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.0.rollback()
    }

    fn forget(&self) -> usize {
        self.0.forget()
    }
}

struct Harness {
    tree: Tree,
    pages: Arc<FlakyFile>,
    meta: Vec<Arc<FlakyFile>>,
    vlog: Arc<FileValueLog>,
    options: TreeOptions,
}

impl Harness {
    fn meta_files(&self) -> Vec<Arc<dyn FileIo>> {
        self.meta
            .iter()
            .map(|f| f.clone() as Arc<dyn FileIo>)
            .collect()
    }

    /// Opens a second tree over the same pages, meta files and value log.
    fn reopen(&self) -> Tree {
        Tree::with_files(
            self.pages.clone(),
            self.meta_files(),
            Box::new(SharedLog(self.vlog.clone())),
            self.options.clone(),
        )
        .expect("reopen")
    }
}

fn harness() -> Harness {
    harness_with(true)
}

fn harness_with(no_sync: bool) -> Harness {
    let options = TreeOptions::new()
        .page_size(512)
        .no_sync(no_sync)
        .inline_value_max(16)
        .meta_versions(2);
    let pages = Arc::new(FlakyFile::default());
    let meta: Vec<Arc<FlakyFile>> = (0..2).map(|_| Arc::new(FlakyFile::default())).collect();
    let vlog = Arc::new(FileValueLog::in_memory(1 << 20));
    let tree = Tree::with_files(
        pages.clone(),
        meta.iter().map(|f| f.clone() as Arc<dyn FileIo>).collect(),
        Box::new(SharedLog(vlog.clone())),
        options.clone(),
    )
    .expect("tree");
    Harness {
        tree,
        pages,
        meta,
        vlog,
        options,
    }
}

fn seed(tree: &mut Tree) {
    for i in 0..300u32 {
        tree.put(&account_key(format!("k{i:04}").as_bytes()), b"seed")
            .expect("put");
    }
    tree.commit().expect("seed commit");
}

#[test]
fn failed_page_write_leaves_tree_unchanged() {
    let mut h = harness();
    seed(&mut h.tree);
    let root = h.tree.root();
    let before = h.tree.scan().expect("scan");

    for i in 0..300u32 {
        h.tree
            .put(&account_key(format!("k{i:04}").as_bytes()), b"next")
            .expect("put");
    }
    h.pages.arm(2);
    assert!(h.tree.commit().is_err());
    assert_eq!(h.tree.root(), root);
    assert_eq!(h.tree.tx(), Some(TxId(1)));
    assert_eq!(h.tree.pending(), 300);
    assert_eq!(h.tree.stats().aborted_commits, 1);

    let mut committed = h.tree.cursor();
    assert!(committed.first().expect("first"));
    assert_eq!(committed.value().expect("value"), Some(b"seed".to_vec()));
    assert_eq!(h.tree.get(&account_key(b"k0000")).expect("get"), Some(b"next".to_vec()));
    drop(committed);

    h.pages.disarm();
    assert_eq!(h.tree.commit().expect("retry"), TxId(2));
    let after = h.tree.scan().expect("scan");
    assert_eq!(after.len(), before.len());
    assert!(after.iter().all(|(_, v)| v == b"next"));
    assert!(h.tree.verify().expect("verify").success);
}

#[test]
fn failed_meta_write_keeps_previous_root_durable() {
    let mut h = harness();
    seed(&mut h.tree);
    let root = h.tree.root();

    h.tree.put(&account_key(b"extra"), b"x").expect("put");
    for file in &h.meta {
        file.arm(0);
    }
    assert!(h.tree.commit().is_err());
    assert_eq!(h.tree.root(), root);
    assert_eq!(h.tree.meta().expect("meta").map(|m| m.tx), Some(TxId(1)));

    for file in &h.meta {
        file.disarm();
    }
    assert_eq!(h.tree.commit().expect("retry"), TxId(2));
    assert_eq!(h.tree.get(&account_key(b"extra")).expect("get"), Some(b"x".to_vec()));
    assert!(h.tree.verify().expect("verify").success);
}

#[test]
fn failed_subtree_commit_keeps_subtree_batches() {
    let mut h = harness();
    let names: Vec<SubTreeName> = (1..=4u8).map(|b| SubTreeName([b; 20])).collect();
    for name in &names {
        for i in 0..100u32 {
            h.tree
                .put(&storage_key(name, format!("s{i:03}").as_bytes()), b"val")
                .expect("put");
        }
    }
    h.pages.arm(3);
    assert!(h.tree.commit().is_err());
    assert!(h.tree.root().is_empty());
    assert_eq!(h.tree.pending(), 400);

    h.pages.disarm();
    h.tree.commit().expect("retry");
    assert_eq!(h.tree.subtrees().expect("subtrees").len(), 4);
    assert_eq!(h.tree.scan().expect("scan").len(), 400);
    let report = h.tree.verify().expect("verify");
    assert!(report.success, "verify findings: {:?}", report.findings);
}

fn big(tag: u8) -> Vec<u8> {
    vec![tag; 64]
}

#[test]
fn failed_meta_sync_clears_slot_and_keeps_old_values() {
    let mut h = harness_with(false);
    let key = account_key(b"wide");
    h.tree.put(&key, &big(1)).expect("put");
    assert_eq!(h.tree.commit().expect("first commit"), TxId(1));

    h.tree.put(&key, &big(2)).expect("put");
    for file in &h.meta {
        file.fail_syncs(1);
    }
    let err = h.tree.commit().expect_err("sync failure");
    assert!(matches!(err, StrataError::Io(_)), "unexpected error: {err}");
    assert_eq!(h.tree.tx(), Some(TxId(1)));

    let reopened = h.reopen();
    assert_eq!(reopened.meta().expect("meta").map(|m| m.tx), Some(TxId(1)));
    assert_eq!(reopened.get(&key).expect("get"), Some(big(1)));
    drop(reopened);

    assert_eq!(h.tree.commit().expect("retry"), TxId(2));
    let reopened = h.reopen();
    assert_eq!(reopened.get(&key).expect("get"), Some(big(2)));
    assert!(reopened.verify().expect("verify").success);
}

#[test]
fn meta_in_doubt_keeps_new_root_readable_after_reopen() {
    let mut h = harness_with(false);
    let key = account_key(b"wide");
    h.tree.put(&key, &big(1)).expect("put");
    h.tree.commit().expect("first commit");

    h.tree.put(&key, &big(2)).expect("put");
    for file in &h.meta {
        file.fail_syncs(usize::MAX);
        file.arm(1);
    }
    let err = h.tree.commit().expect_err("sync failure");
    assert!(matches!(err, StrataError::InDoubt { tx: 2, .. }), "unexpected error: {err}");
    assert_eq!(h.tree.tx(), Some(TxId(1)));
    assert_eq!(h.tree.pending(), 1);
    assert_eq!(h.tree.stats().aborted_commits, 1);

    let reopened = h.reopen();
    assert_eq!(reopened.meta().expect("meta").map(|m| m.tx), Some(TxId(2)));
    assert_eq!(reopened.get(&key).expect("get"), Some(big(2)));
    assert!(reopened.verify().expect("verify").success);
    drop(reopened);

    for file in &h.meta {
        file.disarm();
    }
    assert_eq!(h.tree.commit().expect("retry"), TxId(2));
    h.tree.put(&key, &big(3)).expect("put");
    assert_eq!(h.tree.commit().expect("next"), TxId(3));
    let reopened = h.reopen();
    assert_eq!(reopened.get(&key).expect("get"), Some(big(3)));
    assert!(reopened.verify().expect("verify").success);
}

#[test]
fn cleared_meta_slot_falls_back_to_previous_root() {
    let mut h = harness_with(false);
    let key = account_key(b"wide");
    h.tree.put(&key, &big(1)).expect("put");
    h.tree.commit().expect("first commit");

    h.tree.put(&key, &big(2)).expect("put");
    for file in &h.meta {
        file.fail_syncs(usize::MAX);
    }
    let err = h.tree.commit().expect_err("sync failure");
    assert!(matches!(err, StrataError::InDoubt { .. }), "unexpected error: {err}");

    let reopened = h.reopen();
    assert_eq!(reopened.meta().expect("meta").map(|m| m.tx), Some(TxId(1)));
    assert_eq!(reopened.get(&key).expect("get"), Some(big(1)));
    assert!(reopened.verify().expect("verify").success);
}
