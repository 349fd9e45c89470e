//! Tree container: owns the durability collaborators, the pending batches and
//! the lazily loaded sub-trees, and drives commits.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::primitives::compress::Compressor;
use crate::primitives::concurrency::{TaskGroup, WorkerPool};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::pager::{FilePageStore, Freelist, Meta, MetaStore, PageStore};
use crate::types::{
    read_digest, read_u32, read_u64, HashPool, PageId, Result, StrataError, TxId,
};

use super::batch::{BatchEntry, WriteBatch};
use super::btree::{
    lookup, resolve_value, update_root, verify_tree, Allocator, CommitStats,
    CommitStatsSnapshot, Cursor, InodeBody, NodeReader, RootPtr, SpillConfig, UpdateCtx,
    VerifyReport, INODE_SUBTREE,
};
use super::key::{route, storage_key, SubTreeName, STORAGE_PREFIX};
use super::options::{TreeOptions, VerifyLevel};
use super::vlog::{FileValueLog, ValueLog};

const PAGE_FILE: &str = "pages.db";
const META_DIR: &str = "meta";
const VLOG_DIR: &str = "vlog";

/// Serialized size of a [`SubTreeDescriptor`].
pub const DESCRIPTOR_LEN: usize = 40;

/// Root record of a sub-tree, stored inline in the main tree under
/// [`SubTreeName::descriptor_key`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubTreeDescriptor {
    /// Sub-tree root.
    pub root: RootPtr,
    /// Write sequence of the commit that produced `root`.
    pub write_seq: u64,
}

impl SubTreeDescriptor {
    /// Fixed 40-byte layout: root u64, overflow u32, write sequence u64, hash.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DESCRIPTOR_LEN);
        out.extend_from_slice(&self.root.page.0.to_be_bytes());
        out.extend_from_slice(&self.root.overflow.to_be_bytes());
        out.extend_from_slice(&self.write_seq.to_be_bytes());
        out.extend_from_slice(&self.root.hash);
        out
    }

    /// Parses a descriptor value.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESCRIPTOR_LEN {
            return Err(StrataError::Corruption("sub-tree descriptor length"));
        }
        Ok(Self {
            root: RootPtr {
                page: PageId(read_u64(buf, 0)?),
                overflow: read_u32(buf, 8)?,
                hash: read_digest(buf, 20)?,
            },
            write_seq: read_u64(buf, 12)?,
        })
    }
}

/// Role of a [`Tree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    /// Owns storage and drives commits.
    Main,
    /// Partition stored under the main tree.
    Sub(SubTreeName),
}

struct Engine {
    dir: Option<PathBuf>,
    options: TreeOptions,
    store: FilePageStore,
    meta: MetaStore,
    freelist: Freelist,
    vlog: Box<dyn ValueLog>,
    compressor: Box<dyn Compressor>,
    hasher: HashPool,
    leaf_pool: WorkerPool,
    branch_pool: WorkerPool,
    subtree_pool: WorkerPool,
    high_water: AtomicU64,
    stats: CommitStats,
}

impl Engine {
    fn new(
        options: TreeOptions,
        dir: Option<PathBuf>,
        pages: Arc<dyn FileIo>,
        meta: MetaStore,
        vlog: Box<dyn ValueLog>,
    ) -> Result<Self> {
        let store = FilePageStore::new(pages, options.page_size as usize)?
            .with_verify_crc(options.verify != VerifyLevel::Off)
            .with_no_sync(options.no_sync);
        // Block 0 is never handed out.
        let high_water = store.blocks()?.max(1);
        Ok(Self {
            dir,
            store,
            meta: meta.with_no_sync(options.no_sync),
            freelist: Freelist::new(),
            vlog,
            compressor: options.compression.compressor(),
            hasher: HashPool::new(),
            leaf_pool: WorkerPool::new("leaf", options.leaf_workers),
            branch_pool: WorkerPool::new("branch", options.branch_workers),
            subtree_pool: WorkerPool::new("subtree", options.subtree_workers),
            high_water: AtomicU64::new(high_water),
            stats: CommitStats::default(),
            options,
        })
    }

    fn reader(&self) -> NodeReader<'_> {
        NodeReader {
            store: &self.store,
            compressor: self.compressor.as_ref(),
            hasher: &self.hasher,
            verify: self.options.verify,
        }
    }

    fn spill_config(&self) -> SpillConfig {
        let page_size = self.options.page_size as usize;
        let compress = self.compressor.compresses();
        let base = page_size - crate::types::page::PAGE_HDR_LEN;
        SpillConfig {
            page_size,
            threshold: if compress { base * 4 } else { base },
            fill_ratio: self.options.effective_fill_ratio(),
            inline_value_max: self.options.inline_value_max,
            compress,
            verify_writes: self.options.verify == VerifyLevel::Full,
        }
    }

    fn ctx<'a>(&'a self, tx: TxId, seq: u64, abort: &'a AtomicBool) -> UpdateCtx<'a> {
        UpdateCtx {
            reader: self.reader(),
            vlog: self.vlog.as_ref(),
            alloc: Allocator {
                freelist: &self.freelist,
                high_water: &self.high_water,
                tx,
            },
            leaf_pool: &self.leaf_pool,
            branch_pool: &self.branch_pool,
            stats: &self.stats,
            abort,
            seq,
            spill: self.spill_config(),
        }
    }

    fn read_value(&self, root: RootPtr, key: &[u8]) -> Result<Option<Vec<u8>>> {
        lookup(&self.reader(), root, key)?
            .map(|entry| resolve_value(self.vlog.as_ref(), &entry))
            .transpose()
    }

    fn descriptor(
        &self,
        main_root: RootPtr,
        name: &SubTreeName,
    ) -> Result<Option<SubTreeDescriptor>> {
        let Some(entry) = lookup(&self.reader(), main_root, &name.descriptor_key())? else {
            return Ok(None);
        };
        match &entry.body {
            InodeBody::Inline(value) if entry.is_subtree() => {
                SubTreeDescriptor::decode(value).map(Some)
            }
            _ => Err(StrataError::Corruption("sub-tree descriptor malformed")),
        }
    }

    fn finish_commit(&self, tx: TxId) {
        self.freelist.commit_tx(tx);
        let versions = self.meta.versions() as u64;
        if tx.0 > versions {
            self.freelist.release(TxId(tx.0 - versions));
        }
        match self.vlog.commit() {
            Ok(retired) if retired > 0 => debug!(tx = tx.0, retired, "vlog.commit"),
            Ok(_) => {}
            Err(err) => warn!(tx = tx.0, error = %err, "vlog.commit.failed"),
        }
        self.stats.inc_commits();
    }

    fn abort_commit(&self, tx: TxId, high_water: u64) {
        self.freelist.rollback(tx);
        if let Err(err) = self.vlog.rollback() {
            warn!(tx = tx.0, error = %err, "vlog.rollback.failed");
        }
        self.high_water.store(high_water, Ordering::Release);
        self.stats.inc_aborted_commits();
    }

    /// Gives up a commit whose meta record may be on disk. Nothing it wrote
    /// or replaced is reused, so both the previous root and the new one stay
    /// readable.
    fn hold_commit(&self, tx: TxId) {
        self.freelist.retain(tx);
        self.vlog.forget();
        self.stats.inc_aborted_commits();
    }
}

struct TreeState {
    root: RootPtr,
    write_seq: u64,
    batch: WriteBatch,
}

impl TreeState {
    fn new(root: RootPtr, write_seq: u64) -> Self {
        Self {
            root,
            write_seq,
            batch: WriteBatch::new(),
        }
    }

    fn get(&self, engine: &Engine, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.batch.entry(key) {
            return Ok(entry.value.clone());
        }
        engine.read_value(self.root, key)
    }

    fn scan(
        &self,
        engine: &Engine,
        mut emit: impl FnMut(&[u8], u16, Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = Cursor::new(engine.reader(), engine.vlog.as_ref(), self.root);
        let mut more = cursor.first()?;
        while more {
            if let (Some(key), Some(flags), Some(value)) =
                (cursor.key(), cursor.flags(), cursor.value()?)
            {
                emit(key, flags, value)?;
            }
            more = cursor.next()?;
        }
        Ok(())
    }
}

/// The main tree: owns storage, its own batch and the sub-trees loaded so far.
pub struct MainTree {
    engine: Arc<Engine>,
    state: TreeState,
    tx: TxId,
    subtrees: BTreeMap<SubTreeName, Tree>,
}

/// A partition of the main tree. Pages, allocation and durability all go
/// through the parent's engine.
pub struct SubTree {
    parent: Arc<Engine>,
    name: SubTreeName,
    state: TreeState,
    dirty: bool,
}

/// A copy-on-write B+ tree handle.
///
/// Writes accumulate in a per-tree [`WriteBatch`] and become durable on
/// [`Tree::commit`] of the main tree, which rewrites every touched path and
/// publishes a new meta record. Readers see committed data plus the handle's
/// own pending batch.
pub enum Tree {
    /// Main tree.
    Main(MainTree),
    /// Sub-tree, reached through [`Tree::subtree`].
    Sub(SubTree),
}

struct Applied {
    main: RootPtr,
    main_seq: u64,
    subtrees: Vec<(SubTreeName, RootPtr, u64)>,
}

impl Tree {
    /// Opens (creating as needed) a tree stored under `dir`.
    pub fn open(dir: impl AsRef<Path>, options: TreeOptions) -> Result<Tree> {
        let dir = dir.as_ref();
        options.validate()?;
        std::fs::create_dir_all(dir)?;
        let pages: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.join(PAGE_FILE))?);
        let meta = MetaStore::open(&dir.join(META_DIR), options.meta_versions)?;
        let vlog = FileValueLog::open(
            &dir.join(VLOG_DIR),
            options.vlog_segment_bytes,
            options.no_sync,
        )?;
        Self::assemble(options, Some(dir.to_path_buf()), pages, meta, Box::new(vlog))
    }

    /// Creates a tree whose files live in memory.
    pub fn in_memory(options: TreeOptions) -> Result<Tree> {
        options.validate()?;
        let meta_files = (0..options.meta_versions)
            .map(|_| Arc::new(MemFileIo::new()) as Arc<dyn FileIo>)
            .collect();
        let vlog = FileValueLog::in_memory(options.vlog_segment_bytes);
        Self::with_files(
            Arc::new(MemFileIo::new()),
            meta_files,
            Box::new(vlog),
            options,
        )
    }

    /// Builds a tree over caller-supplied files.
    pub fn with_files(
        pages: Arc<dyn FileIo>,
        meta_files: Vec<Arc<dyn FileIo>>,
        vlog: Box<dyn ValueLog>,
        options: TreeOptions,
    ) -> Result<Tree> {
        options.validate()?;
        let meta = MetaStore::with_files(meta_files)?;
        Self::assemble(options, None, pages, meta, vlog)
    }

    fn assemble(
        options: TreeOptions,
        dir: Option<PathBuf>,
        pages: Arc<dyn FileIo>,
        meta: MetaStore,
        vlog: Box<dyn ValueLog>,
    ) -> Result<Tree> {
        let engine = Arc::new(Engine::new(options, dir, pages, meta, vlog)?);
        let (root, write_seq, tx) = match engine.meta.latest()? {
            Some(meta) => (
                RootPtr {
                    page: meta.root,
                    overflow: meta.root_overflow,
                    hash: meta.root_hash,
                },
                meta.sequence,
                meta.tx,
            ),
            None => (RootPtr::EMPTY, 0, TxId(0)),
        };
        info!(
            tx = tx.0,
            root = root.page.0,
            high_water = engine.high_water.load(Ordering::Acquire),
            "tree.open"
        );
        Ok(Tree::Main(MainTree {
            engine,
            state: TreeState::new(root, write_seq),
            tx,
            subtrees: BTreeMap::new(),
        }))
    }

    fn engine(&self) -> &Engine {
        match self {
            Tree::Main(main) => &main.engine,
            Tree::Sub(sub) => &sub.parent,
        }
    }

    fn state(&self) -> &TreeState {
        match self {
            Tree::Main(main) => &main.state,
            Tree::Sub(sub) => &sub.state,
        }
    }

    /// Role of this handle.
    pub fn kind(&self) -> TreeKind {
        match self {
            Tree::Main(_) => TreeKind::Main,
            Tree::Sub(sub) => TreeKind::Sub(sub.name),
        }
    }

    /// Buffers a write. On the main tree `key` is an external key and is
    /// routed to the main batch or a sub-tree; on a sub-tree it is local.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value.to_vec()))
    }

    /// Buffers a delete; see [`Tree::put`] for key handling.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&mut self, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        match self {
            Tree::Main(main) => {
                let routed = route(key)?;
                match routed.subtree {
                    None => main.state.batch.put_entry(key, value, 0),
                    Some(name) => main.subtree_entry(name)?.write(routed.local, value),
                }
            }
            Tree::Sub(sub) => {
                sub.state.batch.put_entry(key, value, 0)?;
                sub.dirty = true;
                Ok(())
            }
        }
    }

    /// Reads `key`, pending writes first, then the committed tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Tree::Main(main) => {
                let routed = route(key)?;
                let Some(name) = routed.subtree else {
                    return main.state.get(&main.engine, key);
                };
                match main.subtrees.get(&name) {
                    Some(sub) => sub.get(routed.local),
                    None => {
                        let root = main
                            .engine
                            .descriptor(main.state.root, &name)?
                            .map_or(RootPtr::EMPTY, |d| d.root);
                        main.engine.read_value(root, routed.local)
                    }
                }
            }
            Tree::Sub(sub) => sub.state.get(&sub.parent, key),
        }
    }

    /// Returns the sub-tree `name`, loading its descriptor on first use.
    pub fn subtree(&mut self, name: SubTreeName) -> Result<&mut Tree> {
        match self {
            Tree::Main(main) => main.subtree_entry(name),
            Tree::Sub(_) => Err(StrataError::Invalid("sub-trees do not nest")),
        }
    }

    /// Makes every pending write durable and returns the committed
    /// transaction id. Without pending writes nothing is written.
    pub fn commit(&mut self) -> Result<TxId> {
        match self {
            Tree::Main(main) => main.commit(),
            Tree::Sub(_) => Err(StrataError::Invalid(
                "sub-trees commit through their main tree",
            )),
        }
    }

    /// Committed root.
    pub fn root(&self) -> RootPtr {
        self.state().root
    }

    /// Write sequence of the last commit that touched this tree.
    pub fn write_sequence(&self) -> u64 {
        self.state().write_seq
    }

    /// Last committed transaction; sub-trees report their parent's.
    pub fn tx(&self) -> Option<TxId> {
        match self {
            Tree::Main(main) => Some(main.tx),
            Tree::Sub(_) => None,
        }
    }

    /// Pending entries, sub-trees included.
    pub fn pending(&self) -> usize {
        match self {
            Tree::Main(main) => {
                main.state.batch.size() + main.subtrees.values().map(Tree::pending).sum::<usize>()
            }
            Tree::Sub(sub) => sub.state.batch.size(),
        }
    }

    /// This tree's own pending batch.
    pub fn batch(&self) -> &WriteBatch {
        &self.state().batch
    }

    /// Cursor over this tree's committed entries. Sub-tree descriptors of the
    /// main tree appear with [`INODE_SUBTREE`] set.
    pub fn cursor(&self) -> Cursor<'_> {
        let engine = self.engine();
        Cursor::new(engine.reader(), engine.vlog.as_ref(), self.state().root)
    }

    /// Every committed key and value in order. On the main tree, sub-tree
    /// contents are expanded in place under their external keys.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let engine = self.engine();
        let mut out = Vec::new();
        match self {
            Tree::Main(main) => main.state.scan(engine, |key, flags, value| {
                if flags & INODE_SUBTREE == 0 {
                    out.push((key.to_vec(), value));
                    return Ok(());
                }
                let name = descriptor_name(key)?;
                let desc = SubTreeDescriptor::decode(&value)?;
                TreeState::new(desc.root, desc.write_seq).scan(engine, |local, _, v| {
                    out.push((storage_key(&name, local), v));
                    Ok(())
                })
            })?,
            Tree::Sub(sub) => sub.state.scan(engine, |key, _, value| {
                out.push((key.to_vec(), value));
                Ok(())
            })?,
        }
        Ok(out)
    }

    /// Committed sub-tree names with their descriptors.
    pub fn subtrees(&self) -> Result<Vec<(SubTreeName, SubTreeDescriptor)>> {
        let engine = self.engine();
        let mut out = Vec::new();
        if let Tree::Main(main) = self {
            let mut cursor = Cursor::new(engine.reader(), engine.vlog.as_ref(), main.state.root);
            let mut more = cursor.seek(STORAGE_PREFIX)?;
            while more {
                let Some(entry) = cursor.entry() else { break };
                if !entry.key.starts_with(STORAGE_PREFIX) {
                    break;
                }
                if let InodeBody::Inline(value) = &entry.body {
                    if entry.is_subtree() {
                        out.push((descriptor_name(&entry.key)?, SubTreeDescriptor::decode(value)?));
                    }
                }
                more = cursor.next()?;
            }
        }
        Ok(out)
    }

    /// Walks the committed tree, and on the main tree every committed
    /// sub-tree, collecting structural findings.
    pub fn verify(&self) -> Result<VerifyReport> {
        let engine = self.engine();
        let reader = engine.reader();
        let mut report = verify_tree(&reader, Some(engine.vlog.as_ref()), self.state().root);
        if matches!(self, Tree::Main(_)) && report.success {
            for (name, desc) in self.subtrees()? {
                let sub = verify_tree(&reader, Some(engine.vlog.as_ref()), desc.root);
                if !sub.success {
                    debug!(subtree = %name, findings = sub.findings.len(), "tree.verify.subtree");
                }
                report.merge(sub);
            }
        }
        info!(
            success = report.success,
            leaves = report.counts.leaves,
            branches = report.counts.branches,
            entries = report.counts.entries,
            "tree.verify"
        );
        Ok(report)
    }

    /// Newest valid meta record on disk.
    pub fn meta(&self) -> Result<Option<Meta>> {
        self.engine().meta.latest()
    }

    /// Number of rotating meta files.
    pub fn meta_versions(&self) -> usize {
        self.engine().meta.versions()
    }

    /// Commit counters shared by the main tree and its sub-trees.
    pub fn stats(&self) -> CommitStatsSnapshot {
        self.engine().stats.snapshot()
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.engine().options
    }

    /// Directory the tree was opened from, if file-backed.
    pub fn dir(&self) -> Option<&Path> {
        self.engine().dir.as_deref()
    }

    /// Pages freed and not yet reusable, and pages ready for reuse.
    pub fn freelist_pages(&self) -> (u64, u64) {
        let freelist = &self.engine().freelist;
        (freelist.pending_pages(), freelist.free_pages())
    }
}

fn descriptor_name(key: &[u8]) -> Result<SubTreeName> {
    key.strip_prefix(STORAGE_PREFIX)
        .ok_or(StrataError::Corruption("sub-tree descriptor key without prefix"))
        .and_then(|name| {
            SubTreeName::from_slice(name)
                .map_err(|_| StrataError::Corruption("sub-tree descriptor key length"))
        })
}

impl MainTree {
    fn subtree_entry(&mut self, name: SubTreeName) -> Result<&mut Tree> {
        match self.subtrees.entry(name) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let desc = self.engine.descriptor(self.state.root, &name)?;
                let (root, write_seq) = desc.map_or((RootPtr::EMPTY, 0), |d| (d.root, d.write_seq));
                debug!(subtree = %name, root = root.page.0, "tree.subtree.load");
                Ok(slot.insert(Tree::Sub(SubTree {
                    parent: Arc::clone(&self.engine),
                    name,
                    state: TreeState::new(root, write_seq),
                    dirty: false,
                })))
            }
        }
    }

    fn commit(&mut self) -> Result<TxId> {
        let started = Instant::now();
        let dirty: Vec<SubTreeName> = self
            .subtrees
            .iter()
            .filter_map(|(name, tree)| match tree {
                Tree::Sub(sub) if sub.dirty && !sub.state.batch.is_empty() => Some(*name),
                _ => None,
            })
            .collect();
        if dirty.is_empty() && self.state.batch.is_empty() {
            debug!(tx = self.tx.0, "tree.commit.noop");
            return Ok(self.tx);
        }
        let tx = TxId(self.tx.0 + 1);
        let high_water = self.engine.high_water.load(Ordering::Acquire);
        info!(
            tx = tx.0,
            subtrees = dirty.len(),
            entries = self.state.batch.size(),
            "tree.commit.start"
        );
        let applied = match self.write_commit(tx, &dirty) {
            Ok(applied) => applied,
            Err(err @ StrataError::InDoubt { .. }) => {
                self.engine.hold_commit(tx);
                warn!(tx = tx.0, error = %err, "tree.commit.in_doubt");
                return Err(err);
            }
            Err(err) => {
                self.engine.abort_commit(tx, high_water);
                warn!(tx = tx.0, error = %err, "tree.commit.aborted");
                return Err(err);
            }
        };
        self.engine.finish_commit(tx);
        self.state.root = applied.main;
        self.state.write_seq = applied.main_seq;
        self.state.batch.clear();
        for (name, root, seq) in applied.subtrees {
            if let Some(Tree::Sub(sub)) = self.subtrees.get_mut(&name) {
                sub.state.root = root;
                sub.state.write_seq = seq;
                sub.state.batch.clear();
                sub.dirty = false;
            }
        }
        self.tx = tx;
        info!(
            tx = tx.0,
            root = applied.main.page.0,
            overflow = applied.main.overflow,
            run_millis = started.elapsed().as_millis() as u64,
            "tree.commit.done"
        );
        Ok(tx)
    }

    /// Writes and syncs every page of the commit, then the meta record.
    /// Leaves in-memory state untouched.
    fn write_commit(&self, tx: TxId, dirty: &[SubTreeName]) -> Result<Applied> {
        let engine: &Engine = &self.engine;
        let abort = AtomicBool::new(false);
        let jobs: Vec<(SubTreeName, RootPtr, u64, Vec<BatchEntry>)> = dirty
            .iter()
            .filter_map(|name| match self.subtrees.get(name) {
                Some(Tree::Sub(sub)) => Some((
                    *name,
                    sub.state.root,
                    sub.state.write_seq + 1,
                    sub.state.batch.dump(),
                )),
                _ => None,
            })
            .collect();
        let subtrees = thread::scope(|scope| {
            let mut group = TaskGroup::new(scope, &abort);
            for (name, root, seq, kvs) in jobs {
                let abort = &abort;
                group.spawn(&engine.subtree_pool, move || {
                    let root = update_root(&engine.ctx(tx, seq, abort), root, &kvs)?;
                    debug!(
                        subtree = %name,
                        root = root.page.0,
                        entries = kvs.len(),
                        "tree.subtree.commit"
                    );
                    Ok((name, root, seq))
                });
            }
            group.join()
        })?;

        let mut kvs = self.state.batch.dump();
        for (name, root, seq) in &subtrees {
            let value = (!root.is_empty()).then(|| {
                SubTreeDescriptor {
                    root: *root,
                    write_seq: *seq,
                }
                .encode()
            });
            kvs.push(BatchEntry {
                key: name.descriptor_key(),
                value,
                flags: INODE_SUBTREE,
            });
        }
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        let main_seq = self.state.write_seq + 1;
        let main = update_root(&engine.ctx(tx, main_seq, &abort), self.state.root, &kvs)?;

        engine.store.sync()?;
        engine.vlog.sync()?;
        engine.meta.write(&Meta {
            root: main.page,
            root_overflow: main.overflow,
            sequence: main_seq,
            tx,
            root_hash: main.hash,
        })?;
        Ok(Applied {
            main,
            main_seq,
            subtrees,
        })
    }
}
