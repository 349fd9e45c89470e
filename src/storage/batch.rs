//! Ordered buffer of pending writes for one tree.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{Result, StrataError};

/// Highest tower a skip-list node may reach.
pub const MAX_LEVEL: usize = 16;

/// One pending write. `value == None` is a tombstone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchEntry {
    /// Key within the tree the batch belongs to.
    pub key: Vec<u8>,
    /// New value, or `None` to delete.
    pub value: Option<Vec<u8>>,
    /// Entry flags carried into the leaf.
    pub flags: u16,
}

impl BatchEntry {
    /// Returns true for deletes.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

struct SkipNode {
    entry: BatchEntry,
    // Index 0 is the head sentinel, so 0 doubles as "no successor".
    next: Vec<usize>,
}

/// Skip list of pending writes keyed by byte string.
///
/// Towers grow with probability 1/4 per level up to [`MAX_LEVEL`]. Nodes live
/// in an arena; removed slots are recycled.
pub struct WriteBatch {
    nodes: Vec<SkipNode>,
    vacant: Vec<usize>,
    level: usize,
    len: usize,
    rng: StdRng,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("len", &self.len)
            .field("level", &self.level)
            .finish()
    }
}

impl WriteBatch {
    /// Creates an empty batch seeded from the OS.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates an empty batch with deterministic tower heights.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let head = SkipNode {
            entry: BatchEntry::default(),
            next: vec![0; MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            vacant: Vec::new(),
            level: 1,
            len: 0,
            rng,
        }
    }

    /// Inserts or replaces the value for `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_entry(key, Some(value.to_vec()), 0)
    }

    /// Records a tombstone for `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.put_entry(key, None, 0)
    }

    /// Upserts `key` with explicit flags. Last write wins.
    pub(crate) fn put_entry(
        &mut self,
        key: &[u8],
        value: Option<Vec<u8>>,
        flags: u16,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(StrataError::InvariantViolation("zero-length key"));
        }
        let update = self.find_predecessors(key);
        let candidate = self.nodes[update[0]].next[0];
        if candidate != 0 && self.nodes[candidate].entry.key == key {
            let entry = &mut self.nodes[candidate].entry;
            entry.value = value;
            entry.flags = flags;
            return Ok(());
        }

        let height = self.random_height();
        if height > self.level {
            self.level = height;
        }
        let node = SkipNode {
            entry: BatchEntry {
                key: key.to_vec(),
                value,
                flags,
            },
            next: vec![0; height],
        };
        let idx = match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        for (lvl, &pred) in update.iter().enumerate().take(height) {
            self.nodes[idx].next[lvl] = self.nodes[pred].next[lvl];
            self.nodes[pred].next[lvl] = idx;
        }
        self.len += 1;
        Ok(())
    }

    /// Looks up a pending write.
    ///
    /// Returns [`StrataError::KeyNotFound`] when the batch holds nothing for
    /// `key` and `Ok(None)` when it holds a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        match self.entry(key) {
            Some(entry) => Ok(entry.value.as_deref()),
            None => Err(StrataError::KeyNotFound),
        }
    }

    /// Pending entry for `key`, if any.
    pub fn entry(&self, key: &[u8]) -> Option<&BatchEntry> {
        let update = self.find_predecessors(key);
        let candidate = self.nodes[update[0]].next[0];
        (candidate != 0 && self.nodes[candidate].entry.key == key)
            .then(|| &self.nodes[candidate].entry)
    }

    /// Discards the pending write for `key`.
    pub fn remove(&mut self, key: &[u8]) -> Option<BatchEntry> {
        let update = self.find_predecessors(key);
        let target = self.nodes[update[0]].next[0];
        if target == 0 || self.nodes[target].entry.key != key {
            return None;
        }
        let height = self.nodes[target].next.len();
        for (lvl, &pred) in update.iter().enumerate().take(height) {
            if self.nodes[pred].next[lvl] == target {
                self.nodes[pred].next[lvl] = self.nodes[target].next[lvl];
            }
        }
        while self.level > 1 && self.nodes[0].next[self.level - 1] == 0 {
            self.level -= 1;
        }
        let entry = std::mem::take(&mut self.nodes[target].entry);
        self.nodes[target].next.clear();
        self.vacant.push(target);
        self.len -= 1;
        Some(entry)
    }

    /// Number of distinct keys.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates entries in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            batch: self,
            cursor: self.nodes[0].next[0],
        }
    }

    /// Copies every entry out in ascending key order. The batch is unchanged.
    pub fn dump(&self) -> Vec<BatchEntry> {
        self.iter().cloned().collect()
    }

    /// Drops every pending entry.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[0].next.iter_mut().for_each(|n| *n = 0);
        self.vacant.clear();
        self.level = 1;
        self.len = 0;
    }

    fn find_predecessors(&self, key: &[u8]) -> [usize; MAX_LEVEL] {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0;
        for lvl in (0..self.level).rev() {
            loop {
                let next = self.nodes[x].next[lvl];
                if next != 0 && self.nodes[next].entry.key.as_slice() < key {
                    x = next;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }
        update
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_LEVEL && self.rng.gen_ratio(1, 4) {
            height += 1;
        }
        height
    }
}

/// Ordered iterator over a [`WriteBatch`].
pub struct Iter<'a> {
    batch: &'a WriteBatch,
    cursor: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a BatchEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == 0 {
            return None;
        }
        let node = &self.batch.nodes[self.cursor];
        self.cursor = node.next[0];
        Some(&node.entry)
    }
}
