use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::primitives::compress::CompressionKind;
use crate::types::{page::DEFAULT_PAGE_SIZE, Result, StrataError};

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: u32 = 512;

/// How much checking happens when pages and meta records are read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    /// No checksum verification.
    Off,
    /// Page and meta checksums are verified on read.
    #[default]
    Checksums,
    /// Checksums plus node hash recomputation and key-order checks on every
    /// node read or written.
    Full,
}

/// Configuration supplied when opening a [`super::Tree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Block size in bytes.
    pub page_size: u32,
    /// Target page occupancy; a trailing spill buffer below
    /// `threshold * fill_ratio` is folded into the previous page.
    pub fill_ratio: f64,
    /// Page payload codec.
    pub compression: CompressionKind,
    /// Read-side verification.
    pub verify: VerifyLevel,
    /// Rotating meta files; also the page reclamation delay in transactions.
    pub meta_versions: usize,
    /// Skip fsync of page, value-log and meta files.
    pub no_sync: bool,
    /// Values up to this many bytes are stored inline in the leaf.
    pub inline_value_max: usize,
    /// Worker slots for leaf updates.
    pub leaf_workers: usize,
    /// Worker slots for branch updates.
    pub branch_workers: usize,
    /// Worker slots for concurrent sub-tree commits.
    pub subtree_workers: usize,
    /// Value-log segment roll-over size in bytes.
    pub vlog_segment_bytes: u64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fill_ratio: 0.5,
            compression: CompressionKind::None,
            verify: VerifyLevel::Checksums,
            meta_versions: 40,
            no_sync: false,
            inline_value_max: 0,
            leaf_workers: 8,
            branch_workers: 8,
            subtree_workers: 4,
            vlog_segment_bytes: 64 << 20,
        }
    }
}

impl TreeOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from TOML; missing fields take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: TreeOptions =
            toml::from_str(src).map_err(|err| StrataError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            StrataError::Config(format!("{}: {err}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&src)
    }

    /// Checks that the options describe a usable tree.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(StrataError::Config(format!(
                "page_size must be a power of two >= {MIN_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if !self.fill_ratio.is_finite() {
            return Err(StrataError::Config("fill_ratio must be finite".into()));
        }
        if self.meta_versions == 0 {
            return Err(StrataError::Config("meta_versions must be at least 1".into()));
        }
        if self.vlog_segment_bytes == 0 {
            return Err(StrataError::Config(
                "vlog_segment_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Fill ratio clamped to `[0.1, 1.0]`.
    pub fn effective_fill_ratio(&self) -> f64 {
        self.fill_ratio.clamp(0.1, 1.0)
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the fill ratio.
    pub fn fill_ratio(mut self, ratio: f64) -> Self {
        self.fill_ratio = ratio;
        self
    }

    /// Selects the page codec.
    pub fn compression(mut self, kind: CompressionKind) -> Self {
        self.compression = kind;
        self
    }

    /// Sets the verification level.
    pub fn verify(mut self, level: VerifyLevel) -> Self {
        self.verify = level;
        self
    }

    /// Sets the number of rotating meta files.
    pub fn meta_versions(mut self, versions: usize) -> Self {
        self.meta_versions = versions;
        self
    }

    /// Enables or disables fsync.
    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    /// Sets the inline value threshold.
    pub fn inline_value_max(mut self, bytes: usize) -> Self {
        self.inline_value_max = bytes;
        self
    }

    /// Sets leaf, branch and sub-tree pool capacities.
    pub fn workers(mut self, leaf: usize, branch: usize, subtree: usize) -> Self {
        self.leaf_workers = leaf;
        self.branch_workers = branch;
        self.subtree_workers = subtree;
        self
    }

    /// Sets the value-log segment size.
    pub fn vlog_segment_bytes(mut self, bytes: u64) -> Self {
        self.vlog_segment_bytes = bytes;
        self
    }
}
