//! Strata: a copy-on-write, hash-verified B+Tree for partitioned key spaces.
//!
//! A main tree holds top-level keys and a set of named sub-trees addressed by
//! key prefix. Writes accumulate in per-tree write batches and are merged into
//! the on-disk tree on commit, producing new immutable pages and a new root.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{Tree, TreeKind, TreeOptions};
pub use types::{Result, StrataError};
