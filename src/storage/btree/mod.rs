#![forbid(unsafe_code)]

//! Copy-on-write B+ tree: entry codec, in-memory nodes, the parallel update
//! engine and read-side cursors.

/// Node entry format.
pub mod inode;
mod cursor;
mod node;
mod spill;
mod stats;
mod update;
mod verify;

pub use cursor::Cursor;
pub(crate) use cursor::{lookup, resolve_value};
pub use inode::{Inode, InodeBody, INODE_SUBTREE};
pub use node::{owner_index, split_ranges, ChildRange, Node, NodeReader};
pub use spill::MIN_ENTRIES_PER_PAGE;
pub use stats::{CommitStats, CommitStatsSnapshot};
pub(crate) use update::{update_root, Allocator, SpillConfig, UpdateCtx};
pub use update::RootPtr;
pub(crate) use verify::verify_tree;
pub use verify::{VerifyCounts, VerifyReport};
