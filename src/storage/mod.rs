//! Tree storage engine.
//!
//! Write batches, key routing, the value log, the copy-on-write B+ tree and
//! the tree container that ties them to the pager.

/// Copy-on-write B+ tree.
///
/// Entry codec, in-memory nodes, the parallel update engine, cursors and
/// verification.
pub mod btree;

/// Pending-write buffer.
pub mod batch;

/// External key routing.
pub mod key;

/// Out-of-line value storage.
pub mod vlog;

mod options;
mod tree;

/// Tree configuration.
pub use options::{TreeOptions, VerifyLevel, MIN_PAGE_SIZE};

/// Tree handles and sub-tree descriptors.
pub use tree::{MainTree, SubTree, SubTreeDescriptor, Tree, TreeKind, DESCRIPTOR_LEN};

pub use batch::{BatchEntry, WriteBatch};
pub use btree::{CommitStatsSnapshot, Cursor, RootPtr, VerifyReport};
pub use key::{account_key, route, storage_key, SubTreeName};
