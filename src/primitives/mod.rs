//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, positioned file I/O, page compression,
//! bounded worker pools, and the paging subsystem.

/// Varints and a bounds-checked cursor.
pub mod bytes;

/// Page payload codecs.
pub mod compress;

/// Worker pools and structured task groups.
///
/// Fan-out/fan-in machinery used by the update engine.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Pages, the page store, meta records, and the freelist.
pub mod pager;
