//! Embedded storage-engine building blocks: a paged file layer, a block
//! allocator with write-ahead logging, a slotted-page record store with a
//! TOAST-style oversized-value splitter, a blob-level transaction object,
//! and a generic GiST persistent index built on top of them.
//!
//! Layering, leaves first:
//! - [`buffer_pool`] recycles page-sized byte slabs.
//! - [`paged_file`] does fixed-size page I/O over a file, optionally mmapped
//!   or cached.
//! - [`slotted`] stores variable-length, checksummed records directly on a
//!   [`paged_file::PagedFile`]; [`slotted::toast`] splits values too large
//!   for one record into a TID-chained tree of smaller ones.
//! - [`alloc`] allocates variable-sized byte regions at file offsets, backed
//!   by a sidecar write-ahead log for atomic commit/rollback.
//! - [`tx`] exposes length-prefixed blob read/update/insert/delete on top of
//!   the allocator, with a single root pointer and WRITE/READ_COMMITTED/
//!   READ_UNCOMMITTED transaction modes.
//! - [`gist`] is a generic persistent search tree over [`tx`], parameterized
//!   by a user-supplied operator class; [`gist::bytestring`] is a
//!   conformance-witness operator class over byte-string ranges.

pub mod alloc;
pub mod buffer_pool;
mod error;
pub mod gist;
pub mod paged_file;
pub mod slotted;
pub mod tx;

pub use error::{Error, Result};
pub use slotted::Tid;
