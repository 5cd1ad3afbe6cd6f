use thiserror::Error;

/// The error type shared by every layer of this crate: paged file, block
/// allocator, slotted table, toaster, transaction object and GiST core.
///
/// Variants map onto the error taxonomy of the storage engine this crate is
/// built from (kinds, not implementation-specific messages); callers that
/// need to distinguish a kind from a wrapped I/O failure should match on the
/// variant rather than on the formatted message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file for exclusive use.
    #[error("failed to lock the backing file")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize a page, the allocator header, or the WAL to disk.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file.
    #[error("can't resize the backing file: have 0x{size:x} bytes, wanted 0x{requested:x}")]
    ResizeFailed {
        size: u64,
        requested: u64,
        #[source]
        source: std::io::Error,
    },

    /// Mutating call on a non-write transaction.
    #[error("mutating call on a read-only transaction")]
    ReadOnly,
    /// A second write transaction was requested while one was already open.
    #[error("a write transaction is already open against this database")]
    WriteTxnBusy,

    /// `update` target region is too small for the new payload; the GiST
    /// layer recovers from this locally by relocating the node.
    #[error("region at offset 0x{offset:x} has usable size {usable}, needed {needed}")]
    Undersized {
        offset: u64,
        usable: u64,
        needed: u64,
    },

    /// Malformed caller input, e.g. an empty key tuple for an operator class.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// A decoded pointer fell in the reserved allocator-metadata zone, or a
    /// checksum mismatched on a record that is required to be valid.
    #[error("internal corruption detected: {0}")]
    InternalCorruption(&'static str),

    /// `free`/`usable_size` called with an offset inside the reserved
    /// allocator-metadata zone at the start of the file.
    #[error("offset 0x{0:x} is inside the reserved allocator header")]
    ReservedOffset(u64),

    /// Record too large to fit in a page; the caller must grow the file.
    #[error("record of {len} bytes does not fit in a page of {page_size} bytes")]
    Overflow { len: usize, page_size: usize },

    /// Page index outside `[0, nblocks)`.
    #[error("block index {index} out of range (0..{nblocks})")]
    OutOfRange { index: i64, nblocks: i64 },

    /// File is truncated below the expected page size.
    #[error("block {index} is truncated: read {got} of {expected} bytes")]
    BlockTooShort {
        index: i64,
        got: usize,
        expected: usize,
    },

    /// Cancellation token tripped during a GiST search/insert/delete.
    #[error("operation cancelled")]
    Cancelled,

    /// Iteration complete / record not found.
    #[error("end of file")]
    Eof,

    /// The on-disk format didn't match what this crate expects.
    #[error("data format error: {0}")]
    DataFormat(&'static str),

    /// Miscellaneous errors that don't warrant their own variant.
    #[error("{0}")]
    Other(&'static str),

    /// Generic I/O failure from the underlying file, surfaced verbatim.
    #[error("I/O failure on backing storage")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
