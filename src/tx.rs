//! Blob-level transactions over the block allocator.
//!
//! A length-prefixed blob lives at a file offset: `u32 big-endian length`
//! followed by that many payload bytes. The allocator's usable size at that
//! offset is guaranteed to be at least `length + 4`; this layer is the thing
//! that actually enforces and checks that relationship.

use byteorder::{BigEndian, ByteOrder};

use crate::alloc::{BlockAllocator, ReadMode};
use crate::error::{Error, Result};

/// How a transaction should see the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// The sole writer; sees its own uncommitted writes through the WAL.
    Write,
    /// Bypasses any open write transaction, reading the last committed state.
    ReadCommitted,
    /// Sees an in-progress writer's uncommitted state, including partial
    /// node rewrites. Callers are warned this can observe torn structures.
    ReadUncommitted,
}

/// A blob-level transaction. `Tx::commit`/`Tx::rollback` are only valid on a
/// [`TxMode::Write`] transaction; everything else is read-only.
pub struct Tx<'a> {
    alloc: &'a BlockAllocator,
    mode: TxMode,
    done: bool,
}

impl<'a> Tx<'a> {
    /// Begin a transaction. At most one [`TxMode::Write`] transaction may be
    /// open against `alloc` at a time.
    pub fn begin(alloc: &'a BlockAllocator, mode: TxMode) -> Result<Self> {
        if mode == TxMode::Write {
            alloc.begin_write()?;
        }
        Ok(Self {
            alloc,
            mode,
            done: false,
        })
    }

    fn read_mode(&self) -> ReadMode {
        match self.mode {
            TxMode::Write | TxMode::ReadUncommitted => ReadMode::Wal,
            TxMode::ReadCommitted => ReadMode::Committed,
        }
    }

    fn require_write(&self) -> Result<()> {
        if self.mode == TxMode::Write {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    pub fn get_root(&self) -> Result<u64> {
        self.alloc.get_root(self.read_mode())
    }

    pub fn set_root(&self, off: u64) -> Result<()> {
        self.require_write()?;
        self.alloc.set_root(off)
    }

    /// Read the blob at `off`.
    pub fn read(&self, off: u64) -> Result<Vec<u8>> {
        let len_bytes = self.alloc.read_at(off, 4, self.read_mode())?;
        let len = BigEndian::read_u32(&len_bytes) as usize;
        let body = self.alloc.read_at(off + 4, len, self.read_mode())?;
        Ok(body)
    }

    /// Overwrite the blob at `off` in place. Fails `Undersized` if the
    /// region's capacity can't hold `bytes.len() + 4`; never relocates.
    pub fn update(&self, off: u64, bytes: &[u8]) -> Result<()> {
        self.require_write()?;
        let needed = bytes.len() as u64 + 4;
        let usable = self.alloc.usable_size(off)?;
        if usable < needed {
            return Err(Error::Undersized {
                offset: off,
                usable,
                needed,
            });
        }
        self.write_blob(off, bytes)
    }

    /// Allocate a fresh region and write `bytes` into it, returning the
    /// offset.
    pub fn insert(&self, bytes: &[u8]) -> Result<u64> {
        self.require_write()?;
        let off = self.alloc.alloc(bytes.len() + 4)?;
        self.write_blob(off, bytes)?;
        Ok(off)
    }

    fn write_blob(&self, off: u64, bytes: &[u8]) -> Result<()> {
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, bytes.len() as u32);
        self.alloc.write_at(off, &len_buf)?;
        self.alloc.write_at(off + 4, bytes)?;
        Ok(())
    }

    /// Free the blob's region.
    pub fn delete(&self, off: u64) -> Result<()> {
        self.require_write()?;
        self.alloc.free(off)
    }

    /// Apply every buffered write and persist the header.
    pub fn commit(mut self) -> Result<()> {
        self.require_write()?;
        self.alloc.commit()?;
        self.done = true;
        Ok(())
    }

    /// Discard every buffered write; allocations made during this
    /// transaction become reusable again.
    pub fn rollback(mut self) -> Result<()> {
        self.require_write()?;
        self.alloc.rollback()?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Tx<'_> {
    /// A write transaction that's dropped without an explicit commit or
    /// rollback is rolled back, so a dropped guard never leaves the
    /// allocator's write slot permanently occupied.
    fn drop(&mut self) {
        if self.mode == TxMode::Write && !self.done {
            let _ = self.alloc.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_alloc() -> (BlockAllocator, NamedTempFile, NamedTempFile) {
        let data = NamedTempFile::new().unwrap();
        let wal = NamedTempFile::new().unwrap();
        let alloc =
            BlockAllocator::open(data.reopen().unwrap(), Some(wal.reopen().unwrap())).unwrap();
        (alloc, data, wal)
    }

    #[test]
    fn insert_then_read_round_trips() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let off = tx.insert(b"hello world").unwrap();
        assert_eq!(tx.read(off).unwrap(), b"hello world");
        tx.commit().unwrap();
    }

    #[test]
    fn update_in_place_is_idempotent() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let off = tx.insert(b"small").unwrap();
        tx.update(off, b"tiny!").unwrap();
        assert_eq!(tx.read(off).unwrap(), b"tiny!");
        tx.commit().unwrap();
    }

    #[test]
    fn update_too_large_fails_undersized() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let off = tx.insert(b"x").unwrap();
        let huge = vec![0u8; 10_000];
        assert!(matches!(
            tx.update(off, &huge),
            Err(Error::Undersized { .. })
        ));
        tx.commit().unwrap();
    }

    #[test]
    fn mutating_call_on_read_only_tx_fails() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::ReadCommitted).unwrap();
        assert!(matches!(tx.insert(b"nope"), Err(Error::ReadOnly)));
    }

    #[test]
    fn rollback_on_drop_frees_the_write_slot() {
        let (alloc, _d, _w) = open_alloc();
        {
            let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
            tx.insert(b"abandoned").unwrap();
            // dropped without commit/rollback
        }
        assert!(!alloc.has_open_write());
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn root_pointer_persists_across_sessions() {
        let (alloc, _d, _w) = open_alloc();
        let tx = Tx::begin(&alloc, TxMode::Write).unwrap();
        let off = tx.insert(b"root value").unwrap();
        tx.set_root(off).unwrap();
        tx.commit().unwrap();

        let tx = Tx::begin(&alloc, TxMode::ReadCommitted).unwrap();
        assert_eq!(tx.get_root().unwrap(), off);
        assert_eq!(tx.read(off).unwrap(), b"root value");
    }
}
