//! Block allocator + write-ahead log.
//!
//! Allocates variable-sized byte regions at file offsets. Small regions
//! (up to 1 MiB) are rounded up to a power-of-two size class and managed by
//! a per-class free list threaded through the freed blocks themselves
//! (classic malloc-style intrusive linking); larger ones are rounded up to a
//! whole-MiB multiple and tracked by a small in-memory first-fit list that
//! does not survive a restart — see DESIGN.md for why that's an acceptable
//! simplification here.
//!
//! Bytes `[0, 16)` of the backing file are the reserved zone described by
//! the data model: `[0, 8)` is a magic/version tag, `[8, 16)` is the current
//! GiST root offset, big-endian. The rest of the allocator's own bookkeeping
//! (the bump cursor and the free-list heads) lives immediately after that,
//! still below the first offset `alloc` will ever hand out.

pub mod snapshot;
pub mod wal;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::error::{Error, Result};
pub use snapshot::SnapshotId;
use snapshot::SnapshotQueue;
use wal::Wal;

/// Smallest size class shift: `2^4 = 16` bytes.
const CLASS_MIN_SHIFT: u32 = 4;
/// Largest size class shift: `2^20 = 1 MiB`.
const CLASS_MAX_SHIFT: u32 = 20;
const NUM_CLASSES: usize = (CLASS_MAX_SHIFT - CLASS_MIN_SHIFT + 1) as usize;
const BIG_UNIT: u64 = 1 << CLASS_MAX_SHIFT;

const MAGIC: &[u8; 8] = b"crabgst\0";
/// magic(8) + root(8) + bump(8) + free_heads(NUM_CLASSES*8) + checksum(8)
const HEADER_BYTES: usize = 8 + 8 + 8 + NUM_CLASSES * 8 + 8;
/// First offset `alloc` may ever hand out; everything below is bookkeeping.
const ALLOC_START: u64 = 256;

fn class_for(len: usize) -> Option<(usize, u64)> {
    if len == 0 || len as u64 > BIG_UNIT {
        return None;
    }
    let shift = (usize::BITS - (len.max(1) - 1).leading_zeros()).max(CLASS_MIN_SHIFT);
    if shift > CLASS_MAX_SHIFT {
        return None;
    }
    Some(((shift - CLASS_MIN_SHIFT) as usize, 1u64 << shift))
}

#[derive(Clone, Debug)]
struct AllocHeader {
    root: u64,
    bump: u64,
    free_heads: [u64; NUM_CLASSES],
}

impl AllocHeader {
    fn fresh() -> Self {
        Self {
            root: 0,
            bump: ALLOC_START,
            free_heads: [0; NUM_CLASSES],
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_BYTES];
        buf[0..8].copy_from_slice(MAGIC);
        BigEndian::write_u64(&mut buf[8..16], self.root);
        BigEndian::write_u64(&mut buf[16..24], self.bump);
        for (i, h) in self.free_heads.iter().enumerate() {
            let off = 24 + i * 8;
            BigEndian::write_u64(&mut buf[off..off + 8], *h);
        }
        let checksum_at = HEADER_BYTES - 8;
        let hash = xxhash_rust::xxh3::xxh3_64(&buf[..checksum_at]);
        BigEndian::write_u64(&mut buf[checksum_at..], hash);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(Error::DataFormat("allocator header truncated"));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::DataFormat("bad allocator magic"));
        }
        let checksum_at = HEADER_BYTES - 8;
        let want = BigEndian::read_u64(&buf[checksum_at..HEADER_BYTES]);
        let got = xxhash_rust::xxh3::xxh3_64(&buf[..checksum_at]);
        if want != got {
            return Err(Error::DataFormat("allocator header checksum mismatch"));
        }
        let root = BigEndian::read_u64(&buf[8..16]);
        let bump = BigEndian::read_u64(&buf[16..24]);
        let mut free_heads = [0u64; NUM_CLASSES];
        for (i, h) in free_heads.iter_mut().enumerate() {
            let off = 24 + i * 8;
            *h = BigEndian::read_u64(&buf[off..off + 8]);
        }
        Ok(Self {
            root,
            bump,
            free_heads,
        })
    }
}

/// Which view of the file a reader should see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// See this process's own uncommitted writes (WRITE, READ_UNCOMMITTED).
    Wal,
    /// Bypass any open write transaction and read the last committed state.
    Committed,
}

struct WriteState {
    shadow: AllocHeader,
    overlay: BTreeMap<u64, Vec<u8>>,
    big_free: Vec<(u64, u64)>,
    wal: Option<Wal>,
}

/// Record a staged write in both the in-memory overlay and, if attached, the
/// durable WAL. Every mutation to the backing file — capacity headers,
/// free-list links, and caller data alike — must go through this so a crash
/// before `commit` leaves nothing for `open` to miss on replay.
fn stage_write(ws: &mut WriteState, off: u64, data: Vec<u8>) -> Result<()> {
    if let Some(wal) = ws.wal.as_mut() {
        wal.append(off, &data)?;
    }
    ws.overlay.insert(off, data);
    Ok(())
}

pub struct BlockAllocator {
    file: Mutex<File>,
    header: Mutex<AllocHeader>,
    big_free: Mutex<Vec<(u64, u64)>>,
    snapshots: Mutex<SnapshotQueue>,
    write_state: Mutex<Option<WriteState>>,
    wal_file: Mutex<Option<File>>,
}

impl BlockAllocator {
    /// Open (creating if necessary) an allocator over `file`, optionally
    /// backed by a sidecar WAL file. If `file` is empty, a fresh header is
    /// written immediately. If `wal_file` holds records left over from a
    /// crash between `write_at` and a completed `commit` (the WAL is
    /// durable-appended before the base file is touched), those records are
    /// replayed onto `file` before anything else happens.
    pub fn open(mut file: File, wal_file: Option<File>) -> Result<Self> {
        let len = file.metadata().map_err(Error::Open)?.len();

        if len > 0 {
            if let Some(wal_f) = &wal_file {
                let mut wal = Wal::open(wal_f.try_clone().map_err(Error::Open)?)?;
                if !wal.is_empty() {
                    let records = wal.records()?;
                    warn!(
                        "alloc: replaying {} WAL record(s) left over from an unclean shutdown",
                        records.len()
                    );
                    for rec in &records {
                        file.seek(SeekFrom::Start(rec.offset)).map_err(Error::Io)?;
                        file.write_all(&rec.data).map_err(Error::Io)?;
                    }
                    file.sync_all().map_err(Error::Sync)?;
                    wal.truncate()?;
                }
            }
        }

        let header = if len == 0 {
            let h = AllocHeader::fresh();
            file.set_len(ALLOC_START).map_err(|e| Error::ResizeFailed {
                size: 0,
                requested: ALLOC_START,
                source: e,
            })?;
            file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            file.write_all(&h.encode()).map_err(Error::Io)?;
            file.sync_all().map_err(Error::Sync)?;
            h
        } else {
            let mut buf = vec![0u8; HEADER_BYTES];
            use std::io::Read;
            file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            file.read_exact(&mut buf).map_err(Error::Io)?;
            AllocHeader::decode(&buf)?
        };

        Ok(Self {
            file: Mutex::new(file),
            header: Mutex::new(header),
            big_free: Mutex::new(Vec::new()),
            snapshots: Mutex::new(SnapshotQueue::new()),
            write_state: Mutex::new(None),
            wal_file: Mutex::new(wal_file),
        })
    }

    pub fn has_open_write(&self) -> bool {
        self.write_state.lock().unwrap().is_some()
    }

    /// Start a write transaction. Only one may be open at a time.
    pub fn begin_write(&self) -> Result<()> {
        let mut ws = self.write_state.lock().unwrap();
        if ws.is_some() {
            return Err(Error::WriteTxnBusy);
        }
        let wal = self
            .wal_file
            .lock()
            .unwrap()
            .as_ref()
            .map(|f| f.try_clone().map_err(Error::Open))
            .transpose()?
            .map(Wal::open)
            .transpose()?;
        *ws = Some(WriteState {
            shadow: self.header.lock().unwrap().clone(),
            overlay: BTreeMap::new(),
            big_free: self.big_free.lock().unwrap().clone(),
            wal,
        });
        Ok(())
    }

    fn with_write_state<T>(&self, f: impl FnOnce(&mut WriteState) -> Result<T>) -> Result<T> {
        let mut guard = self.write_state.lock().unwrap();
        let ws = guard.as_mut().ok_or(Error::ReadOnly)?;
        f(ws)
    }

    /// Allocate a region of at least `len` bytes; must be called within an
    /// open write transaction. Returns the usable offset (past any inline
    /// bookkeeping).
    pub fn alloc(&self, len: usize) -> Result<u64> {
        let snapshots = self.snapshots.lock().unwrap();
        self.with_write_state(|ws| self.alloc_in(&snapshots, ws, len))
    }

    /// Every region is physically `[off-8, off-8+8+capacity)`: an 8-byte
    /// big-endian capacity header followed by the usable bytes. A free
    /// region's usable bytes open with an 8-byte intrusive "next" pointer
    /// for its size class's free list, reusing payload space nobody is
    /// reading anymore.
    fn alloc_in(&self, snapshots: &SnapshotQueue, ws: &mut WriteState, len: usize) -> Result<u64> {
        if let Some((class, capacity)) = class_for(len) {
            let head = ws.shadow.free_heads[class];
            if head != 0 && !snapshots.is_pinned(class, head) {
                let next = self.read_u64_at(ws, head)?;
                ws.shadow.free_heads[class] = next;
                return Ok(head);
            }
            self.carve_fresh(ws, capacity)
        } else {
            let capacity = ((len as u64) + BIG_UNIT - 1) / BIG_UNIT * BIG_UNIT;
            if let Some(pos) = ws.big_free.iter().position(|&(_, c)| c >= capacity) {
                let (off, _) = ws.big_free.remove(pos);
                return Ok(off);
            }
            self.carve_fresh(ws, capacity)
        }
    }

    fn carve_fresh(&self, ws: &mut WriteState, capacity: u64) -> Result<u64> {
        let phys_start = ws.shadow.bump;
        let off = phys_start + 8;
        let mut header = vec![0u8; 8];
        BigEndian::write_u64(&mut header, capacity);
        stage_write(ws, phys_start, header)?;
        ws.shadow.bump = off + capacity;
        Ok(off)
    }

    /// Read an 8-byte big-endian word at `at`, checking the in-progress
    /// overlay first and falling back to the already-committed base file
    /// (the common case for free-list reuse: the block was freed and
    /// committed in an earlier transaction).
    fn read_u64_at(&self, ws: &WriteState, at: u64) -> Result<u64> {
        if let Some(buf) = ws.overlay.get(&at) {
            if buf.len() >= 8 {
                return Ok(BigEndian::read_u64(&buf[..8]));
            }
        }
        let mut file = self.file.lock().unwrap();
        let mut buf = [0u8; 8];
        use std::io::Read;
        file.seek(SeekFrom::Start(at)).map_err(Error::Io)?;
        file.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Free the region at `off`. Undefined behavior (not memory-unsafe, but
    /// a corrupted allocator) if `off` was not produced by `alloc` on this
    /// allocator.
    pub fn free(&self, off: u64) -> Result<()> {
        if off <= 16 {
            return Err(Error::ReservedOffset(off));
        }
        self.with_write_state(|ws| {
            let capacity = self.read_u64_at(ws, off - 8)?;
            if capacity <= BIG_UNIT && capacity.is_power_of_two() {
                let class = (capacity.trailing_zeros() - CLASS_MIN_SHIFT) as usize;
                let next = ws.shadow.free_heads[class];
                let mut link = vec![0u8; 8];
                BigEndian::write_u64(&mut link, next);
                stage_write(ws, off, link)?;
                ws.shadow.free_heads[class] = off;
            } else {
                ws.big_free.push((off, capacity));
            }
            Ok(())
        })
    }

    /// Actual capacity of the region at `off`.
    pub fn usable_size(&self, off: u64) -> Result<u64> {
        self.with_write_state(|ws| self.read_u64_at(ws, off - 8))
    }

    /// Read `len` bytes at `off`, honoring `mode`.
    pub fn read_at(&self, off: u64, len: usize, mode: ReadMode) -> Result<Vec<u8>> {
        if mode == ReadMode::Wal {
            let guard = self.write_state.lock().unwrap();
            if let Some(ws) = guard.as_ref() {
                if let Some(buf) = ws.overlay.get(&off) {
                    if buf.len() >= len {
                        return Ok(buf[..len].to_vec());
                    }
                }
            }
        }
        let mut file = self.file.lock().unwrap();
        let mut buf = vec![0u8; len];
        use std::io::Read;
        file.seek(SeekFrom::Start(off)).map_err(Error::Io)?;
        file.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(buf)
    }

    /// Write `data` at `off`. Only valid within an open write transaction.
    pub fn write_at(&self, off: u64, data: &[u8]) -> Result<()> {
        self.with_write_state(|ws| stage_write(ws, off, data.to_vec()))
    }

    pub fn get_root(&self, mode: ReadMode) -> Result<u64> {
        if mode == ReadMode::Wal {
            if let Some(ws) = self.write_state.lock().unwrap().as_ref() {
                return Ok(ws.shadow.root);
            }
        }
        Ok(self.header.lock().unwrap().root)
    }

    pub fn set_root(&self, off: u64) -> Result<()> {
        self.with_write_state(|ws| {
            ws.shadow.root = off;
            Ok(())
        })
    }

    /// Pin the current free-list heads so `alloc` will not hand them back
    /// out until every outstanding snapshot referencing them is released.
    pub fn snapshot(&self) -> SnapshotId {
        let header = self.header.lock().unwrap();
        self.snapshots.lock().unwrap().take(header.free_heads)
    }

    pub fn release(&self, id: SnapshotId) {
        self.snapshots.lock().unwrap().release(id);
    }

    /// Apply every buffered write, persist the header, and clear the log.
    /// Commits the currently open write transaction.
    ///
    /// When a WAL is attached, the base file is updated by replaying
    /// `wal.records()` — the same durable log `write_at` already appended
    /// to — rather than from the in-memory overlay, so a crash partway
    /// through this replay still leaves a complete, truncatable log behind
    /// for `open` to finish on the next start. Without a WAL there's nothing
    /// to replay from, so the overlay (already equal to what a WAL would
    /// hold) is applied directly.
    pub fn commit(&self) -> Result<()> {
        let mut ws = self
            .write_state
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::ReadOnly)?;

        let mut file = self.file.lock().unwrap();
        if let Some(wal) = ws.wal.as_mut() {
            let records = wal.records()?;
            for rec in &records {
                file.seek(SeekFrom::Start(rec.offset)).map_err(Error::Io)?;
                file.write_all(&rec.data).map_err(Error::Io)?;
            }
            debug!("alloc: commit replayed {} WAL record(s)", records.len());
        } else {
            for (off, data) in ws.overlay.iter() {
                file.seek(SeekFrom::Start(*off)).map_err(Error::Io)?;
                file.write_all(data).map_err(Error::Io)?;
            }
        }
        file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        file.write_all(&ws.shadow.encode()).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Sync)?;
        drop(file);

        *self.header.lock().unwrap() = ws.shadow;
        *self.big_free.lock().unwrap() = ws.big_free;

        if let Some(mut wal) = ws.wal {
            wal.truncate()?;
        }

        self.snapshots.lock().unwrap().advance();
        debug!("alloc: commit complete, header persisted");
        Ok(())
    }

    /// Discard every buffered write and the shadow header; truncate the WAL
    /// sidecar (if any) back to zero. Offsets allocated during the aborted
    /// transaction become free to reallocate again.
    pub fn rollback(&self) -> Result<()> {
        let ws = self
            .write_state
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::ReadOnly)?;
        if let Some(mut wal) = ws.wal {
            wal.truncate()?;
        }
        debug!("alloc: rollback complete, write state discarded");
        Ok(())
    }

    /// Persist the current committed header to disk. This is independent of
    /// transaction commit/rollback — it simply re-flushes the in-memory
    /// bookkeeping the allocator already considers authoritative.
    pub fn flush(&self) -> Result<()> {
        let header = self.header.lock().unwrap().clone();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        file.write_all(&header.encode()).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Sync)?;
        drop(file);
        self.snapshots.lock().unwrap().advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_pair() -> (BlockAllocator, NamedTempFile, NamedTempFile) {
        let data = NamedTempFile::new().unwrap();
        let wal = NamedTempFile::new().unwrap();
        let alloc = BlockAllocator::open(
            data.reopen().unwrap(),
            Some(wal.reopen().unwrap()),
        )
        .unwrap();
        (alloc, data, wal)
    }

    #[test]
    fn alloc_rounds_up_to_class() {
        let (a, _d, _w) = open_pair();
        a.begin_write().unwrap();
        let off = a.alloc(10).unwrap();
        assert_eq!(a.usable_size(off).unwrap(), 16);
        a.commit().unwrap();
    }

    #[test]
    fn free_then_alloc_reuses_offset() {
        let (a, _d, _w) = open_pair();
        a.begin_write().unwrap();
        let off = a.alloc(100).unwrap();
        a.free(off).unwrap();
        let off2 = a.alloc(100).unwrap();
        assert_eq!(off, off2);
        a.commit().unwrap();
    }

    #[test]
    fn rollback_discards_allocation_and_header_state() {
        let (a, _d, _w) = open_pair();
        a.begin_write().unwrap();
        let off = a.alloc(100).unwrap();
        a.write_at(off, b"hello").unwrap();
        a.rollback().unwrap();

        a.begin_write().unwrap();
        let off2 = a.alloc(100).unwrap();
        assert_eq!(off, off2, "rolled-back allocation must be reusable");
        a.commit().unwrap();
    }

    #[test]
    fn commit_persists_root_across_sessions() {
        let (a, _d, _w) = open_pair();
        a.begin_write().unwrap();
        a.set_root(500).unwrap();
        a.commit().unwrap();
        assert_eq!(a.get_root(ReadMode::Committed).unwrap(), 500);
    }

    #[test]
    fn write_only_allowed_within_transaction() {
        let (a, _d, _w) = open_pair();
        assert!(matches!(a.alloc(10), Err(Error::ReadOnly)));
    }

    #[test]
    fn reopen_replays_wal_records_left_over_from_a_crash() {
        let (a, data, wal) = open_pair();
        a.begin_write().unwrap();
        let off = a.alloc(64).unwrap();
        a.write_at(off, b"crash-recovered!").unwrap();
        // `write_at` durably appended this to the WAL already; drop the
        // allocator without commit or rollback to simulate a crash between
        // the WAL append and a completed commit.
        drop(a);

        let reopened =
            BlockAllocator::open(data.reopen().unwrap(), Some(wal.reopen().unwrap())).unwrap();
        let bytes = reopened
            .read_at(off, b"crash-recovered!".len(), ReadMode::Committed)
            .unwrap();
        assert_eq!(bytes, b"crash-recovered!");
    }

    #[test]
    fn snapshot_pins_freed_head_until_released() {
        let (a, _d, _w) = open_pair();
        a.begin_write().unwrap();
        let off = a.alloc(64).unwrap();
        a.commit().unwrap();

        let snap = a.snapshot();

        a.begin_write().unwrap();
        a.free(off).unwrap();
        a.commit().unwrap();

        a.release(snap);
        a.flush().unwrap();
    }
}
