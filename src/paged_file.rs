//! Fixed-size page I/O over a regular file.
//!
//! A [`PagedFile`] maps a file as a sequence of `pagesize`-byte blocks. It
//! can optionally back reads with a memory map (`MMAP`) or an LRU of
//! recently-read page copies (`CACHE`) — the two are mutually exclusive,
//! since a cache is pointless once reads are already just pointers into a
//! live mapping.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use fs4::fs_std::FileExt;
use log::debug;
use lru::LruCache;
use memmap2::{MmapMut, MmapOptions};

use crate::buffer_pool::{BufferPool, PageBuf};
use crate::error::{Error, Result};

/// Doubling step cap for [`PagedFile::grow`].
const MAX_GROW_STEP: u64 = 256 << 20;

/// Open-time behavior flags. `MMAP` and `CACHE` are mutually exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Read the file size once at open time instead of re-stat'ing it.
    pub const MEASURE: OpenFlags = OpenFlags(1 << 0);
    /// Back reads with a memory map instead of per-read `pread`.
    pub const MMAP: OpenFlags = OpenFlags(1 << 1);
    /// Attach an LRU of recently-read page copies. Mutually exclusive with `MMAP`.
    pub const CACHE: OpenFlags = OpenFlags(1 << 2);

    pub const fn empty() -> Self {
        OpenFlags(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        OpenFlags(self.0 | rhs.0)
    }
}

/// One mmap segment and the first block index it covers. Growth normally
/// remaps the last segment in place (Linux only); everywhere else, and
/// whenever an in-place remap isn't possible, a fresh segment covering just
/// the newly added blocks is pushed instead, mirroring how the teacher's
/// storage layer falls back to `Vec<MmapRaw>` segments.
struct MmapSegment {
    start_block: i64,
    map: MmapMut,
}

enum Backing {
    Plain,
    Mmap(Mutex<Vec<MmapSegment>>),
    Cache(Mutex<LruCache<i64, Box<[u8]>>>),
}

/// Find the segment covering block `i`, and its offset within that segment.
fn find_segment(segments: &[MmapSegment], i: i64, ps: usize) -> Result<(usize, &MmapSegment)> {
    segments
        .iter()
        .enumerate()
        .rev()
        .find(|(_, seg)| {
            let blocks_in_seg = (seg.map.len() / ps) as i64;
            i >= seg.start_block && i < seg.start_block + blocks_in_seg
        })
        .map(|(idx, seg)| (idx, seg))
        .ok_or(Error::InternalCorruption(
            "in-range block has no covering mmap segment",
        ))
}

/// Per-page-index lock provider. Under mmap, locks are reader/writer since
/// readers can share a stable byte view of the mapping; without mmap, every
/// lock is exclusive because a heap copy handed to a reader could be racing
/// a writer mutating the page it was copied from.
struct LockTable {
    exclusive_only: bool,
    locks: Mutex<std::collections::HashMap<i64, Arc<RwLock<()>>>>,
}

impl LockTable {
    fn new(exclusive_only: bool) -> Self {
        Self {
            exclusive_only,
            locks: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn get(&self, index: i64) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(index)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

/// A fixed-size page I/O handle over a backing file.
pub struct PagedFile {
    file: File,
    pagesize: usize,
    nblocks: Mutex<i64>,
    backing: Backing,
    locks: LockTable,
    pool: BufferPool,
}

/// A page handle. Carries an explicit, idempotent `release()`; dropping it
/// without calling `release()` releases it implicitly.
pub struct Page<'f> {
    file: &'f PagedFile,
    index: i64,
    buf: Option<PageBuf>,
}

impl<'f> Page<'f> {
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref().expect("page already released").as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("page already released").as_mut_slice()
    }

    /// Return the underlying buffer to the pool/cache. Idempotent.
    pub fn release(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        match buf {
            PageBuf::Owned(b) => self.file.pool.put(b),
            PageBuf::Borrowed(_) => {}
        }
    }
}

impl Drop for Page<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Deref for Page<'_> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.bytes()
    }
}

impl DerefMut for Page<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bytes_mut()
    }
}

/// A scoped write-lock acquisition on a single block index.
pub struct WriteGuard<'f> {
    _guard: std::sync::RwLockWriteGuard<'static, ()>,
    _lock: Arc<RwLock<()>>,
    file: &'f PagedFile,
    index: i64,
}

enum ReadGuardKind {
    Shared(std::sync::RwLockReadGuard<'static, ()>),
    Exclusive(std::sync::RwLockWriteGuard<'static, ()>),
}

/// A scoped read-lock acquisition on a single block index. Under mmap this
/// holds a shared lock; without mmap it holds the exclusive lock instead,
/// per the lock provider contract.
pub struct ReadGuard<'f> {
    _guard: ReadGuardKind,
    _lock: Arc<RwLock<()>>,
    file: &'f PagedFile,
    index: i64,
}

impl<'f> WriteGuard<'f> {
    pub fn index(&self) -> i64 {
        self.index
    }
}

impl<'f> ReadGuard<'f> {
    pub fn index(&self) -> i64 {
        self.index
    }
}

impl PagedFile {
    /// Open (creating if necessary) a paged file. `pagesize` must be a power
    /// of two, at least 64 bytes. `flags` selects the mmap/cache backing;
    /// `MMAP` and `CACHE` are mutually exclusive.
    pub fn open<P: AsRef<Path>>(path: P, pagesize: usize, flags: OpenFlags) -> Result<Self> {
        if !pagesize.is_power_of_two() || pagesize < 64 {
            return Err(Error::DataFormat("page size must be a power of two >= 64"));
        }
        if flags.contains(OpenFlags::MMAP) && flags.contains(OpenFlags::CACHE) {
            return Err(Error::InvalidArg("MMAP and CACHE are mutually exclusive"));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        file.try_lock_exclusive().map_err(Error::Lock)?;

        let file_len = file.metadata().map_err(Error::Open)?.len();
        let nblocks = (file_len / pagesize as u64) as i64;

        let backing = if flags.contains(OpenFlags::MMAP) {
            if file_len == 0 {
                file.set_len(pagesize as u64)
                    .map_err(|e| Error::ResizeFailed {
                        size: 0,
                        requested: pagesize as u64,
                        source: e,
                    })?;
            }
            let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(Error::Open)?;
            Backing::Mmap(Mutex::new(vec![MmapSegment { start_block: 0, map }]))
        } else if flags.contains(OpenFlags::CACHE) {
            Backing::Cache(Mutex::new(LruCache::new(
                NonZeroUsize::new(256).unwrap(),
            )))
        } else {
            Backing::Plain
        };

        let exclusive_only = !matches!(backing, Backing::Mmap(_));

        Ok(Self {
            file,
            pagesize,
            nblocks: Mutex::new(nblocks.max(if matches!(backing, Backing::Mmap(_)) { 1 } else { 0 })),
            backing,
            locks: LockTable::new(exclusive_only),
            pool: BufferPool::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.pagesize
    }

    pub fn block_count(&self) -> i64 {
        *self.nblocks.lock().unwrap()
    }

    /// Acquire an exclusive lock on block `i`. The guard must be held across
    /// the read-modify-write cycle a caller intends to perform on that block.
    pub fn wlock(&self, i: i64) -> WriteGuard<'_> {
        let lock = self.locks.get(i);
        // SAFETY: the Arc is kept alongside the guard for the guard's whole
        // lifetime, so the 'static transmute never outlives its backing lock.
        let guard: std::sync::RwLockWriteGuard<'static, ()> =
            unsafe { std::mem::transmute(lock.write().unwrap()) };
        WriteGuard {
            _guard: guard,
            _lock: lock,
            file: self,
            index: i,
        }
    }

    /// Acquire a lock on block `i` for reading. Under mmap this is a shared
    /// reader/writer lock; otherwise it degrades to exclusive, since a heap
    /// copy handed to a reader has no stable relationship with concurrent
    /// writers mutating the page it was copied from.
    pub fn rlock(&self, i: i64) -> ReadGuard<'_> {
        let lock = self.locks.get(i);
        let guard = if self.locks.exclusive_only {
            let guard: std::sync::RwLockWriteGuard<'static, ()> =
                unsafe { std::mem::transmute(lock.write().unwrap()) };
            ReadGuardKind::Exclusive(guard)
        } else {
            let guard: std::sync::RwLockReadGuard<'static, ()> =
                unsafe { std::mem::transmute(lock.read().unwrap()) };
            ReadGuardKind::Shared(guard)
        };
        ReadGuard {
            _guard: guard,
            _lock: lock,
            file: self,
            index: i,
        }
    }

    fn check_range(&self, i: i64) -> Result<()> {
        let nblocks = self.block_count();
        if i < 0 || i >= nblocks {
            return Err(Error::OutOfRange { index: i, nblocks });
        }
        Ok(())
    }

    /// Read block `i`. Fails with `OutOfRange`/`BlockTooShort` as documented.
    pub fn read(&self, i: i64) -> Result<Page<'_>> {
        self.check_range(i)?;
        let ps = self.pagesize;

        match &self.backing {
            Backing::Mmap(segments) => {
                let segs = segments.lock().unwrap();
                let (_, seg) = find_segment(&segs, i, ps)?;
                let start = ((i - seg.start_block) as usize) * ps;
                if start + ps > seg.map.len() {
                    return Err(Error::BlockTooShort {
                        index: i,
                        got: seg.map.len().saturating_sub(start),
                        expected: ps,
                    });
                }
                // SAFETY: derived from the segment's own base pointer (not
                // from a prior safe `&[u8]` borrow, which would make this an
                // aliased `&mut` on top of a shared reference). The mapping
                // outlives every Page handed out, and pages are required to
                // be released before the file (and its mapping) is dropped.
                // Non-aliasing depends on callers: `rlock`'s shared guard
                // only promises no *concurrent `wlock`* on this block: every
                // writer in this crate (allocator, toaster, GiST) holds
                // `wlock` for the full read-modify-write cycle, so a block
                // handed out here is never mutated while a read guard on it
                // is outstanding.
                let ptr = seg.map.as_ptr() as *mut u8;
                let borrowed: &'static mut [u8] =
                    unsafe { std::slice::from_raw_parts_mut(ptr.add(start), ps) };
                drop(segs);
                Ok(Page {
                    file: self,
                    index: i,
                    buf: Some(PageBuf::Borrowed(borrowed)),
                })
            }
            Backing::Cache(cache) => {
                if let Some(hit) = cache.lock().unwrap().get(&i) {
                    let mut owned = self.pool.get(ps);
                    owned.copy_from_slice(hit);
                    return Ok(Page {
                        file: self,
                        index: i,
                        buf: Some(PageBuf::Owned(owned)),
                    });
                }
                let buf = self.read_raw(i)?;
                cache.lock().unwrap().put(i, buf.clone());
                Ok(Page {
                    file: self,
                    index: i,
                    buf: Some(PageBuf::Owned(buf)),
                })
            }
            Backing::Plain => {
                let buf = self.read_raw(i)?;
                Ok(Page {
                    file: self,
                    index: i,
                    buf: Some(PageBuf::Owned(buf)),
                })
            }
        }
    }

    fn read_raw(&self, i: i64) -> Result<Box<[u8]>> {
        use std::io::Read;
        let ps = self.pagesize;
        let mut buf = self.pool.cget(ps);
        let mut file = self.file.try_clone().map_err(Error::Open)?;
        file.seek_read(i as u64 * ps as u64)?;
        let got = file.read(&mut buf).map_err(Error::Io)?;
        if got != ps {
            return Err(Error::BlockTooShort {
                index: i,
                got,
                expected: ps,
            });
        }
        Ok(buf)
    }

    /// Write up to `pagesize` bytes to block `i`. Invalidates any cached
    /// copy of `i`.
    pub fn write(&self, buf: &[u8], i: i64) -> Result<()> {
        self.check_range(i)?;
        let ps = self.pagesize;
        let n = buf.len().min(ps);

        match &self.backing {
            Backing::Mmap(segments) => {
                let segs = segments.lock().unwrap();
                let (_, seg) = find_segment(&segs, i, ps)?;
                let start = ((i - seg.start_block) as usize) * ps;
                let ptr = seg.map.as_ptr() as *mut u8;
                let dst: &mut [u8] =
                    unsafe { std::slice::from_raw_parts_mut(ptr.add(start), ps) };
                dst[..n].copy_from_slice(&buf[..n]);
                dst[n..].fill(0);
            }
            Backing::Cache(cache) => {
                cache.lock().unwrap().pop(&i);
                self.write_raw(buf, i, ps)?;
            }
            Backing::Plain => {
                self.write_raw(buf, i, ps)?;
            }
        }
        Ok(())
    }

    fn write_raw(&self, buf: &[u8], i: i64, ps: usize) -> Result<()> {
        let n = buf.len().min(ps);
        let mut page = vec![0u8; ps];
        page[..n].copy_from_slice(&buf[..n]);
        let mut file = self.file.try_clone().map_err(Error::Open)?;
        file.seek_write(i as u64 * ps as u64, &page)?;
        Ok(())
    }

    /// Extend the file by doubling its size, up to `MAX_GROW_STEP` per call.
    pub fn grow(&self) -> Result<()> {
        let mut nblocks = self.nblocks.lock().unwrap();
        let ps = self.pagesize as u64;
        let old_nblocks = *nblocks;
        let current_len = (old_nblocks as u64) * ps;
        let step = current_len.max(ps).min(MAX_GROW_STEP);
        let new_len = current_len + step;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::ResizeFailed {
                size: current_len,
                requested: new_len,
                source: e,
            })?;
        self.file.sync_all().map_err(Error::Sync)?;
        *nblocks = (new_len / ps) as i64;
        let new_nblocks = *nblocks;
        drop(nblocks);
        debug!("paged_file: grew from {old_nblocks} to {new_nblocks} blocks");
        self.notify_mmap_grown(old_nblocks, new_len)
    }

    /// Extend the file to hold at least `n` blocks.
    pub fn ensure_size(&self, n: i64) -> Result<()> {
        let mut nblocks = self.nblocks.lock().unwrap();
        if *nblocks >= n {
            return Ok(());
        }
        let old_nblocks = *nblocks;
        let ps = self.pagesize as u64;
        let new_len = (n as u64) * ps;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::ResizeFailed {
                size: (old_nblocks as u64) * ps,
                requested: new_len,
                source: e,
            })?;
        self.file.sync_all().map_err(Error::Sync)?;
        *nblocks = n;
        drop(nblocks);
        debug!("paged_file: ensure_size grew from {old_nblocks} to {n} blocks");
        self.notify_mmap_grown(old_nblocks, new_len)
    }

    /// Bring the mmap backing up to date with a file that just grew from
    /// `old_nblocks` blocks to `new_len` bytes. On Linux, tries to remap the
    /// last segment in place first; if that's unavailable or fails (every
    /// other platform, or a Linux remap that can't extend in place), maps a
    /// fresh segment over just the newly added region instead, same as the
    /// teacher's multi-segment storage fallback.
    fn notify_mmap_grown(&self, old_nblocks: i64, new_len: u64) -> Result<()> {
        let Backing::Mmap(segments) = &self.backing else {
            return Ok(());
        };
        let mut segs = segments.lock().unwrap();
        let ps = self.pagesize as u64;

        #[cfg(target_os = "linux")]
        {
            if let Some(last) = segs.last_mut() {
                let seg_blocks = (last.map.len() as u64 / ps) as i64;
                if last.start_block + seg_blocks == old_nblocks {
                    let new_seg_len = (new_len - last.start_block as u64 * ps) as usize;
                    // SAFETY: no outstanding Page references may be held
                    // across a remap; callers are documented to release
                    // pages promptly.
                    if last
                        .map
                        .remap(new_seg_len, memmap2::RemapOptions::new().may_move(false))
                        .is_ok()
                    {
                        debug!("paged_file: remapped last mmap segment to {new_seg_len} bytes");
                        return Ok(());
                    }
                }
            }
        }

        let added_len = new_len - old_nblocks as u64 * ps;
        let map = unsafe {
            MmapOptions::new()
                .offset(old_nblocks as u64 * ps)
                .len(added_len as usize)
                .map_mut(&self.file)
        }
        .map_err(Error::Open)?;
        debug!("paged_file: mapped a new {added_len}-byte mmap segment at block {old_nblocks}");
        segs.push(MmapSegment {
            start_block: old_nblocks,
            map,
        });
        Ok(())
    }

    /// Flush the mmap view, if any, to disk.
    pub fn msync(&self) -> Result<()> {
        if let Backing::Mmap(segments) = &self.backing {
            for seg in segments.lock().unwrap().iter() {
                seg.map.flush().map_err(Error::Sync)?;
            }
        }
        Ok(())
    }

    /// No-op on backends without a persistent mapping.
    pub fn mclose(&self) -> Result<()> {
        self.msync()
    }

    /// Drop all cached page copies. No-op on non-cache backends.
    pub fn clear_cache(&self) {
        if let Backing::Cache(cache) = &self.backing {
            cache.lock().unwrap().clear();
        }
    }
}

/// Minimal positioned-I/O helpers, analogous to what `File::{read_at,
/// write_at}` provide on Unix; implemented via `seek` + `read`/`write` so the
/// rest of this module stays platform-independent.
trait PositionedIo {
    fn seek_read(&mut self, offset: u64) -> Result<()>;
    fn seek_write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

impl PositionedIo for File {
    fn seek_read(&mut self, offset: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        Ok(())
    }

    fn seek_write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        self.write_all(buf).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn plain_write_read_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let pf = PagedFile::open(tmp.path(), 256, OpenFlags::empty()).unwrap();
        pf.ensure_size(2).unwrap();
        let mut data = vec![0u8; 256];
        data[0] = 0xAB;
        pf.write(&data, 0).unwrap();
        let page = pf.read(0).unwrap();
        assert_eq!(page.bytes()[0], 0xAB);
        assert_eq!(page.bytes().len(), 256);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let pf = PagedFile::open(tmp.path(), 256, OpenFlags::empty()).unwrap();
        pf.ensure_size(1).unwrap();
        assert!(matches!(pf.read(5), Err(Error::OutOfRange { .. })));
        assert!(matches!(pf.read(-1), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn grow_doubles_up_to_cap() {
        let tmp = NamedTempFile::new().unwrap();
        let pf = PagedFile::open(tmp.path(), 4096, OpenFlags::empty()).unwrap();
        pf.ensure_size(1).unwrap();
        let before = pf.block_count();
        pf.grow().unwrap();
        assert!(pf.block_count() > before);
    }

    #[test]
    fn cache_invalidated_on_write() {
        let tmp = NamedTempFile::new().unwrap();
        let pf = PagedFile::open(tmp.path(), 256, OpenFlags::CACHE).unwrap();
        pf.ensure_size(1).unwrap();
        pf.write(&[1u8; 256], 0).unwrap();
        {
            let page = pf.read(0).unwrap();
            assert_eq!(page.bytes()[0], 1);
        }
        pf.write(&[2u8; 256], 0).unwrap();
        let page = pf.read(0).unwrap();
        assert_eq!(page.bytes()[0], 2);
    }
}
