//! Oversized-value splitting on top of the slotted table.
//!
//! A value that doesn't fit one page is chunked into records, the resulting
//! TIDs are themselves encoded as a value and recursively written if there's
//! more than one of them. The result is a `(Tid, level)` pair: level 0 means
//! the TID names the payload directly; level `L > 0` means it names a list of
//! `L-1`-level TIDs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use log::trace;

use super::{SlottedTable, Tid};
use crate::error::Result;

/// `i64 slot-id + u32 len + u64 checksum`.
const RECORD_OVERHEAD: usize = 8 + 4 + 8;
/// Size of one encoded TID: two big-endian `i64`s.
const TID_ENCODED_LEN: usize = 16;

const BUCKETS: usize = 4;

fn bucket_for(len: usize, page_size: usize) -> usize {
    if len <= 128 {
        0
    } else if len <= 512 {
        1
    } else if len <= page_size / 2 {
        2
    } else {
        3
    }
}

fn encode_tid(t: Tid) -> [u8; TID_ENCODED_LEN] {
    let mut buf = [0u8; TID_ENCODED_LEN];
    BigEndian::write_i64(&mut buf[0..8], t.block);
    BigEndian::write_i64(&mut buf[8..16], t.slot);
    buf
}

fn decode_tid(buf: &[u8]) -> Tid {
    Tid::new(
        BigEndian::read_i64(&buf[0..8]),
        BigEndian::read_i64(&buf[8..16]),
    )
}

/// Splits/reassembles oversized values on a [`SlottedTable`]. Keeps four
/// independent block-id cursors, one per size bucket, so small and large
/// records don't contend for the same scan starting point.
pub struct Toaster<'f> {
    slotted: SlottedTable<'f>,
    page_size: usize,
    cursors: Mutex<[i64; BUCKETS]>,
}

impl<'f> Toaster<'f> {
    pub fn new(slotted: SlottedTable<'f>, page_size: usize) -> Self {
        Self {
            slotted,
            page_size,
            cursors: Mutex::new([0; BUCKETS]),
        }
    }

    /// Write `bytes`, chunking as needed. Returns the entry point TID and the
    /// indirection level it was written at.
    pub fn write(&self, bytes: &[u8]) -> Result<(Tid, u32)> {
        self.write_level(bytes, 0)
    }

    fn write_level(&self, bytes: &[u8], level: u32) -> Result<(Tid, u32)> {
        let max_chunk = self.page_size.saturating_sub(RECORD_OVERHEAD).max(1);
        let mut tids = Vec::new();

        if bytes.is_empty() {
            let tid = self.insert_chunk(bytes)?;
            tids.push(tid);
        } else {
            for chunk in bytes.chunks(max_chunk) {
                tids.push(self.insert_chunk(chunk)?);
            }
        }

        if tids.len() == 1 {
            return Ok((tids[0], level));
        }

        let mut encoded = Vec::with_capacity(tids.len() * TID_ENCODED_LEN);
        for t in &tids {
            encoded.extend_from_slice(&encode_tid(*t));
        }
        self.write_level(&encoded, level + 1)
    }

    fn insert_chunk(&self, chunk: &[u8]) -> Result<Tid> {
        let bucket = bucket_for(chunk.len(), self.page_size);
        let start = self.cursors.lock().unwrap()[bucket];
        let tid = self.slotted.insert(start, None, chunk)?;
        self.cursors.lock().unwrap()[bucket] = tid.block;
        Ok(tid)
    }

    /// Read back the value rooted at `(tid, level)`, streaming chunk reads
    /// depth-first in order.
    pub fn read(&self, tid: Tid, level: u32) -> Result<Vec<u8>> {
        let bytes = self.slotted.read(tid)?;
        if level == 0 {
            return Ok(bytes);
        }
        let mut out = Vec::new();
        for chunk in bytes.chunks(TID_ENCODED_LEN) {
            let sub = decode_tid(chunk);
            out.extend_from_slice(&self.read(sub, level - 1)?);
        }
        Ok(out)
    }

    /// Free every TID in the indirection tree rooted at `(tid, level)`, then
    /// rewind any bucket cursor past the lowest freed block so that space is
    /// reused instead of the file growing unboundedly.
    pub fn delete(&self, tid: Tid, level: u32) -> Result<()> {
        let mut all = Vec::new();
        self.collect(tid, level, &mut all)?;

        let mut by_block: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for t in &all {
            by_block.entry(t.block).or_default().push(t.slot);
        }
        for (block, slots) in by_block {
            self.slotted
                .filter_block(block, |t, _| !slots.contains(&t.slot))?;
        }

        if let Some(min_block) = all.iter().map(|t| t.block).min() {
            let mut cursors = self.cursors.lock().unwrap();
            for c in cursors.iter_mut() {
                if *c > min_block {
                    trace!("toaster bucket cursor rewound from {c} to {min_block}");
                    *c = min_block;
                }
            }
        }
        Ok(())
    }

    fn collect(&self, tid: Tid, level: u32, out: &mut Vec<Tid>) -> Result<()> {
        let bytes = self.slotted.read(tid)?;
        out.push(tid);
        if level > 0 {
            for chunk in bytes.chunks(TID_ENCODED_LEN) {
                self.collect(decode_tid(chunk), level - 1, out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paged_file::{OpenFlags, PagedFile};
    use tempfile::NamedTempFile;

    fn open(pagesize: usize, blocks: i64) -> (NamedTempFile, PagedFile) {
        let tmp = NamedTempFile::new().unwrap();
        let pf = PagedFile::open(tmp.path(), pagesize, OpenFlags::empty()).unwrap();
        pf.ensure_size(blocks).unwrap();
        (tmp, pf)
    }

    #[test]
    fn small_value_round_trips_at_level_zero() {
        let (_tmp, pf) = open(256, 2);
        let toaster = Toaster::new(SlottedTable::new(&pf), 256);
        let (tid, level) = toaster.write(b"small value").unwrap();
        assert_eq!(level, 0);
        assert_eq!(toaster.read(tid, level).unwrap(), b"small value");
    }

    #[test]
    fn oversized_value_chunks_and_reassembles() {
        let (_tmp, pf) = open(64, 32);
        let toaster = Toaster::new(SlottedTable::new(&pf), 64);
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let (tid, level) = toaster.write(&payload).unwrap();
        assert!(level >= 1, "a 200-byte value must not fit a single 64-byte page record");
        assert_eq!(toaster.read(tid, level).unwrap(), payload);
    }

    #[test]
    fn delete_frees_every_chunk_in_the_chain() {
        let (_tmp, pf) = open(64, 32);
        let toaster = Toaster::new(SlottedTable::new(&pf), 64);
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let (tid, level) = toaster.write(&payload).unwrap();

        let mut leaves = Vec::new();
        toaster.collect(tid, level, &mut leaves).unwrap();
        toaster.delete(tid, level).unwrap();

        for leaf in leaves {
            assert!(matches!(
                toaster.slotted.read(leaf),
                Err(crate::error::Error::Eof)
            ));
        }
    }

    #[test]
    fn empty_value_round_trips() {
        let (_tmp, pf) = open(256, 1);
        let toaster = Toaster::new(SlottedTable::new(&pf), 256);
        let (tid, level) = toaster.write(b"").unwrap();
        assert_eq!(toaster.read(tid, level).unwrap(), b"");
    }
}
