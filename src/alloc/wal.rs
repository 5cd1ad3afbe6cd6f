//! Sidecar write-ahead log.
//!
//! Every byte-range write a write transaction makes is appended to this file
//! before it is applied to the base file. `commit` replays the records onto
//! the base file in the order they were appended and then truncates the log
//! to zero; `rollback` simply truncates to zero, discarding everything that
//! was buffered.
//!
//! A WAL is present iff the caller supplied a separate sidecar file at open
//! time; without one, [`BlockAllocator`](super::BlockAllocator) keeps the
//! pending-write overlay purely in memory and commit/rollback only ever
//! touch the base file once, at commit.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// One buffered write: an absolute offset in the base file, and the bytes to
/// place there.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub offset: u64,
    pub data: Vec<u8>,
}

pub struct Wal {
    file: File,
    len: u64,
}

impl Wal {
    pub fn open(file: File) -> Result<Self> {
        let len = file.metadata().map_err(Error::Open)?.len();
        Ok(Self { file, len })
    }

    /// Append one record to the log, durably.
    pub fn append(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0)).map_err(Error::Io)?;
        self.file.write_u64::<BigEndian>(offset).map_err(Error::Io)?;
        self.file
            .write_u32::<BigEndian>(data.len() as u32)
            .map_err(Error::Io)?;
        self.file.write_all(data).map_err(Error::Io)?;
        self.file.sync_data().map_err(Error::Sync)?;
        self.len = self.file.metadata().map_err(Error::Open)?.len();
        Ok(())
    }

    /// Read back every record appended since the last commit/rollback, in
    /// order. Used by commit to replay onto the base file.
    pub fn records(&mut self) -> Result<Vec<WalRecord>> {
        self.file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        let mut out = Vec::new();
        loop {
            let offset = match self.file.read_u64::<BigEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            };
            let len = self.file.read_u32::<BigEndian>().map_err(Error::Io)? as usize;
            let mut data = vec![0u8; len];
            self.file.read_exact(&mut data).map_err(Error::Io)?;
            out.push(WalRecord { offset, data });
        }
        Ok(out)
    }

    /// Discard everything buffered, leaving the log empty. Used by both
    /// commit (after replay) and rollback.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(|e| Error::ResizeFailed {
            size: self.len,
            requested: 0,
            source: e,
        })?;
        self.len = 0;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
