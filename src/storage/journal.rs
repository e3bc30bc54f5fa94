//! Redo journal backing the transactional region
//!
//! A transaction's staged writes are serialized into one record, synced,
//! applied to the pool and then the journal is truncated. At most one
//! record is ever pending.
//!
//! # Record format
//!
//! ```text
//! +------------------+---------+
//! | magic "SJRN"     | 4 bytes |
//! | sequence         | 8 bytes |
//! | entry_count      | 4 bytes |
//! +------------------+---------+
//! | For each entry:            |
//! |   offset         | 8 bytes |
//! |   len            | 4 bytes |
//! |   bytes          | N bytes |
//! +------------------+---------+
//! | crc32c           | 4 bytes | CRC of everything before this field
//! +------------------+---------+
//! ```
//!
//! Recovery: a record with a valid checksum is replayed, anything else is a
//! torn write and is discarded.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Journal record magic ("SJRN" in little-endian).
pub const JOURNAL_MAGIC: u32 = 0x4E52_4A53;

/// magic + sequence + entry_count
const RECORD_HEADER_SIZE: usize = 16;

/// offset + len
const ENTRY_HEADER_SIZE: usize = 12;

const CRC_SIZE: usize = 4;

/// One staged write: `bytes` land at `offset` in the pool file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// All writes of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub sequence: u64,
    pub entries: Vec<JournalEntry>,
}

impl JournalRecord {
    pub fn new(sequence: u64, entries: Vec<JournalEntry>) -> Self {
        Self { sequence, entries }
    }

    /// Total number of payload bytes across all entries.
    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.bytes.len()).sum()
    }

    /// Serialize with trailing checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = RECORD_HEADER_SIZE
            + self.entries.len() * ENTRY_HEADER_SIZE
            + self.payload_bytes()
            + CRC_SIZE;
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&(entry.bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.bytes);
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserialize, verifying the checksum
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE + CRC_SIZE {
            return Err(Error::Corrupt(format!(
                "journal record too short: {} bytes",
                bytes.len()
            )));
        }

        let body_len = bytes.len() - CRC_SIZE;
        let stored_crc = read_u32(bytes, body_len);
        let computed_crc = crc32c::crc32c(&bytes[..body_len]);
        if stored_crc != computed_crc {
            return Err(Error::Corrupt(format!(
                "journal CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let magic = read_u32(bytes, 0);
        if magic != JOURNAL_MAGIC {
            return Err(Error::Corrupt(format!("bad journal magic {magic:#010x}")));
        }
        let sequence = read_u64(bytes, 4);
        let count = read_u32(bytes, 12) as usize;

        let mut entries = Vec::with_capacity(count);
        let mut pos = RECORD_HEADER_SIZE;
        for _ in 0..count {
            if pos + ENTRY_HEADER_SIZE > body_len {
                return Err(Error::Corrupt("journal entry header truncated".to_string()));
            }
            let offset = read_u64(bytes, pos);
            let len = read_u32(bytes, pos + 8) as usize;
            pos += ENTRY_HEADER_SIZE;
            if pos + len > body_len {
                return Err(Error::Corrupt("journal entry body truncated".to_string()));
            }
            entries.push(JournalEntry {
                offset,
                bytes: bytes[pos..pos + len].to_vec(),
            });
            pos += len;
        }

        if pos != body_len {
            return Err(Error::Corrupt(format!(
                "journal record has {} trailing bytes",
                body_len - pos
            )));
        }

        Ok(Self { sequence, entries })
    }
}

/// State of the journal file found at open.
#[derive(Debug)]
pub enum Pending {
    /// Nothing to recover
    Empty,
    /// A complete record that must be replayed
    Record(JournalRecord),
    /// Partial or damaged record that must be discarded
    Torn { bytes: u64, cause: String },
}

/// Journal file handle
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    next_sequence: u64,
}

impl Journal {
    /// Open or create the journal file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open journal {:?}: {}", path, e)))?;

        Ok(Self {
            path,
            file,
            next_sequence: 1,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the sequence number for the next record
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Inspect the journal for a record left behind by an interrupted commit
    pub fn pending(&mut self) -> Result<Pending> {
        let len = self
            .file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat journal: {}", e)))?
            .len();
        if len == 0 {
            return Ok(Pending::Empty);
        }

        let mut bytes = Vec::with_capacity(len as usize);
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut bytes))
            .map_err(|e| Error::Storage(format!("Failed to read journal: {}", e)))?;

        match JournalRecord::from_bytes(&bytes) {
            Ok(record) => {
                self.next_sequence = self.next_sequence.max(record.sequence + 1);
                Ok(Pending::Record(record))
            }
            Err(e) => Ok(Pending::Torn {
                bytes: len,
                cause: e.to_string(),
            }),
        }
    }

    /// Durably write `record` as the only record in the journal
    pub fn write(&mut self, record: &JournalRecord) -> Result<()> {
        let bytes = record.to_bytes();
        self.write_raw(&bytes)?;
        debug!(
            sequence = record.sequence,
            entries = record.entries.len(),
            bytes = bytes.len(),
            "Journal record synced"
        );
        Ok(())
    }

    /// Write only the first half of the record, as a crash mid-write would
    pub fn write_torn(&mut self, record: &JournalRecord) -> Result<()> {
        let bytes = record.to_bytes();
        self.write_raw(&bytes[..bytes.len() / 2])
    }

    /// Truncate the journal once its record is applied or discarded
    pub fn clear(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to truncate journal: {}", e)))
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(bytes))
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to write journal: {}", e)))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
