//! Durable pool: a memory-mapped file plus its redo journal
//!
//! # Layout
//!
//! ```text
//! <dir>/pool.bin
//!   [0, 64)        PoolHeader (magic, version, layout, capacity, created_at)
//!   [256, 4096)    root area, owned by the layout stored in the pool
//!   [4096, len)    data region, grown on demand up to `capacity`
//! <dir>/pool.journal
//!   at most one pending JournalRecord
//! ```
//!
//! Every mutation either goes through [`Pool::run_transaction`] (atomic across
//! crashes) or [`Pool::persist`] (single range, synced before returning).

use super::journal::{Journal, JournalEntry, JournalRecord, Pending};
use super::transaction::Transaction;
use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const POOL_FILE: &str = "pool.bin";
pub const JOURNAL_FILE: &str = "pool.journal";
/// Name of a pool that is still being initialized
pub const STAGING_FILE: &str = "pool.bin.tmp";

/// Pool file magic ("SLABPOOL")
pub const POOL_MAGIC: u64 = u64::from_le_bytes(*b"SLABPOOL");

/// Current pool format version
pub const POOL_VERSION: u32 = 1;

/// Size of the header page; the data region starts here
pub const HEADER_SIZE: u64 = 4096;

/// Start of the root area inside the header page
pub const ROOT_OFFSET: u64 = 256;

/// Smallest capacity a pool may be created with
pub const MIN_POOL_SIZE: u64 = 8 * 1024;

/// Longest accepted layout name
pub const MAX_LAYOUT_LEN: usize = 32;

/// Crash simulation points inside a commit.
///
/// Each one fires once: the commit returns `TransactionAborted` and the pool
/// refuses further work until it is reopened, exactly as if the process had
/// died at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Only half of the journal record reaches disk
    TornJournal,
    /// The journal record is durable, nothing is applied
    AfterJournalSync,
    /// The journal record is durable, half of its entries are applied
    MidApply,
}

/// Header stored at the start of `pool.bin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    pub magic: u64,
    pub version: u32,
    pub layout: String,
    pub capacity: u64,
    pub created_at: u64,
}

impl PoolHeader {
    fn new(layout: &str, capacity: u64) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            layout: layout.to_string(),
            capacity,
            created_at,
        }
    }

    fn to_bytes(&self) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.layout.len() as u32).to_le_bytes());
        buf[16..16 + self.layout.len()].copy_from_slice(self.layout.as_bytes());
        buf[48..56].copy_from_slice(&self.capacity.to_le_bytes());
        buf[56..64].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let magic = le_u64(&bytes[0..8]);
        if magic != POOL_MAGIC {
            return Err(Error::Corrupt(format!("bad pool magic {magic:#018x}")));
        }
        let version = le_u32(&bytes[8..12]);
        if version != POOL_VERSION {
            return Err(Error::Corrupt(format!("unsupported pool version {}", version)));
        }
        let layout_len = le_u32(&bytes[12..16]) as usize;
        if layout_len > MAX_LAYOUT_LEN {
            return Err(Error::Corrupt(format!("layout name length {}", layout_len)));
        }
        let layout = std::str::from_utf8(&bytes[16..16 + layout_len])
            .map_err(|e| Error::Corrupt(format!("layout name is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self {
            magic,
            version,
            layout,
            capacity: le_u64(&bytes[48..56]),
            created_at: le_u64(&bytes[56..64]),
        })
    }
}

/// A durable, transactional byte region
pub struct Pool {
    dir: PathBuf,
    file: File,
    mmap: MmapMut,
    journal: Journal,
    header: PoolHeader,
    fail_point: Option<FailPoint>,
    crashed: bool,
}

impl Pool {
    /// Whether a pool exists at `path`
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().join(POOL_FILE).exists()
    }

    /// Create a new pool directory at `path`
    ///
    /// # Arguments
    /// * `layout` - Name of the structure stored in the pool, checked on open
    /// * `capacity` - Maximum size the pool file may grow to, in bytes
    pub fn create<P: AsRef<Path>>(path: P, layout: &str, capacity: u64) -> Result<Self> {
        Self::create_with(path, layout, capacity, |_| Ok(()))
    }

    /// Create a new pool and run `init` on it before it appears at `path`.
    ///
    /// The pool is built as `pool.bin.tmp` and renamed into place only after
    /// `init` succeeds. A failed `init`, or a crash before the rename, leaves
    /// no pool behind and the path can be created again.
    pub fn create_with<P, F>(path: P, layout: &str, capacity: u64, init: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Pool) -> Result<()>,
    {
        let dir = path.as_ref().to_path_buf();

        if layout.len() > MAX_LAYOUT_LEN {
            return Err(Error::InvalidArgument(format!(
                "layout name '{}' longer than {} bytes",
                layout, MAX_LAYOUT_LEN
            )));
        }
        if capacity < MIN_POOL_SIZE {
            return Err(Error::OutOfSpace(format!(
                "capacity {} is below the minimum pool size {}",
                capacity, MIN_POOL_SIZE
            )));
        }

        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("Failed to create pool directory: {}", e)))?;

        let pool_path = dir.join(POOL_FILE);
        if pool_path.exists() {
            return Err(Error::AlreadyExists(format!("pool {:?}", pool_path)));
        }

        // A staging file left by an earlier crash is simply overwritten
        let staging_path = dir.join(STAGING_FILE);
        let mut pool = Self::stage(dir, &staging_path, layout, capacity)?;

        if let Err(e) = init(&mut pool) {
            drop(pool);
            if let Err(cleanup) = std::fs::remove_file(&staging_path) {
                warn!(path = ?staging_path, %cleanup, "Failed to remove staged pool");
            }
            return Err(e);
        }

        pool.publish(&staging_path, &pool_path)?;
        info!(path = ?pool.dir, layout, capacity, "Created pool");
        Ok(pool)
    }

    fn stage(dir: PathBuf, staging_path: &Path, layout: &str, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(staging_path)
            .map_err(|e| Error::Storage(format!("Failed to create pool file: {}", e)))?;

        file.set_len(HEADER_SIZE)
            .map_err(|e| Error::OutOfSpace(format!("Failed to size pool file: {}", e)))?;

        let mut mmap = map_file(&file, HEADER_SIZE)?;

        let header = PoolHeader::new(layout, capacity);
        mmap[..64].copy_from_slice(&header.to_bytes());
        mmap.flush()
            .map_err(|e| Error::Storage(format!("Failed to sync pool header: {}", e)))?;

        let mut journal = Journal::open(dir.join(JOURNAL_FILE))?;
        journal.clear()?;

        Ok(Self {
            dir,
            file,
            mmap,
            journal,
            header,
            fail_point: None,
            crashed: false,
        })
    }

    /// Make the staged pool visible under its final name
    fn publish(&self, staging_path: &Path, pool_path: &Path) -> Result<()> {
        self.mmap
            .flush()
            .and_then(|_| self.file.sync_all())
            .and_then(|_| std::fs::rename(staging_path, pool_path))
            .and_then(|_| File::open(&self.dir).and_then(|d| d.sync_all()))
            .map_err(|e| Error::Storage(format!("Failed to publish pool: {}", e)))
    }

    /// Open an existing pool and recover any interrupted transaction
    pub fn open<P: AsRef<Path>>(path: P, layout: &str) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        let pool_path = dir.join(POOL_FILE);
        if !pool_path.exists() {
            return Err(Error::NotFound(format!("pool {:?}", pool_path)));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pool_path)
            .map_err(|e| Error::Storage(format!("Failed to open pool file: {}", e)))?;

        let len = file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat pool file: {}", e)))?
            .len();
        if len < HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "pool file is {} bytes, shorter than its header",
                len
            )));
        }

        let mmap = map_file(&file, len)?;
        let header = PoolHeader::from_bytes(&mmap[..64])?;

        if header.layout != layout {
            return Err(Error::Corrupt(format!(
                "layout mismatch: pool holds '{}', expected '{}'",
                header.layout, layout
            )));
        }
        if len > header.capacity {
            return Err(Error::Corrupt(format!(
                "pool file is {} bytes, larger than its capacity {}",
                len, header.capacity
            )));
        }

        let journal = Journal::open(dir.join(JOURNAL_FILE))?;

        let mut pool = Self {
            dir,
            file,
            mmap,
            journal,
            header,
            fail_point: None,
            crashed: false,
        };
        pool.recover()?;

        info!(
            path = ?pool.dir,
            layout,
            mapped = pool.mapped_len(),
            capacity = pool.capacity(),
            "Opened pool"
        );

        Ok(pool)
    }

    /// Replay or discard whatever the journal holds
    fn recover(&mut self) -> Result<()> {
        match self.journal.pending()? {
            Pending::Empty => {}
            Pending::Record(record) => {
                info!(
                    sequence = record.sequence,
                    entries = record.entries.len(),
                    "Replaying committed journal record"
                );
                for entry in &record.entries {
                    self.apply(entry)?;
                }
                self.journal.clear()?;
            }
            Pending::Torn { bytes, cause } => {
                warn!(bytes, %cause, "Discarding torn journal record");
                self.journal.clear()?;
            }
        }
        Ok(())
    }

    /// Flush the mapping and release the pool
    pub fn close(self) -> Result<()> {
        if self.crashed {
            warn!(path = ?self.dir, "Closing crashed pool without flush");
            return Ok(());
        }
        self.mmap
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to flush pool: {}", e)))?;
        info!(path = ?self.dir, "Closed pool");
        Ok(())
    }

    /// Sync the whole mapping to disk
    pub fn flush(&self) -> Result<()> {
        self.check_alive()?;
        self.mmap
            .flush()
            .map_err(|e| Error::Storage(format!("Failed to flush pool: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &PoolHeader {
        &self.header
    }

    /// Maximum size of the pool file in bytes
    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    /// Currently mapped size of the pool file in bytes
    pub fn mapped_len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Arm a crash simulation for the next commit
    pub fn set_fail_point(&mut self, fail_point: Option<FailPoint>) {
        self.fail_point = fail_point;
    }

    /// Whether a failed commit left this handle unusable
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// The whole committed mapping; never shorter than the header page
    pub fn mapped(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Committed bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check_range(offset, len)?;
        Ok(&self.mmap[start..start + len])
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(le_u32(self.read(offset, 4)?))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(le_u64(self.read(offset, 8)?))
    }

    /// Write `bytes` at `offset` outside any transaction and sync that range
    ///
    /// Only safe for bytes that recovery does not look at yet, such as the
    /// payload of a slot that is still vacant or beyond the arena length.
    pub fn persist(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_alive()?;
        let start = self.check_range(offset, bytes.len())?;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
        self.mmap
            .flush_range(start, bytes.len())
            .map_err(|e| Error::Storage(format!("Failed to persist range: {}", e)))
    }

    /// Extend the pool file to `new_len` bytes and remap it
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        self.check_alive()?;
        if new_len <= self.mapped_len() {
            return Ok(());
        }
        if new_len > self.capacity() {
            return Err(Error::CapacityExceeded(format!(
                "pool needs {} bytes, capacity is {}",
                new_len,
                self.capacity()
            )));
        }

        self.file
            .set_len(new_len)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::CapacityExceeded(format!("Failed to grow pool file: {}", e)))?;
        self.mmap = map_file(&self.file, new_len)?;

        debug!(mapped = new_len, "Grew pool");
        Ok(())
    }

    /// Run `body` as one all-or-nothing transaction.
    ///
    /// If `body` fails, nothing it wrote reaches the pool. If the commit
    /// itself fails the pool is marked crashed and must be reopened, which
    /// replays or discards the journal.
    pub fn run_transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.check_alive()?;

        let (value, writes) = {
            let mut tx = Transaction::new(&self.mmap[..]);
            let value = body(&mut tx)?;
            if tx.is_aborted() {
                return Err(Error::TransactionAborted(
                    "a nested transaction failed".to_string(),
                ));
            }
            (value, tx.into_writes())
        };

        if !writes.is_empty() {
            self.commit(writes)?;
        }
        Ok(value)
    }

    fn commit(&mut self, entries: Vec<JournalEntry>) -> Result<()> {
        let record = JournalRecord::new(self.journal.next_sequence(), entries);
        let fail_point = self.fail_point.take();

        if fail_point == Some(FailPoint::TornJournal) {
            self.journal.write_torn(&record)?;
            return Err(self.crash("torn journal write"));
        }

        if let Err(e) = self.journal.write(&record) {
            return Err(self.crash(&e.to_string()));
        }

        if fail_point == Some(FailPoint::AfterJournalSync) {
            return Err(self.crash("stopped after journal sync"));
        }

        let stop_at = match fail_point {
            Some(FailPoint::MidApply) => record.entries.len() / 2,
            _ => usize::MAX,
        };
        for (i, entry) in record.entries.iter().enumerate() {
            if i == stop_at {
                return Err(self.crash("stopped while applying journal"));
            }
            if let Err(e) = self.apply(entry) {
                return Err(self.crash(&e.to_string()));
            }
        }

        if let Err(e) = self.journal.clear() {
            return Err(self.crash(&e.to_string()));
        }

        debug!(
            sequence = record.sequence,
            entries = record.entries.len(),
            "Committed transaction"
        );
        Ok(())
    }

    fn apply(&mut self, entry: &JournalEntry) -> Result<()> {
        let start = self.check_range(entry.offset, entry.bytes.len()).map_err(|_| {
            Error::Corrupt(format!(
                "journal entry at {}+{} lies outside the pool",
                entry.offset,
                entry.bytes.len()
            ))
        })?;
        self.mmap[start..start + entry.bytes.len()].copy_from_slice(&entry.bytes);
        self.mmap
            .flush_range(start, entry.bytes.len())
            .map_err(|e| Error::Storage(format!("Failed to sync journal entry: {}", e)))
    }

    fn crash(&mut self, cause: &str) -> Error {
        self.crashed = true;
        warn!(path = ?self.dir, cause, "Transaction commit failed, pool needs reopen");
        Error::TransactionAborted(cause.to_string())
    }

    fn check_alive(&self) -> Result<()> {
        if self.crashed {
            return Err(Error::TransactionAborted(
                "pool crashed during commit; reopen to recover".to_string(),
            ));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::InvalidArgument(format!("offset {} overflows usize", offset)))?;
        match start.checked_add(len) {
            Some(end) if end <= self.mmap.len() => Ok(start),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} outside mapped region of {} bytes",
                offset,
                len,
                self.mmap.len()
            ))),
        }
    }
}

fn map_file(file: &File, len: u64) -> Result<MmapMut> {
    let len = usize::try_from(len)
        .map_err(|_| Error::CapacityExceeded(format!("cannot map {} bytes", len)))?;
    // SAFETY: the pool file is owned by this handle for its whole lifetime and
    // is only resized through `grow`, which replaces the mapping.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
        .map_err(|e| Error::Storage(format!("Failed to map pool file: {}", e)))
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
