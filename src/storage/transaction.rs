//! Transactional region over a pool
//!
//! Writes made through a [`Transaction`] are staged in memory and only reach
//! the mapped pool when [`Pool::run_transaction`](super::Pool::run_transaction)
//! commits them through the journal. Reads through the transaction see the
//! staged writes layered over the committed bytes.

use super::journal::JournalEntry;
use crate::error::{Error, Result};

/// An open transaction against a pool's mapped bytes
pub struct Transaction<'a> {
    /// Committed pool contents
    mapped: &'a [u8],
    /// Staged writes in program order
    writes: Vec<JournalEntry>,
    /// Current nesting depth (0 = outermost body)
    depth: u32,
    /// Set when a nested body failed; the whole region must be discarded
    aborted: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(mapped: &'a [u8]) -> Self {
        Self {
            mapped,
            writes: Vec::new(),
            depth: 0,
            aborted: false,
        }
    }

    /// Run `body` as a nested transaction.
    ///
    /// The nested body joins this transaction: its writes commit or vanish
    /// together with the outer ones. If it fails, the outer transaction is
    /// poisoned and will refuse to commit even if the error is swallowed.
    pub fn run<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'a>) -> Result<T>,
    {
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        if result.is_err() {
            self.aborted = true;
        }
        result
    }

    /// Nesting depth of the body currently executing
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of staged writes
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn into_writes(self) -> Vec<JournalEntry> {
        self.writes
    }

    /// Read `len` bytes at `offset`, including writes staged so far
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = self.check_range(offset, len)?;
        let end = start + len;
        let mut buf = self.mapped[start..end].to_vec();

        for write in &self.writes {
            let w_start = write.offset as usize;
            let w_end = w_start + write.bytes.len();
            let lo = w_start.max(start);
            let hi = w_end.min(end);
            if lo < hi {
                buf[lo - start..hi - start].copy_from_slice(&write.bytes[lo - w_start..hi - w_start]);
            }
        }

        Ok(buf)
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.read(offset, 1)?[0])
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes = self.read(offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes = self.read(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Stage a write of `bytes` at `offset`
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        self.writes.push(JournalEntry {
            offset,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    pub fn write_u8(&mut self, offset: u64, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::InvalidArgument(format!("offset {} overflows usize", offset)))?;
        match start.checked_add(len) {
            Some(end) if end <= self.mapped.len() => Ok(start),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} outside mapped region of {} bytes",
                offset,
                len,
                self.mapped.len()
            ))),
        }
    }
}
