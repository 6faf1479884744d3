//! Store File
//!
//! Positional reads and writes over a single store file. Keeps the current
//! length in memory so short reads are reported as `Truncated` before they
//! reach the OS.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

use super::layout::{le_u32, EXPAND_CHUNK};

/// Handle on an open store file
pub struct StoreFile {
    file: File,
    path: PathBuf,
    /// Current file length
    len: u64,
    /// Remaining successful writes before an injected failure
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl StoreFile {
    /// Create a new file, failing if it already exists
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io_context(e, "create", path))?;
        Ok(Self::wrap(file, path, 0))
    }

    /// Create a file, truncating anything already at `path`
    pub fn create_or_truncate(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_context(e, "create", path))?;
        Ok(Self::wrap(file, path, 0))
    }

    /// Open an existing file for reading and writing
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_context(e, "open", path))?;
        let len = file
            .metadata()
            .map_err(|e| io_context(e, "stat", path))?
            .len();
        Ok(Self::wrap(file, path, len))
    }

    fn wrap(file: File, path: &Path, len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            len,
            #[cfg(test)]
            fail_after: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fill `buf` from `offset`; reading past the end is a `Truncated` error
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let needed = buf.len() as u64;
        if offset.saturating_add(needed) > self.len {
            return Err(StoreError::Truncated {
                offset,
                needed,
                available: self.len.saturating_sub(offset),
            });
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| io_context(e, &format!("read at {}", offset), &self.path))
    }

    pub fn read_u32_at(&mut self, offset: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_at(offset, &mut raw)?;
        Ok(le_u32(&raw, 0))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write all of `buf` at `offset`, growing the file if needed
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        #[cfg(test)]
        self.injected_fault(offset, buf)?;

        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| io_context(e, &format!("write at {}", offset), &self.path))?;

        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    /// Append `count` zero bytes in bounded chunks
    pub fn append_zeros(&mut self, count: u64) -> Result<()> {
        let zeros = [0u8; EXPAND_CHUNK];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(EXPAND_CHUNK as u64) as usize;
            let at = self.len;
            self.write_at(at, &zeros[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| io_context(e, &format!("resize to {}", len), &self.path))?;
        self.len = len;
        Ok(())
    }

    /// Flush file contents to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_data())
            .map_err(|e| io_context(e, "sync", &self.path))
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Let `successes` more writes through, then tear the next one in half
    #[cfg(test)]
    pub(crate) fn fail_write_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    #[cfg(test)]
    fn injected_fault(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                let half = buf.len() / 2;
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.write_all(&buf[..half])?;
                self.len = self.len.max(offset + half as u64);
                Err(io_context(
                    io::Error::new(io::ErrorKind::Other, "injected write failure"),
                    &format!("write at {}", offset),
                    &self.path,
                ))
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn io_context(source: io::Error, op: &str, path: &Path) -> StoreError {
    StoreError::IoAt {
        context: format!("{} {}", op, path.display()),
        source,
    }
}
