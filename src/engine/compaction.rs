//! Growth, compaction and backup.
//!
//! Compaction and backup share one routine that copies every live object,
//! in file order, into a fresh store file. Objects that fail their integrity
//! check are dropped with a warning rather than failing the whole copy.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::storage::layout::{
    checksum, FreeHeader, ItemHeader, COMPACT_ALIGN, COMPACT_THRESHOLD, STORE_HEADER_SIZE,
};
use crate::storage::StoreFile;

use super::read::load_item;
use super::write::write_item;
use super::{now_millis, EngineState, StoreEngine};

/// Which files to damage once a compacted copy has been swapped in
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum SwapFault {
    #[default]
    None,
    NewStore,
    NewStoreAndBackup,
}

/// Outcome of copying the live objects into another file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CopyStats {
    copied: usize,
    dropped: usize,
}

impl StoreEngine {
    // =========================================================================
    // Growth
    // =========================================================================

    /// Make room for `needed` bytes when no free slot is big enough.
    ///
    /// Adjacent free slots are merged first. If that is not enough, a store
    /// with plenty of scattered free space is compacted, anything else grows.
    pub(super) fn expand_or_compact(&mut self, needed: u32) -> Result<()> {
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        if self.free.coalesce_adjacent(file)? > 0 && self.free.largest() >= needed {
            return Ok(());
        }

        if self.free.total_free() > COMPACT_THRESHOLD as u64 && needed <= COMPACT_THRESHOLD {
            self.compact_for(needed)
        } else {
            self.expand(needed)
        }
    }

    /// Append `needed + min_expand_size` zero bytes and free them.
    /// On failure the file is cut back to its old length.
    pub(super) fn expand(&mut self, needed: u32) -> Result<()> {
        let grow = needed as u64 + self.min_expand_size as u64;
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        let old_len = file.len();

        if old_len + grow > u32::MAX as u64 {
            return Err(StoreError::StoreFull { needed: old_len + grow });
        }

        if let Err(e) = file.append_zeros(grow) {
            truncate_back(file, old_len);
            return Err(e);
        }
        if let Err(e) = self.free.give_back(file, old_len as u32, grow as u32, true) {
            truncate_back(file, old_len);
            return Err(e);
        }

        debug!(from = old_len, by = grow, "Expanded store");
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Rewrite the store without fragmentation
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.compact_for(0)
    }

    /// Compact, leaving one trailing free slot big enough for `needed`
    fn compact_for(&mut self, needed: u32) -> Result<()> {
        let tail = ((self.min_expand_size as u64 + needed as u64) / COMPACT_ALIGN as u64 + 1) * COMPACT_ALIGN as u64;
        let tail = u32::try_from(tail).map_err(|_| StoreError::StoreFull { needed: tail })?;

        // Step 1: Copy live objects into the temp file
        let temp = self.paths.temp.clone();
        let stats = self.write_store_copy(&temp, tail)?;

        // Step 2: Shift the backups down
        rotate_backups(&self.paths.back1, &self.paths.back2)?;

        // Step 3: Release the live file and keep it as the newest backup
        self.file = None;
        self.state = EngineState::Closed;
        if let Err(e) = rename_or_copy(&self.paths.store, &self.paths.back1) {
            error!(error = %e, "Could not move store aside, reopening it");
            self.open()?;
            return Err(e);
        }

        // Step 4: Swap the compacted copy in
        if let Err(e) = rename(&temp, &self.paths.store) {
            self.recover_failed_open(&e);
            return Err(e);
        }

        #[cfg(test)]
        self.injected_swap_fault();

        // Step 5: Rebuild the index from the new file
        if let Err(e) = self.open() {
            self.recover_failed_open(&e);
            return Err(e);
        }

        info!(
            path = %self.paths.store.display(),
            copied = stats.copied,
            dropped = stats.dropped,
            tail,
            "Compacted store"
        );
        Ok(())
    }

    /// Bring some store back after the compacted file could not be used:
    /// the previous file from backup 1 if possible, a new empty store if not.
    fn recover_failed_open(&mut self, cause: &StoreError) {
        warn!(error = %cause, "Compacted store unusable, restoring previous file");

        if self.paths.store.exists() {
            if let Err(e) = fs::remove_file(&self.paths.store) {
                error!(error = %e, "Could not remove unusable store file");
            }
        }

        let restored = fs::rename(&self.paths.back1, &self.paths.store)
            .map_err(|e| wrap_io(e, "restore", &self.paths.back1))
            .and_then(|_| self.open());
        match restored {
            Ok(()) => {
                info!(path = %self.paths.store.display(), "Restored store from backup");
                return;
            }
            Err(e) => error!(error = %e, "Backup could not be restored either"),
        }

        if self.paths.store.exists() {
            if let Err(e) = fs::rename(&self.paths.store, &self.paths.saved) {
                error!(error = %e, "Could not set the broken store aside");
            }
        }
        match self.create() {
            Ok(()) => warn!(saved = %self.paths.saved.display(), "Started over with an empty store"),
            Err(e) => error!(error = %e, "Could not create a replacement store"),
        }
    }

    /// Zero the store magic of the files picked by `swap_fault`
    #[cfg(test)]
    fn injected_swap_fault(&mut self) {
        let targets = match std::mem::take(&mut self.swap_fault) {
            SwapFault::None => vec![],
            SwapFault::NewStore => vec![self.paths.store.clone()],
            SwapFault::NewStoreAndBackup => vec![self.paths.store.clone(), self.paths.back1.clone()],
        };
        for path in targets {
            let mut file = StoreFile::open(&path).expect("open file to damage");
            file.write_at(0, &[0u8; 4]).expect("damage store magic");
        }
    }

    // =========================================================================
    // Backup
    // =========================================================================

    /// Copy the live objects into the newest backup file, rotating the
    /// previous one down. The live store is left as it is.
    pub fn backup(&mut self) -> Result<()> {
        self.ensure_ready()?;

        let previous = self.last_backup;
        self.last_backup = now_millis();

        let temp = self.paths.temp.clone();
        let result = self
            .write_store_copy(&temp, 0)
            .and_then(|stats| {
                rotate_backups(&self.paths.back1, &self.paths.back2)?;
                rename(&temp, &self.paths.back1)?;
                Ok(stats)
            });

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                self.last_backup = previous;
                return Err(e);
            }
        };

        self.write_header_fields()?;
        if self.sync_on_write {
            self.file_mut()?.sync()?;
        }

        info!(
            backup = %self.paths.back1.display(),
            copied = stats.copied,
            dropped = stats.dropped,
            "Backed up store"
        );
        Ok(())
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Write a new store at `path` holding every readable live object,
    /// followed by a free slot of `tail` bytes (none when 0)
    fn write_store_copy(&mut self, path: &Path, tail: u32) -> Result<CopyStats> {
        let mut out = StoreFile::create_or_truncate(path)?;
        let result = self.copy_items(&mut out, tail);
        if result.is_err() {
            drop(out);
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Could not remove partial copy");
            }
        }
        result
    }

    fn copy_items(&mut self, out: &mut StoreFile, tail: u32) -> Result<CopyStats> {
        out.write_at(0, &self.header().encode())?;

        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        let mut stats = CopyStats::default();
        let mut value = Vec::new();
        let mut offset = STORE_HEADER_SIZE as u64;

        for item in self.items.by_offset() {
            match load_item(file, item, &mut value) {
                Ok(()) => {}
                Err(e) if e.is_format_error() => {
                    warn!(key = %item.key, offset = item.offset, error = %e, "Dropping damaged object");
                    stats.dropped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let end = offset + item.slot_size() as u64;
            if end > u32::MAX as u64 {
                return Err(StoreError::StoreFull { needed: end });
            }

            let header = ItemHeader {
                allocated: item.allocated,
                used: item.used,
                version: item.version,
                checksum: checksum(&value),
                key_len: item.key_len(),
            };
            write_item(out, offset as u32, &header, item.key.as_bytes(), &value)?;
            offset = end;
            stats.copied += 1;
        }

        if tail > 0 {
            let end = offset + tail as u64;
            if end > u32::MAX as u64 {
                return Err(StoreError::StoreFull { needed: end });
            }
            out.set_len(end)?;
            out.write_at(offset, &FreeHeader::new(tail).encode())?;
        } else {
            // Covers the reserve of the last object
            out.set_len(offset)?;
        }

        out.sync()?;
        Ok(stats)
    }
}

// =============================================================================
// File Helpers
// =============================================================================

/// Drop backup 2, move backup 1 into its place
fn rotate_backups(back1: &Path, back2: &Path) -> Result<()> {
    match fs::remove_file(back2) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(wrap_io(e, "remove", back2)),
    }
    if back1.exists() {
        rename(back1, back2)?;
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| wrap_io(e, &format!("rename to {}", to.display()), from))
}

/// Rename, falling back to copy + delete (e.g. across file systems)
fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| wrap_io(e, &format!("copy to {}", to.display()), from))?;
    fs::remove_file(from).map_err(|e| wrap_io(e, "remove", from))
}

fn truncate_back(file: &mut StoreFile, len: u64) {
    if let Err(e) = file.set_len(len) {
        error!(len, error = %e, "Failed to cut store back after failed expansion");
    }
}

fn wrap_io(source: io::Error, op: &str, path: &Path) -> StoreError {
    StoreError::IoAt {
        context: format!("{} {}", op, path.display()),
        source,
    }
}
