//! Free List
//!
//! Tracks every free slot in the store file, sorted by offset. Every change
//! is written to the file first and applied to the in-memory list second, so
//! a failed write leaves the list describing what is actually on disk.

use tracing::{debug, error};

use crate::error::{Result, StoreError};

use super::file::StoreFile;
use super::layout::{FreeHeader, FREE_HEADER_SIZE, MIN_FREE_SLOT};

/// A free byte range inside the store file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListItem {
    pub offset: u32,
    /// Size of the whole slot, header included
    pub size: u32,
}

impl FreeListItem {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// First byte past this slot
    pub fn after(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

/// A slot handed out by `find_free_space`, still present in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSlot {
    pub offset: u32,
    pub size: u32,
}

/// Offset-sorted list of free slots
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    entries: Vec<FreeListItem>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreeListItem> {
        self.entries.iter()
    }

    /// Sum of all free slot sizes
    pub fn total_free(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }

    /// Size of the largest free slot (0 if none)
    pub fn largest(&self) -> u32 {
        self.entries.iter().map(|e| e.size).max().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Find room for `needed` bytes.
    ///
    /// A slot no more than `MIN_FREE_SLOT` bytes bigger than the request is
    /// taken whole. Otherwise the smallest slot that fits is split: the tail
    /// header is written first, then the original header is shrunk. A crash
    /// between the two writes leaves the original slot whole.
    ///
    /// The returned slot stays in the list until the caller has committed
    /// its item and calls `remove_at_offset`.
    pub fn find_free_space(&mut self, file: &mut StoreFile, needed: u32) -> Result<Option<FreeSlot>> {
        let mut best: Option<usize> = None;

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.size < needed {
                continue;
            }
            if entry.size as u64 <= needed as u64 + MIN_FREE_SLOT as u64 {
                // Near-exact fit, take it whole
                return Ok(Some(FreeSlot {
                    offset: entry.offset,
                    size: entry.size,
                }));
            }
            match best {
                Some(b) if self.entries[b].size <= entry.size => {}
                _ => best = Some(i),
            }
        }

        let Some(index) = best else {
            return Ok(None);
        };

        let slot = self.entries[index];
        let tail = FreeListItem::new(slot.offset + needed, slot.size - needed);

        // Step 1: new header for the tail (not yet referenced by anything)
        write_free_header(file, tail.offset, tail.size)?;

        // Step 2: shrink the original slot
        write_free_header(file, slot.offset, needed)?;

        self.entries[index].size = needed;
        self.entries.insert(index + 1, tail);

        debug!(offset = slot.offset, needed, tail = tail.size, "Split free slot");

        Ok(Some(FreeSlot {
            offset: slot.offset,
            size: needed,
        }))
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Return `[offset, offset + size)` to the free list.
    ///
    /// With `coalesce` the range is merged into an adjacent free slot on
    /// either side. Returns the index of the entry now covering the range.
    pub fn give_back(&mut self, file: &mut StoreFile, offset: u32, size: u32, coalesce: bool) -> Result<usize> {
        if size < MIN_FREE_SLOT {
            return Err(StoreError::Internal(format!(
                "free slot of {} bytes at {} is below the minimum of {}",
                size, offset, MIN_FREE_SLOT
            )));
        }

        let end = offset as u64 + size as u64;
        let pos = self.entries.partition_point(|e| e.offset < offset);

        // Overlap with a neighbour means the caller lost track of a range
        if pos > 0 && self.entries[pos - 1].after() > offset as u64 {
            return Err(StoreError::Internal(format!(
                "range at {} overlaps free slot at {}",
                offset,
                self.entries[pos - 1].offset
            )));
        }
        if pos < self.entries.len() && (self.entries[pos].offset as u64) < end {
            return Err(StoreError::Internal(format!(
                "range at {} overlaps free slot at {}",
                offset, self.entries[pos].offset
            )));
        }

        let joins_prev = coalesce && pos > 0 && self.entries[pos - 1].after() == offset as u64;
        let joins_next = coalesce && pos < self.entries.len() && self.entries[pos].offset as u64 == end;

        match (joins_prev, joins_next) {
            (true, true) => {
                let prev = self.entries[pos - 1];
                let next = self.entries[pos];
                let merged = checked_size(prev.size as u64 + size as u64 + next.size as u64)?;
                write_free_header(file, prev.offset, merged)?;
                self.entries[pos - 1].size = merged;
                self.entries.remove(pos);
                debug!(offset = prev.offset, size = merged, "Coalesced free slot with both neighbours");
                Ok(pos - 1)
            }
            (true, false) => {
                let prev = self.entries[pos - 1];
                let merged = checked_size(prev.size as u64 + size as u64)?;
                write_free_header(file, prev.offset, merged)?;
                self.entries[pos - 1].size = merged;
                Ok(pos - 1)
            }
            (false, true) => {
                let next = self.entries[pos];
                let merged = checked_size(size as u64 + next.size as u64)?;
                write_free_header(file, offset, merged)?;
                self.entries[pos] = FreeListItem::new(offset, merged);
                Ok(pos)
            }
            (false, false) => {
                write_free_header(file, offset, size)?;
                self.entries.insert(pos, FreeListItem::new(offset, size));
                Ok(pos)
            }
        }
    }

    /// Merge every run of adjacent free slots, persisting each merge.
    /// Returns the number of merges performed.
    pub fn coalesce_adjacent(&mut self, file: &mut StoreFile) -> Result<usize> {
        let mut merges = 0;
        let mut i = 0;
        while i + 1 < self.entries.len() {
            let cur = self.entries[i];
            let next = self.entries[i + 1];
            if cur.after() == next.offset as u64 {
                let merged = checked_size(cur.size as u64 + next.size as u64)?;
                write_free_header(file, cur.offset, merged)?;
                self.entries[i].size = merged;
                self.entries.remove(i + 1);
                merges += 1;
            } else {
                i += 1;
            }
        }
        if merges > 0 {
            debug!(merges, "Coalesced adjacent free slots");
        }
        Ok(merges)
    }

    // =========================================================================
    // In-memory bookkeeping
    // =========================================================================

    /// Drop the entry starting at `offset` once its space has been taken
    pub fn remove_at_offset(&mut self, offset: u32) -> Result<FreeListItem> {
        match self.entries.binary_search_by_key(&offset, |e| e.offset) {
            Ok(i) => Ok(self.entries.remove(i)),
            Err(_) => Err(StoreError::Internal(format!(
                "no free list entry at offset {}",
                offset
            ))),
        }
    }

    /// Record a slot found on disk (no write)
    pub fn insert_sorted(&mut self, item: FreeListItem) {
        let pos = self.entries.partition_point(|e| e.offset < item.offset);
        self.entries.insert(pos, item);
    }
}

/// Write a free header at `offset`. If the write fails part way, the bytes
/// that were there before are put back before the error is returned.
fn write_free_header(file: &mut StoreFile, offset: u32, size: u32) -> Result<()> {
    let mut previous = [0u8; FREE_HEADER_SIZE as usize];
    file.read_at(offset as u64, &mut previous)?;

    if let Err(e) = file.write_at(offset as u64, &FreeHeader::new(size).encode()) {
        if let Err(undo) = file.write_at(offset as u64, &previous) {
            error!(offset, error = %undo, "Failed to restore header after torn write");
        }
        return Err(e);
    }
    Ok(())
}

fn checked_size(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| StoreError::StoreFull { needed: size })
}
