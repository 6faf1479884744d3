//! Write path: add, update, delete.
//!
//! Every operation either completes or puts the file back the way it was
//! before returning the error.

use bytes::{BufMut, BytesMut};
use tracing::{debug, error};

use crate::error::{Result, StoreError};
use crate::index::StoreItem;
use crate::storage::layout::{checksum, FreeHeader, ItemHeader, ITEM_HEADER_SIZE};
use crate::storage::{FreeSlot, StoreFile};

use super::StoreEngine;

impl StoreEngine {
    // =========================================================================
    // Add
    // =========================================================================

    /// Store a new object with `reserve` spare bytes for later growth.
    /// Returns the object's version (always 1).
    pub fn add(&mut self, key: &str, value: &[u8], reserve: u32) -> Result<u32> {
        self.ensure_ready()?;
        if self.items.contains(key) {
            return Err(StoreError::KeyExists { key: key.to_string() });
        }

        let key_len = len_u32(key.len())?;
        let used = len_u32(value.len())?;
        let needed = to_slot_size(ITEM_HEADER_SIZE as u64 + key_len as u64 + used as u64 + reserve as u64)?;

        // Step 1: Find room, growing or compacting the file if needed
        let slot = self.reserve_slot(needed, true)?;

        // Step 2: Write the item over the free slot
        let allocated = slot.size - ITEM_HEADER_SIZE - key_len;
        let header = ItemHeader {
            allocated,
            used,
            version: 1,
            checksum: checksum(value),
            key_len,
        };
        let file = self.file_mut()?;
        if let Err(e) = write_item(file, slot.offset, &header, key.as_bytes(), value) {
            restore_free_slot(file, slot);
            return Err(e);
        }

        // Step 3: Only now drop the free slot and index the item
        self.free.remove_at_offset(slot.offset)?;
        self.items.insert(StoreItem::new(key.to_string(), slot.offset, used, allocated, 1));
        self.commit()?;

        debug!(key, offset = slot.offset, size = slot.size, "Added object");
        Ok(1)
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Replace an object's value. Returns the new version.
    pub fn update(&mut self, key: &str, value: &[u8]) -> Result<u32> {
        self.ensure_ready()?;
        let item = self
            .items
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound { key: key.to_string() })?;

        let used = len_u32(value.len())?;
        let version = next_version(item.version);

        if used <= item.allocated {
            self.update_in_place(&item, value, version)?;
        } else {
            self.relocate(&item, value, version)?;
        }

        self.commit()?;
        Ok(version)
    }

    /// Add the object if missing, otherwise update it.
    /// Returns whether it was new and its version.
    pub fn add_or_update(&mut self, key: &str, value: &[u8], reserve: u32) -> Result<(bool, u32)> {
        self.ensure_ready()?;
        if self.items.contains(key) {
            Ok((false, self.update(key, value)?))
        } else {
            Ok((true, self.add(key, value, reserve)?))
        }
    }

    /// New value fits the current allocation: rewrite header, key and value
    fn update_in_place(&mut self, item: &StoreItem, value: &[u8], version: u32) -> Result<()> {
        let key_len = item.key_len();
        let value_offset = item.offset as u64 + ITEM_HEADER_SIZE as u64 + key_len as u64;
        let file = self.file_mut()?;

        // Keep the current value so a torn write can be undone
        let mut previous = vec![0u8; item.used as usize];
        file.read_at(value_offset, &mut previous)?;
        let old_header = ItemHeader {
            allocated: item.allocated,
            used: item.used,
            version: item.version,
            checksum: checksum(&previous),
            key_len,
        };

        let header = ItemHeader {
            allocated: item.allocated,
            used: len_u32(value.len())?,
            version,
            checksum: checksum(value),
            key_len,
        };

        if let Err(e) = write_item(file, item.offset, &header, item.key.as_bytes(), value) {
            if let Err(undo) = write_item(file, item.offset, &old_header, item.key.as_bytes(), &previous) {
                error!(key = %item.key, error = %undo, "Failed to restore object after torn update");
            }
            return Err(e);
        }

        if let Some(entry) = self.items.get_mut(&item.key) {
            entry.used = header.used;
            entry.version = version;
        }
        Ok(())
    }

    /// New value does not fit: write a new copy, then release the old slot.
    ///
    /// Only ever expands the file. Compaction would move the item this
    /// operation is holding on to.
    fn relocate(&mut self, item: &StoreItem, value: &[u8], version: u32) -> Result<()> {
        let key_len = item.key_len();
        let used = len_u32(value.len())?;
        let needed = to_slot_size(item.storage_required(used))?;

        // Step 1: New slot
        let slot = self.reserve_slot(needed, false)?;

        // Step 2: New copy
        let allocated = slot.size - ITEM_HEADER_SIZE - key_len;
        let header = ItemHeader {
            allocated,
            used,
            version,
            checksum: checksum(value),
            key_len,
        };
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        if let Err(e) = write_item(file, slot.offset, &header, item.key.as_bytes(), value) {
            restore_free_slot(file, slot);
            return Err(e);
        }

        // Step 3: Release the old copy without merging it into the new slot
        if let Err(e) = self.free.give_back(file, item.offset, item.slot_size(), false) {
            restore_free_slot(file, slot);
            return Err(e);
        }

        // Step 4: Drop the consumed free slot
        self.free.remove_at_offset(slot.offset)?;

        if let Some(entry) = self.items.get_mut(&item.key) {
            entry.offset = slot.offset;
            entry.used = used;
            entry.allocated = allocated;
            entry.version = version;
        }

        debug!(key = %item.key, from = item.offset, to = slot.offset, "Relocated object");
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_ready()?;
        self.release(key)?;
        self.commit()
    }

    /// Delete the object if present. Returns whether anything was deleted.
    pub fn delete_if_exists(&mut self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        if !self.items.contains(key) {
            return Ok(false);
        }
        self.delete(key)?;
        Ok(true)
    }

    /// Delete every object at or below `scope`. Returns how many went.
    pub fn delete_scope(&mut self, scope: &str) -> Result<usize> {
        self.ensure_ready()?;
        let keys = self.items.all_objects_under(scope);
        if keys.is_empty() {
            return Ok(0);
        }

        for key in &keys {
            self.release(key)?;
        }
        self.commit()?;

        debug!(scope, count = keys.len(), "Deleted scope");
        Ok(keys.len())
    }

    /// Return an object's slot to the free list and drop it from the index
    fn release(&mut self, key: &str) -> Result<()> {
        let item = self
            .items
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound { key: key.to_string() })?;

        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        self.free.give_back(file, item.offset, item.slot_size(), true)?;
        self.items.remove(key);
        Ok(())
    }

    // =========================================================================
    // Space
    // =========================================================================

    /// Find a slot of at least `needed` bytes, growing the file when none
    /// exists. Compaction is only allowed when no item is in flight.
    pub(super) fn reserve_slot(&mut self, needed: u32, allow_compact: bool) -> Result<FreeSlot> {
        if let Some(slot) = self.find_space(needed)? {
            return Ok(slot);
        }

        if allow_compact {
            self.expand_or_compact(needed)?;
        } else {
            self.expand(needed)?;
        }

        self.find_space(needed)?.ok_or_else(|| {
            StoreError::Internal(format!("no free slot of {} bytes after growing the store", needed))
        })
    }

    fn find_space(&mut self, needed: u32) -> Result<Option<FreeSlot>> {
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        self.free.find_free_space(file, needed)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Write header, key and value in one go
pub(super) fn write_item(file: &mut StoreFile, offset: u32, header: &ItemHeader, key: &[u8], value: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(ITEM_HEADER_SIZE as usize + key.len() + value.len());
    buf.put_slice(&header.encode());
    buf.put_slice(key);
    buf.put_slice(value);
    file.write_at(offset as u64, &buf)
}

/// Put the free header back over a slot whose item write failed
fn restore_free_slot(file: &mut StoreFile, slot: FreeSlot) {
    if let Err(e) = file.write_at(slot.offset as u64, &FreeHeader::new(slot.size).encode()) {
        error!(offset = slot.offset, error = %e, "Failed to restore free slot header");
    }
}

/// Versions start at 1 and skip 0 on wrap-around
fn next_version(version: u32) -> u32 {
    match version.wrapping_add(1) {
        0 => 1,
        v => v,
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| StoreError::StoreFull { needed: len as u64 })
}

fn to_slot_size(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| StoreError::StoreFull { needed: size })
}
