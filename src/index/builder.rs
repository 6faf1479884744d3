//! Index Builder
//!
//! Rebuilds the item index and the free list by walking the store file slot
//! by slot, starting right after the store header.
//!
//! ## Recovery Behavior
//! - Two live copies of one key (a relocating update interrupted before the
//!   old copy was released): the higher version wins, the other slot is
//!   rewritten as free space. Always applied.
//! - Item with a bad checksum or unreadable key: fatal, or in recovery mode
//!   the slot is rewritten as free space.
//! - Unknown marker, bad free header, slot running past end of file: fatal,
//!   or in recovery mode everything from that offset on becomes one free
//!   slot (or is cut off when too small to hold a free header).

use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::storage::layout::{
    checksum, FreeHeader, ItemHeader, StoreHeader, FREE_HEADER_SIZE, FREE_MAGIC,
    ITEM_HEADER_SIZE, MIN_FREE_SLOT, STORE_HEADER_SIZE, USED_MAGIC,
};
use crate::storage::{FreeList, FreeListItem, StoreFile};

use super::item::{ItemIndex, StoreItem};

/// Everything reconstructed from a store file
#[derive(Debug)]
pub struct LoadedIndex {
    pub header: StoreHeader,
    pub items: ItemIndex,
    pub free: FreeList,
    pub report: LoadReport,
}

/// What the builder found and fixed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub objects: usize,
    pub free_slots: usize,
    /// Stale copies released after an interrupted update
    pub duplicates_resolved: usize,
    /// Damaged slots turned into free space (recovery mode)
    pub slots_salvaged: usize,
    /// Bytes cut off the end of the file (recovery mode)
    pub bytes_truncated: u64,
    /// One line per repair action
    pub actions: Vec<String>,
}

impl LoadReport {
    /// True when the file was loaded without changing anything
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One slot as read from disk
enum Slot {
    Item { header: ItemHeader, key: String },
    Free { size: u32 },
    /// Item whose extent is known but whose contents are damaged
    Damaged { size: u32, error: StoreError },
}

/// Scan `file` and rebuild its index and free list
pub fn build_index(file: &mut StoreFile, case_sensitive: bool, recovery_mode: bool) -> Result<LoadedIndex> {
    // Step 1: Store header
    if file.len() < STORE_HEADER_SIZE as u64 {
        return Err(StoreError::BadStoreHeader {
            path: file.path().to_path_buf(),
            reason: format!("file is only {} bytes", file.len()),
        });
    }
    if file.len() > u32::MAX as u64 {
        return Err(StoreError::BadStoreHeader {
            path: file.path().to_path_buf(),
            reason: format!("file is {} bytes, beyond the 4 GiB offset range", file.len()),
        });
    }

    let mut raw = [0u8; STORE_HEADER_SIZE as usize];
    file.read_at(0, &mut raw)?;
    let header = StoreHeader::decode(&raw, file.path())?;

    // Step 2: Walk the slots
    let mut items = ItemIndex::new(case_sensitive);
    let mut free = FreeList::new();
    let mut report = LoadReport::default();
    let mut value = Vec::new();
    let mut offset = STORE_HEADER_SIZE as u64;

    while offset < file.len() {
        match scan_slot(file, offset, &mut value) {
            Ok(Slot::Item { header: item_header, key }) => {
                let item = StoreItem::new(
                    key,
                    offset as u32,
                    item_header.used,
                    item_header.allocated,
                    item_header.version,
                );
                offset += item_header.slot_size();
                keep_newest(file, &mut items, &mut free, &mut report, item)?;
            }
            Ok(Slot::Free { size }) => {
                free.insert_sorted(FreeListItem::new(offset as u32, size));
                offset += size as u64;
            }
            Ok(Slot::Damaged { size, error }) => {
                if !recovery_mode {
                    return Err(error);
                }
                warn!(offset, size, error = %error, "Releasing damaged item slot");
                file.write_at(offset, &FreeHeader::new(size).encode())?;
                free.insert_sorted(FreeListItem::new(offset as u32, size));
                report.slots_salvaged += 1;
                report.actions.push(format!("freed {} bytes at {}: {}", size, offset, error));
                offset += size as u64;
            }
            Err(e) if recovery_mode && e.is_format_error() => {
                warn!(offset, error = %e, "Unreadable stretch, releasing rest of file");
                release_tail(file, offset, &mut free, &mut report, &e)?;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    report.objects = items.len();
    report.free_slots = free.len();

    if !report.is_clean() {
        info!(
            path = %file.path().display(),
            duplicates = report.duplicates_resolved,
            salvaged = report.slots_salvaged,
            truncated = report.bytes_truncated,
            "Store repaired while loading"
        );
    }

    Ok(LoadedIndex {
        header,
        items,
        free,
        report,
    })
}

/// Read the slot at `offset`. `value` is scratch space for checksumming.
fn scan_slot(file: &mut StoreFile, offset: u64, value: &mut Vec<u8>) -> Result<Slot> {
    let available = file.len() - offset;

    match file.read_u32_at(offset)? {
        USED_MAGIC => {
            let mut raw = [0u8; ITEM_HEADER_SIZE as usize];
            file.read_at(offset, &mut raw)?;
            let header = ItemHeader::decode(&raw, offset)?;

            let size = header.slot_size();
            if size > available {
                return Err(StoreError::Truncated {
                    offset,
                    needed: size,
                    available,
                });
            }
            let size = size as u32;

            let mut key = vec![0u8; header.key_len as usize];
            file.read_at(offset + ITEM_HEADER_SIZE as u64, &mut key)?;
            let key = match String::from_utf8(key) {
                Ok(key) => key,
                Err(_) => {
                    return Ok(Slot::Damaged {
                        size,
                        error: StoreError::BadKeyBytes { offset },
                    })
                }
            };

            value.resize(header.used as usize, 0);
            file.read_at(offset + ITEM_HEADER_SIZE as u64 + header.key_len as u64, value)?;
            let computed = checksum(value);
            if computed != header.checksum {
                return Ok(Slot::Damaged {
                    size,
                    error: StoreError::ChecksumMismatch {
                        key,
                        offset,
                        stored: header.checksum,
                        computed,
                    },
                });
            }

            Ok(Slot::Item { header, key })
        }
        FREE_MAGIC => {
            let mut raw = [0u8; FREE_HEADER_SIZE as usize];
            file.read_at(offset, &mut raw)?;
            let header = FreeHeader::decode(&raw, offset)?;
            if header.size as u64 > available {
                return Err(StoreError::Truncated {
                    offset,
                    needed: header.size as u64,
                    available,
                });
            }
            Ok(Slot::Free { size: header.size })
        }
        marker => Err(StoreError::UnknownMarker { offset, marker }),
    }
}

/// Insert `item`, keeping only the highest version of each key
fn keep_newest(
    file: &mut StoreFile,
    items: &mut ItemIndex,
    free: &mut FreeList,
    report: &mut LoadReport,
    item: StoreItem,
) -> Result<()> {
    let stale = match items.get(&item.key).map(|existing| existing.version) {
        None => {
            items.insert(item);
            return Ok(());
        }
        Some(version) if version >= item.version => item,
        Some(_) => match items.insert(item) {
            Some(previous) => previous,
            None => return Ok(()),
        },
    };

    warn!(
        key = %stale.key,
        offset = stale.offset,
        version = stale.version,
        "Releasing stale copy of key"
    );
    file.write_at(stale.offset as u64, &FreeHeader::new(stale.slot_size()).encode())?;
    free.insert_sorted(FreeListItem::new(stale.offset, stale.slot_size()));
    report.duplicates_resolved += 1;
    report.actions.push(format!(
        "released stale copy of {} (version {}) at {}",
        stale.key, stale.version, stale.offset
    ));
    Ok(())
}

/// Turn everything from `offset` to end of file into free space
fn release_tail(
    file: &mut StoreFile,
    offset: u64,
    free: &mut FreeList,
    report: &mut LoadReport,
    cause: &StoreError,
) -> Result<()> {
    let remainder = file.len() - offset;
    if remainder >= MIN_FREE_SLOT as u64 {
        let size = remainder as u32;
        file.write_at(offset, &FreeHeader::new(size).encode())?;
        free.insert_sorted(FreeListItem::new(offset as u32, size));
        report.slots_salvaged += 1;
        report.actions.push(format!("freed last {} bytes at {}: {}", size, offset, cause));
    } else {
        file.set_len(offset)?;
        report.bytes_truncated += remainder;
        report.actions.push(format!("cut {} bytes at {}: {}", remainder, offset, cause));
    }
    Ok(())
}
