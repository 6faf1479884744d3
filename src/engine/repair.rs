//! Offline salvage of a damaged store file.
//!
//! Reads the whole source file into memory and walks it leniently: intact
//! slots are followed by their stated size, anything unreadable is skipped
//! one byte at a time until the next plausible header turns up. Every intact
//! object (highest version per key) is written into a brand-new store.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::index::fold_key;
use crate::storage::layout::{
    checksum, le_u32, FreeHeader, ItemHeader, StoreHeader, FREE_HEADER_SIZE, FREE_MAGIC,
    ITEM_HEADER_SIZE, STORE_HEADER_SIZE, USED_MAGIC,
};
use crate::storage::StoreFile;

use super::write::write_item;

/// What a repair run found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Objects written to the new store
    pub recovered: usize,
    /// Older copies of a key that lost to a newer one
    pub duplicates_dropped: usize,
    /// Item headers found whose contents were damaged
    pub damaged_items: usize,
    /// Bytes skipped while hunting for the next header
    pub skipped_bytes: u64,
    /// One line per notable event
    pub log: Vec<String>,
}

struct Salvaged {
    key: String,
    version: u32,
    value: Vec<u8>,
}

/// Salvage every intact object from `src` into a new store at `dst`
pub fn repair(src: &Path, dst: &Path, case_sensitive: bool) -> Result<RepairReport> {
    let data = fs::read(src).map_err(|source| StoreError::IoAt {
        context: format!("read {}", src.display()),
        source,
    })?;
    let mut report = RepairReport::default();

    // Step 1: Header (a damaged one only costs the backup time and counter)
    let header = match StoreHeader::decode(&data, src) {
        Ok(header) => header,
        Err(e) => {
            warn!(error = %e, "Store header unreadable, using defaults");
            report.log.push(format!("header: {}", e));
            StoreHeader::default()
        }
    };

    // Step 2: Walk the slots
    let mut found: BTreeMap<String, Salvaged> = BTreeMap::new();
    let mut pos = (STORE_HEADER_SIZE as usize).min(data.len());
    let mut skip_start: Option<usize> = None;

    while pos + FREE_HEADER_SIZE as usize <= data.len() {
        let step = match le_u32(&data, pos) {
            USED_MAGIC => match salvage_item(&data, pos) {
                Ok((item, size)) => {
                    keep_newest(&mut found, item, case_sensitive, &mut report);
                    Some(size)
                }
                Err(e) => {
                    if matches!(e, StoreError::ChecksumMismatch { .. } | StoreError::BadKeyBytes { .. }) {
                        report.damaged_items += 1;
                    }
                    report.log.push(format!("{}", e));
                    None
                }
            },
            FREE_MAGIC => FreeHeader::decode(&data[pos..], pos as u64)
                .ok()
                .map(|h| h.size as usize)
                .filter(|size| pos + size <= data.len()),
            _ => None,
        };

        match step {
            Some(size) => {
                if let Some(start) = skip_start.take() {
                    report.log.push(format!("skipped {} bytes at {}", pos - start, start));
                }
                pos += size;
            }
            None => {
                skip_start.get_or_insert(pos);
                report.skipped_bytes += 1;
                pos += 1;
            }
        }
    }
    if pos < data.len() {
        report.skipped_bytes += (data.len() - pos) as u64;
    }

    // Step 3: Write the survivors into a fresh, gap-free store
    let mut out = StoreFile::create_or_truncate(dst)?;
    out.write_at(0, &header.encode())?;
    let mut offset = STORE_HEADER_SIZE as u64;

    let items: Vec<Salvaged> = found.into_values().collect();
    for item in &items {
        let key_len = item.key.len() as u32;
        let used = item.value.len() as u32;
        let header = ItemHeader {
            allocated: used,
            used,
            version: item.version,
            checksum: checksum(&item.value),
            key_len,
        };
        if offset + header.slot_size() > u32::MAX as u64 {
            return Err(StoreError::StoreFull { needed: offset + header.slot_size() });
        }
        write_item(&mut out, offset as u32, &header, item.key.as_bytes(), &item.value)?;
        offset += header.slot_size();
    }
    out.set_len(offset)?;
    out.sync()?;

    report.recovered = items.len();
    info!(
        src = %src.display(),
        dst = %dst.display(),
        recovered = report.recovered,
        damaged = report.damaged_items,
        skipped = report.skipped_bytes,
        "Repaired store"
    );
    Ok(report)
}

/// Parse and verify the item at `pos`; returns it with its slot size
fn salvage_item(data: &[u8], pos: usize) -> Result<(Salvaged, usize)> {
    let offset = pos as u64;
    let header = ItemHeader::decode(&data[pos..], offset)?;

    let key_start = pos + ITEM_HEADER_SIZE as usize;
    let value_start = key_start + header.key_len as usize;
    let value_end = value_start + header.used as usize;
    if value_end > data.len() {
        return Err(StoreError::Truncated {
            offset,
            needed: (value_end - pos) as u64,
            available: (data.len() - pos) as u64,
        });
    }

    let key = std::str::from_utf8(&data[key_start..value_start])
        .map_err(|_| StoreError::BadKeyBytes { offset })?
        .to_string();
    if !key.starts_with('/') {
        return Err(StoreError::BadKeyBytes { offset });
    }

    let value = &data[value_start..value_end];
    let computed = checksum(value);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            key,
            offset,
            stored: header.checksum,
            computed,
        });
    }

    // A reserve running past the end is fine, the value itself is intact
    let size = (header.slot_size() as usize).min(data.len() - pos);
    Ok((
        Salvaged {
            key,
            version: header.version,
            value: value.to_vec(),
        },
        size,
    ))
}

fn keep_newest(found: &mut BTreeMap<String, Salvaged>, item: Salvaged, case_sensitive: bool, report: &mut RepairReport) {
    let folded = fold_key(&item.key, case_sensitive);
    match found.get(&folded).map(|e| e.version) {
        Some(version) if version >= item.version => {
            report.duplicates_dropped += 1;
            report.log.push(format!("dropped {} version {}", item.key, item.version));
        }
        Some(version) => {
            report.duplicates_dropped += 1;
            report.log.push(format!("dropped {} version {}", item.key, version));
            found.insert(folded, item);
        }
        None => {
            found.insert(folded, item);
        }
    }
}
