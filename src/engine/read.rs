//! Read path and index queries.

use crate::error::{Result, StoreError};
use crate::index::StoreItem;
use crate::storage::layout::{checksum, ItemHeader, ITEM_HEADER_SIZE};
use crate::storage::StoreFile;

use super::StoreEngine;

/// Outcome of a versioned read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    /// No object under that key
    NotFound,
    /// The caller already holds this version
    NoNewData,
    /// The value was copied into the caller's buffer
    NewData { version: u32 },
}

impl StoreEngine {
    /// Read an object into `out`.
    ///
    /// When `expected_version` equals the stored version nothing is read and
    /// `NoNewData` is returned. Version 0 always reads.
    pub fn read_into(&mut self, key: &str, expected_version: u32, out: &mut Vec<u8>) -> Result<LoadResult> {
        self.ensure_ready()?;

        let Some(item) = self.items.get(key) else {
            return Ok(LoadResult::NotFound);
        };
        if expected_version != 0 && expected_version == item.version {
            return Ok(LoadResult::NoNewData);
        }

        let version = item.version;
        let file = self.file.as_mut().ok_or(StoreError::NotReady)?;
        load_item(file, item, out)?;
        Ok(LoadResult::NewData { version })
    }

    /// Version of the object under `key`, if any
    pub fn key_exists(&self, key: &str) -> Result<Option<u32>> {
        self.ensure_ready()?;
        Ok(self.items.get(key).map(|item| item.version))
    }

    pub fn object_count(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.items.len())
    }

    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.items.keys())
    }

    pub fn objects_in_scope(&self, scope: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.items.objects_in_scope(scope))
    }

    pub fn sub_scopes(&self, scope: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.items.sub_scopes(scope))
    }

    pub fn all_objects_under(&self, scope: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.items.all_objects_under(scope))
    }

    pub fn find_name_under(&self, name: &str, scope: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.items.find_name_under(name, scope))
    }
}

/// Read an item's value into `out`, checking the on-disk header against
/// the index entry and the value against its checksum
pub(super) fn load_item(file: &mut StoreFile, item: &StoreItem, out: &mut Vec<u8>) -> Result<()> {
    let offset = item.offset as u64;

    let mut raw = [0u8; ITEM_HEADER_SIZE as usize];
    file.read_at(offset, &mut raw)?;
    let header = ItemHeader::decode(&raw, offset)?;

    let fields = [
        ("allocated", item.allocated, header.allocated),
        ("used", item.used, header.used),
        ("version", item.version, header.version),
        ("key length", item.key_len(), header.key_len),
    ];
    for (field, index, disk) in fields {
        if index != disk {
            return Err(StoreError::HeaderMismatch {
                key: item.key.clone(),
                field,
                index,
                disk,
            });
        }
    }

    let mut key = vec![0u8; header.key_len as usize];
    file.read_at(offset + ITEM_HEADER_SIZE as u64, &mut key)?;
    if key != item.key.as_bytes() {
        return Err(StoreError::BadItemHeader {
            offset,
            reason: format!("stored key does not match '{}'", item.key),
        });
    }

    out.clear();
    out.resize(header.used as usize, 0);
    file.read_at(offset + ITEM_HEADER_SIZE as u64 + header.key_len as u64, out)?;

    let computed = checksum(out);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            key: item.key.clone(),
            offset,
            stored: header.checksum,
            computed,
        });
    }
    Ok(())
}
