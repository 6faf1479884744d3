//! Binary Layout
//!
//! Fixed-size header codecs. Every decoder validates every field it can, so
//! the rest of the crate never has to second-guess a parsed header.

use std::path::Path;

use crate::error::{Result, StoreError};

// =============================================================================
// Constants
// =============================================================================

/// Marker of the store header and of every live item
pub const USED_MAGIC: u32 = 0xDEAD_BEEF;

/// Marker of every free slot
pub const FREE_MAGIC: u32 = 0xFEDC_CDEF;

/// Reserved padding inside the store header
pub const RESERVED_SIZE: usize = 512;

/// Store header: Magic1 (4) + LastBackup (8) + IndexVersion (4) + Reserved (512) + Magic2 (4)
pub const STORE_HEADER_SIZE: u32 = 4 + 8 + 4 + RESERVED_SIZE as u32 + 4;

/// Offset of the mutable part of the store header (LastBackup + IndexVersion)
pub const STORE_FIELDS_OFFSET: u64 = 4;

/// Size of the mutable part of the store header
pub const STORE_FIELDS_SIZE: usize = 12;

/// Item header: six u32 fields
pub const ITEM_HEADER_SIZE: u32 = 6 * 4;

/// Free slot header: three u32 fields
pub const FREE_HEADER_SIZE: u32 = 3 * 4;

/// No free slot is ever smaller than an item header
pub const MIN_FREE_SLOT: u32 = ITEM_HEADER_SIZE;

/// Minimum number of bytes added whenever the file grows
pub const MIN_EXPAND: u32 = 0x10000;

/// Compaction is only considered above this much free space
pub const COMPACT_THRESHOLD: u32 = 0x10000;

/// Granularity of the zero-fill when the file grows
pub const EXPAND_CHUNK: usize = 8 * 1024;

/// The trailing free slot written by compaction is a multiple of this
pub const COMPACT_ALIGN: u32 = 4096;

// =============================================================================
// Little-endian helpers
// =============================================================================

#[inline]
pub(crate) fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Checksum stored in an item header (CRC-32 over exactly `used` value bytes)
pub fn checksum(value: &[u8]) -> u32 {
    crc32fast::hash(value)
}

// =============================================================================
// Store Header
// =============================================================================

/// Header at offset 0 of every store file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreHeader {
    /// Milliseconds since the Unix epoch of the last backup (0 = never)
    pub last_backup: u64,

    /// Counter bumped on every mutation
    pub index_version: u32,
}

impl StoreHeader {
    pub fn encode(&self) -> [u8; STORE_HEADER_SIZE as usize] {
        let mut buf = [0u8; STORE_HEADER_SIZE as usize];
        let end = STORE_HEADER_SIZE as usize;
        buf[0..4].copy_from_slice(&USED_MAGIC.to_le_bytes());
        buf[4..16].copy_from_slice(&self.encode_fields());
        buf[end - 4..end].copy_from_slice(&USED_MAGIC.to_le_bytes());
        buf
    }

    /// Encode only the mutable fields, for in-place header updates
    pub fn encode_fields(&self) -> [u8; STORE_FIELDS_SIZE] {
        let mut buf = [0u8; STORE_FIELDS_SIZE];
        buf[0..8].copy_from_slice(&self.last_backup.to_le_bytes());
        buf[8..12].copy_from_slice(&self.index_version.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        let end = STORE_HEADER_SIZE as usize;
        if buf.len() < end {
            return Err(StoreError::BadStoreHeader {
                path: path.to_path_buf(),
                reason: format!("file holds {} bytes, header needs {}", buf.len(), end),
            });
        }

        let magic1 = le_u32(buf, 0);
        let magic2 = le_u32(buf, end - 4);
        if magic1 != USED_MAGIC || magic2 != USED_MAGIC {
            return Err(StoreError::BadStoreHeader {
                path: path.to_path_buf(),
                reason: format!("bad magic 0x{:08X}/0x{:08X}", magic1, magic2),
            });
        }

        Ok(Self {
            last_backup: le_u64(buf, 4),
            index_version: le_u32(buf, 12),
        })
    }
}

// =============================================================================
// Item Header
// =============================================================================

/// Header in front of every live item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    /// Bytes reserved for the value (used + spare)
    pub allocated: u32,

    /// Bytes of the current value
    pub used: u32,

    pub version: u32,

    /// CRC-32 of the `used` value bytes
    pub checksum: u32,

    /// Byte length of the key that follows the header
    pub key_len: u32,
}

impl ItemHeader {
    pub fn encode(&self) -> [u8; ITEM_HEADER_SIZE as usize] {
        let mut buf = [0u8; ITEM_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&USED_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.allocated.to_le_bytes());
        buf[8..12].copy_from_slice(&self.used.to_le_bytes());
        buf[12..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.key_len.to_le_bytes());
        buf
    }

    /// Decode and validate an item header read at `offset`
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < ITEM_HEADER_SIZE as usize {
            return Err(StoreError::Truncated {
                offset,
                needed: ITEM_HEADER_SIZE as u64,
                available: buf.len() as u64,
            });
        }

        let magic = le_u32(buf, 0);
        if magic != USED_MAGIC {
            return Err(StoreError::UnknownMarker { offset, marker: magic });
        }

        let header = Self {
            allocated: le_u32(buf, 4),
            used: le_u32(buf, 8),
            version: le_u32(buf, 12),
            checksum: le_u32(buf, 16),
            key_len: le_u32(buf, 20),
        };

        if header.used > header.allocated {
            return Err(StoreError::BadItemHeader {
                offset,
                reason: format!("used {} exceeds allocated {}", header.used, header.allocated),
            });
        }
        if header.key_len == 0 {
            return Err(StoreError::BadItemHeader {
                offset,
                reason: "empty key".to_string(),
            });
        }
        if header.slot_size() > u32::MAX as u64 {
            return Err(StoreError::BadItemHeader {
                offset,
                reason: format!("slot size {} overflows the offset range", header.slot_size()),
            });
        }

        Ok(header)
    }

    /// Whole slot: header + key + allocated value bytes
    pub fn slot_size(&self) -> u64 {
        ITEM_HEADER_SIZE as u64 + self.key_len as u64 + self.allocated as u64
    }
}

// =============================================================================
// Free Slot Header
// =============================================================================

/// Header in front of every free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeHeader {
    /// Size of the whole slot, header included
    pub size: u32,
}

impl FreeHeader {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn encode(&self) -> [u8; FREE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FREE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&FREE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.size ^ FREE_MAGIC).to_le_bytes());
        buf
    }

    /// Decode a free header read at `offset`, checking the XOR guard
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < FREE_HEADER_SIZE as usize {
            return Err(StoreError::Truncated {
                offset,
                needed: FREE_HEADER_SIZE as u64,
                available: buf.len() as u64,
            });
        }

        let magic = le_u32(buf, 0);
        if magic != FREE_MAGIC {
            return Err(StoreError::UnknownMarker { offset, marker: magic });
        }

        let size = le_u32(buf, 4);
        let xor = le_u32(buf, 8);
        if size ^ FREE_MAGIC != xor || size < MIN_FREE_SLOT {
            return Err(StoreError::BadFreeSlot { offset, size, xor });
        }

        Ok(Self { size })
    }
}
