//! Error types for the object store
//!
//! Provides a unified error type for all operations. Variants are grouped the
//! same way callers need to react to them: lifecycle, key, format, I/O and
//! internal (engine bug) errors.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for object store operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Store is not initialized or has been closed")]
    NotReady,

    #[error("Store is already initialized")]
    AlreadyInitialized,

    // -------------------------------------------------------------------------
    // Key Errors
    // -------------------------------------------------------------------------
    #[error("Bad key '{key}': {reason}")]
    BadKey { key: String, reason: &'static str },

    #[error("Key already exists: {key}")]
    KeyExists { key: String },

    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Bad store header in {}: {reason}", path.display())]
    BadStoreHeader { path: PathBuf, reason: String },

    #[error("Bad item header at offset {offset}: {reason}")]
    BadItemHeader { offset: u64, reason: String },

    #[error("Bad free slot header at offset {offset}: size={size}, xor=0x{xor:08X}")]
    BadFreeSlot { offset: u64, size: u32, xor: u32 },

    #[error("Unknown slot marker 0x{marker:08X} at offset {offset}")]
    UnknownMarker { offset: u64, marker: u32 },

    #[error("Checksum mismatch for '{key}' at offset {offset}: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        key: String,
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Header mismatch for '{key}': {field} is {index} in the index but {disk} on disk")]
    HeaderMismatch {
        key: String,
        field: &'static str,
        index: u32,
        disk: u32,
    },

    #[error("Key bytes at offset {offset} are not valid UTF-8")]
    BadKeyBytes { offset: u64 },

    #[error("Truncated read at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    #[error("Slot at offset {offset} does not follow the previous slot (expected offset {expected})")]
    Gap { offset: u64, expected: u64 },

    #[error("Slot size mismatch at offset {offset}: index says {index}, disk says {disk}")]
    SlotSizeMismatch { offset: u64, index: u32, disk: u32 },

    #[error("Slots cover {covered} bytes but the file is {file_len} bytes")]
    UncoveredTail { covered: u64, file_len: u64 },

    #[error("Key stored more than once: {key}")]
    DuplicateKey { key: String },

    #[error("Store file would exceed the 4 GiB offset range (needs {needed} bytes)")]
    StoreFull { needed: u64 },

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error during {context}: {source}")]
    IoAt {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Internal Errors (engine invariants, never caused by file contents)
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// True for errors caused by bad bytes in a store file
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            StoreError::BadStoreHeader { .. }
                | StoreError::BadItemHeader { .. }
                | StoreError::BadFreeSlot { .. }
                | StoreError::UnknownMarker { .. }
                | StoreError::ChecksumMismatch { .. }
                | StoreError::HeaderMismatch { .. }
                | StoreError::BadKeyBytes { .. }
                | StoreError::Truncated { .. }
                | StoreError::Gap { .. }
                | StoreError::SlotSizeMismatch { .. }
                | StoreError::UncoveredTail { .. }
                | StoreError::DuplicateKey { .. }
        )
    }

    /// True for errors that indicate a bug in the engine itself
    pub fn is_internal(&self) -> bool {
        matches!(self, StoreError::Internal(_))
    }

    /// True for I/O failures reported by the file system
    pub fn is_io(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::IoAt { .. })
    }
}
