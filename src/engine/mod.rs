//! Engine Module
//!
//! The store engine owns the file handle, the item index and the free list,
//! and runs every operation start to finish. It does no locking of its own:
//! the `ObjectStore` facade serializes all calls.
//!
//! ## Lifecycle
//! ```text
//!   Uninitialized ──initialize──▶ Ready ──close──▶ Closed
//!                  (create|open)    ▲                │
//!                                   └───initialize───┘
//! ```
//!
//! ## Write Ordering
//! - Free list changes hit the disk before the in-memory list changes.
//! - A new item is fully written before the free slot it used is dropped.
//! - A relocated item's old slot is released only after the new copy is
//!   written, so a crash in between leaves two copies and the index builder
//!   keeps the newer one.

mod compaction;
mod read;
mod repair;
mod validate;
mod write;


use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use crate::config::{Config, StoreFlags};
use crate::error::{Result, StoreError};
use crate::index::{build_index, ItemIndex, LoadReport};
use crate::storage::layout::{FreeHeader, StoreHeader, STORE_FIELDS_OFFSET, STORE_HEADER_SIZE};
use crate::storage::{FreeList, FreeListItem, StoreFile};

pub use read::LoadResult;
pub use repair::{repair, RepairReport};
pub use validate::ValidationReport;

// =============================================================================
// File Names
// =============================================================================

/// Every file a store may touch, derived from its directory and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub store: PathBuf,
    pub temp: PathBuf,
    pub back1: PathBuf,
    pub back2: PathBuf,
    pub saved: PathBuf,
}

impl StorePaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        let store = dir.join(format!("{}.ObjStore", name));
        Self {
            temp: store.with_extension("TmpStore"),
            back1: store.with_extension("StoreBack1"),
            back2: store.with_extension("StoreBack2"),
            saved: store.with_extension("SavedStore"),
            store,
        }
    }
}

// =============================================================================
// State and Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Closed,
}

/// Point-in-time numbers about an open store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: usize,
    pub free_slots: usize,
    pub free_bytes: u64,
    pub largest_free: u32,
    pub file_size: u64,
    pub index_version: u32,
    /// Milliseconds since the Unix epoch (0 = never backed up)
    pub last_backup: u64,
}

// =============================================================================
// Store Engine
// =============================================================================

/// Single-file object store engine
pub struct StoreEngine {
    paths: StorePaths,
    flags: StoreFlags,
    initial_free_size: u32,
    min_expand_size: u32,
    sync_on_write: bool,

    state: EngineState,
    file: Option<StoreFile>,

    /// Live objects keyed by path
    items: ItemIndex,

    /// Free slots sorted by offset
    free: FreeList,

    last_backup: u64,
    index_version: u32,

    /// What the last open had to fix
    load_report: LoadReport,

    /// Files to damage during the next compaction swap
    #[cfg(test)]
    swap_fault: compaction::SwapFault,
}

impl StoreEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            paths: StorePaths::new(&config.data_dir, &config.store_name),
            flags: config.flags,
            initial_free_size: config.initial_free_size,
            min_expand_size: config.min_expand_size,
            sync_on_write: config.sync_on_write,
            state: EngineState::Uninitialized,
            file: None,
            items: ItemIndex::new(config.flags.case_sensitive),
            free: FreeList::new(),
            last_backup: 0,
            index_version: 0,
            load_report: LoadReport::default(),
            #[cfg(test)]
            swap_fault: compaction::SwapFault::None,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the store file, creating it first if it does not exist.
    /// Returns true when a new file was created.
    pub fn initialize(&mut self) -> Result<bool> {
        if self.state == EngineState::Ready {
            return Err(StoreError::AlreadyInitialized);
        }

        if let Some(dir) = self.paths.store.parent() {
            fs::create_dir_all(dir).map_err(|source| StoreError::IoAt {
                context: format!("create directory {}", dir.display()),
                source,
            })?;
        }

        if self.paths.store.exists() {
            self.open()?;
            Ok(false)
        } else {
            self.create()?;
            Ok(true)
        }
    }

    /// Write a fresh store: header plus one initial free slot
    fn create(&mut self) -> Result<()> {
        let mut file = StoreFile::create_or_truncate(&self.paths.store)?;

        let header = StoreHeader::default();
        file.write_at(0, &header.encode())?;

        let mut free = FreeList::new();
        if self.initial_free_size > 0 {
            file.append_zeros(self.initial_free_size as u64)?;
            file.write_at(
                STORE_HEADER_SIZE as u64,
                &FreeHeader::new(self.initial_free_size).encode(),
            )?;
            free.insert_sorted(FreeListItem::new(STORE_HEADER_SIZE, self.initial_free_size));
        }
        file.sync()?;

        info!(path = %self.paths.store.display(), free = self.initial_free_size, "Created store");

        self.file = Some(file);
        self.items = ItemIndex::new(self.flags.case_sensitive);
        self.free = free;
        self.last_backup = header.last_backup;
        self.index_version = header.index_version;
        self.load_report = LoadReport::default();
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Open an existing store and rebuild the index from it
    fn open(&mut self) -> Result<()> {
        let mut file = StoreFile::open(&self.paths.store)?;
        let loaded = build_index(&mut file, self.flags.case_sensitive, self.flags.recovery_mode)?;

        info!(
            path = %self.paths.store.display(),
            objects = loaded.items.len(),
            free_slots = loaded.free.len(),
            size = file.len(),
            "Opened store"
        );

        self.file = Some(file);
        self.items = loaded.items;
        self.free = loaded.free;
        self.last_backup = loaded.header.last_backup;
        self.index_version = loaded.header.index_version;
        self.load_report = loaded.report;
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Flush and release the file. Closing twice is harmless.
    pub fn close(&mut self) -> Result<()> {
        if self.state != EngineState::Ready {
            return Ok(());
        }

        let flushed = self.flush();

        self.file = None;
        self.items.clear();
        self.free.clear();
        self.state = EngineState::Closed;

        debug!(path = %self.paths.store.display(), "Closed store");
        flushed
    }

    /// Persist the header fields and sync the file
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.write_header_fields()?;
        self.file_mut()?.sync()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn flags(&self) -> StoreFlags {
        self.flags
    }

    pub fn last_backup(&self) -> Result<u64> {
        self.ensure_ready()?;
        Ok(self.last_backup)
    }

    pub fn index_version(&self) -> Result<u32> {
        self.ensure_ready()?;
        Ok(self.index_version)
    }

    /// Fixes applied while the store was last opened
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_ready()?;
        Ok(StoreStats {
            objects: self.items.len(),
            free_slots: self.free.len(),
            free_bytes: self.free.total_free(),
            largest_free: self.free.largest(),
            file_size: self.file.as_ref().map(|f| f.len()).unwrap_or(0),
            index_version: self.index_version,
            last_backup: self.last_backup,
        })
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            _ => Err(StoreError::NotReady),
        }
    }

    fn file_mut(&mut self) -> Result<&mut StoreFile> {
        self.file.as_mut().ok_or(StoreError::NotReady)
    }

    fn header(&self) -> StoreHeader {
        StoreHeader {
            last_backup: self.last_backup,
            index_version: self.index_version,
        }
    }

    fn write_header_fields(&mut self) -> Result<()> {
        let fields = self.header().encode_fields();
        self.file_mut()?.write_at(STORE_FIELDS_OFFSET, &fields)
    }

    /// Finish a mutation: bump the index version, persist it, sync if asked
    fn commit(&mut self) -> Result<()> {
        self.index_version = self.index_version.wrapping_add(1);
        self.write_header_fields()?;
        if self.sync_on_write {
            self.file_mut()?.sync()?;
        }
        Ok(())
    }
}

impl Drop for StoreEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.paths.store.display(), error = %e, "Failed to close store");
        }
    }
}

/// Milliseconds since the Unix epoch
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
