//! Configuration for the object store
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::storage::layout::{MIN_EXPAND, MIN_FREE_SLOT};

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Location
    // -------------------------------------------------------------------------
    /// Directory holding the store file and its siblings
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {name}.ObjStore      (live store)
    ///     ├── {name}.TmpStore      (compaction / backup scratch)
    ///     ├── {name}.StoreBack1    (newest backup)
    ///     ├── {name}.StoreBack2    (previous backup)
    ///     └── {name}.SavedStore    (quarantined unrecoverable store)
    pub data_dir: PathBuf,

    /// Store name, used to derive all file names. Alphanumeric, no spaces.
    pub store_name: String,

    // -------------------------------------------------------------------------
    // Open Flags
    // -------------------------------------------------------------------------
    pub flags: StoreFlags,

    // -------------------------------------------------------------------------
    // Space Management
    // -------------------------------------------------------------------------
    /// Size of the single free slot a new store starts with (in bytes)
    pub initial_free_size: u32,

    /// Extra bytes added on top of the request whenever the file grows
    pub min_expand_size: u32,

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------
    /// fsync the store file after every mutating operation
    pub sync_on_write: bool,
}

/// Flags given at store-open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFlags {
    /// Treat keys that differ only in case as different keys
    pub case_sensitive: bool,

    /// Salvage what can be salvaged while building the index instead of
    /// failing on the first bad slot
    pub recovery_mode: bool,
}

impl Default for StoreFlags {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            recovery_mode: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./objstore_data"),
            store_name: "Store".to_string(),
            flags: StoreFlags::default(),
            initial_free_size: 128 * 1024, // 128 KB
            min_expand_size: MIN_EXPAND,
            sync_on_write: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the directory holding the store files
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the store name
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.config.store_name = name.into();
        self
    }

    /// Set both open flags at once
    pub fn flags(mut self, flags: StoreFlags) -> Self {
        self.config.flags = flags;
        self
    }

    /// Set whether keys are case sensitive
    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.config.flags.case_sensitive = yes;
        self
    }

    /// Set whether the index builder runs in recovery mode
    pub fn recovery_mode(mut self, yes: bool) -> Self {
        self.config.flags.recovery_mode = yes;
        self
    }

    /// Set the initial free space of a new store (0 = none)
    pub fn initial_free_size(mut self, size: u32) -> Self {
        self.config.initial_free_size = size;
        self
    }

    /// Set the minimum expansion size
    pub fn min_expand_size(mut self, size: u32) -> Self {
        self.config.min_expand_size = size;
        self
    }

    /// Set whether every mutation is synced to disk
    pub fn sync_on_write(mut self, yes: bool) -> Self {
        self.config.sync_on_write = yes;
        self
    }

    pub fn build(mut self) -> Config {
        // A non-empty initial slot must be able to hold at least a header
        if self.config.initial_free_size != 0 {
            self.config.initial_free_size = self.config.initial_free_size.max(MIN_FREE_SLOT);
        }
        self.config.min_expand_size = self.config.min_expand_size.max(MIN_FREE_SLOT);
        self.config
    }
}
