//! Object Store
//!
//! The thread-safe entry point. One mutex guards the whole engine, so at
//! most one operation runs against the store at any time; every call runs
//! to completion before the lock is released.
//!
//! Keys are slash-delimited paths. Object keys start with '/' and do not
//! end with one; scope arguments only need the leading '/'.

use std::io::Write;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::config::{Config, StoreFlags};
use crate::engine::{EngineState, LoadResult, StoreEngine, StoreStats, ValidationReport};
use crate::error::{Result, StoreError};
use crate::index::LoadReport;

/// Outcome of a versioned read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<T = Vec<u8>> {
    NotFound,
    /// The stored version equals the one the caller already has
    NoNewData,
    NewData { value: T, version: u32 },
}

impl<T> ReadResult<T> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReadResult::NotFound)
    }

    /// The value, if new data was read
    pub fn into_value(self) -> Option<T> {
        match self {
            ReadResult::NewData { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            ReadResult::NewData { version, .. } => Some(*version),
            _ => None,
        }
    }
}

struct Inner {
    config: Config,
    engine: Option<StoreEngine>,
    /// Reusable buffer for flattening typed objects
    value_buf: BytesMut,
    /// Reusable buffer for reads
    read_buf: Vec<u8>,
}

impl Inner {
    fn engine(&mut self) -> Result<&mut StoreEngine> {
        ready(&mut self.engine)
    }
}

/// The engine, if it is open
fn ready(engine: &mut Option<StoreEngine>) -> Result<&mut StoreEngine> {
    match engine {
        Some(engine) if engine.state() == EngineState::Ready => Ok(engine),
        _ => Err(StoreError::NotReady),
    }
}

/// Embedded, single-file object store
pub struct ObjectStore {
    inner: Mutex<Inner>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    /// Create an uninitialized store with default settings
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create an uninitialized store; `initialize` picks the location
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                engine: None,
                value_buf: BytesMut::new(),
                read_buf: Vec::new(),
            }),
        }
    }

    /// Create a store and initialize it at the config's location.
    /// Returns the store and whether a new file was created.
    pub fn open(config: Config) -> Result<(Self, bool)> {
        let dir = config.data_dir.clone();
        let name = config.store_name.clone();
        let flags = config.flags;
        let store = Self::with_config(config);
        let created = store.initialize(&dir, &name, flags)?;
        Ok((store, created))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open `<dir>/<name>.ObjStore`, creating it when missing.
    /// Returns true when a new store file was created.
    pub fn initialize(&self, dir: &Path, name: &str, flags: StoreFlags) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(engine) = inner.engine.as_ref() {
            if engine.state() == EngineState::Ready {
                return Err(StoreError::AlreadyInitialized);
            }
        }

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(StoreError::BadKey {
                key: name.to_string(),
                reason: "store name must be alphanumeric",
            });
        }

        inner.config.data_dir = dir.to_path_buf();
        inner.config.store_name = name.to_string();
        inner.config.flags = flags;

        let mut engine = StoreEngine::new(&inner.config);
        let created = engine.initialize()?;
        inner.engine = Some(engine);

        info!(dir = %dir.display(), name, created, "Store initialized");
        Ok(created)
    }

    /// Flush and close. Closing an unopened or closed store does nothing.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.engine.as_mut() {
            Some(engine) => engine.close(),
            None => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().engine()?.flush()
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock();
        matches!(inner.engine.as_ref().map(|e| e.state()), Some(EngineState::Ready))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a new object, with `reserve` spare bytes for later growth
    pub fn add(&self, key: &str, value: &[u8], reserve: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, false)?;
        engine.add(key, value, reserve)?;
        Ok(())
    }

    /// Replace an existing object's value. Returns the new version.
    pub fn update(&self, key: &str, value: &[u8]) -> Result<u32> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, false)?;
        engine.update(key, value)
    }

    /// Add or update. Returns whether the object was new and its version.
    pub fn add_or_update(&self, key: &str, value: &[u8], reserve: u32) -> Result<(bool, u32)> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, false)?;
        engine.add_or_update(key, value, reserve)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, true)?;
        engine.delete(key)
    }

    /// Delete if present. Returns whether anything was deleted.
    pub fn delete_if_exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, true)?;
        engine.delete_if_exists(key)
    }

    /// Delete every object at or below `scope`. Returns how many went.
    pub fn delete_scope(&self, scope: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_scope(scope)?;
        engine.delete_scope(scope)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an object unless the caller already has `expected_version`.
    /// Version 0 always reads.
    pub fn read(&self, key: &str, expected_version: u32) -> Result<ReadResult> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let engine = ready(&mut inner.engine)?;
        check_key(key, true)?;

        Ok(match engine.read_into(key, expected_version, &mut inner.read_buf)? {
            LoadResult::NotFound => ReadResult::NotFound,
            LoadResult::NoNewData => ReadResult::NoNewData,
            LoadResult::NewData { version } => ReadResult::NewData {
                value: inner.read_buf.clone(),
                version,
            },
        })
    }

    /// Version of the object under `key`, if it exists
    pub fn key_exists(&self, key: &str) -> Result<Option<u32>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_key(key, true)?;
        engine.key_exists(key)
    }

    pub fn objects_in_scope(&self, scope: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_scope(scope)?;
        engine.objects_in_scope(scope)
    }

    pub fn sub_scopes(&self, scope: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_scope(scope)?;
        engine.sub_scopes(scope)
    }

    pub fn all_objects_under(&self, scope: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_scope(scope)?;
        engine.all_objects_under(scope)
    }

    /// Every object called `name` anywhere below `scope`
    pub fn find_name_under(&self, name: &str, scope: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine()?;
        check_scope(scope)?;
        if name.is_empty() || name.contains('/') {
            return Err(StoreError::BadKey {
                key: name.to_string(),
                reason: "name must be non-empty and contain no '/'",
            });
        }
        engine.find_name_under(name, scope)
    }

    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.inner.lock().engine()?.all_keys()
    }

    pub fn object_count(&self) -> Result<usize> {
        self.inner.lock().engine()?.object_count()
    }

    // =========================================================================
    // Typed Objects
    // =========================================================================

    /// Flatten `value` with bincode and store it as a new object
    pub fn add_object<T: Serialize>(&self, key: &str, value: &T, reserve: u32) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let engine = ready(&mut inner.engine)?;
        check_key(key, false)?;
        flatten(&mut inner.value_buf, value)?;
        engine.add(key, &inner.value_buf, reserve)?;
        Ok(())
    }

    pub fn update_object<T: Serialize>(&self, key: &str, value: &T) -> Result<u32> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let engine = ready(&mut inner.engine)?;
        check_key(key, false)?;
        flatten(&mut inner.value_buf, value)?;
        engine.update(key, &inner.value_buf)
    }

    pub fn add_or_update_object<T: Serialize>(&self, key: &str, value: &T, reserve: u32) -> Result<(bool, u32)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let engine = ready(&mut inner.engine)?;
        check_key(key, false)?;
        flatten(&mut inner.value_buf, value)?;
        engine.add_or_update(key, &inner.value_buf, reserve)
    }

    /// Read and unflatten a typed object
    pub fn read_object<T: DeserializeOwned>(&self, key: &str, expected_version: u32) -> Result<ReadResult<T>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let engine = ready(&mut inner.engine)?;
        check_key(key, true)?;

        Ok(match engine.read_into(key, expected_version, &mut inner.read_buf)? {
            LoadResult::NotFound => ReadResult::NotFound,
            LoadResult::NoNewData => ReadResult::NoNewData,
            LoadResult::NewData { version } => {
                let value = bincode::deserialize(&inner.read_buf)
                    .map_err(|e| StoreError::Serialization(format!("{}: {}", key, e)))?;
                ReadResult::NewData { value, version }
            }
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Copy the store into `<name>.StoreBack1`, rotating the previous backup
    pub fn backup(&self) -> Result<()> {
        self.inner.lock().engine()?.backup()
    }

    /// Rewrite the store without fragmentation
    pub fn compact(&self) -> Result<()> {
        self.inner.lock().engine()?.compact()
    }

    /// Check the store. With a sink problems are reported there and the
    /// check continues; without one the first problem is returned.
    pub fn validate(&self, sink: Option<&mut dyn Write>) -> Result<ValidationReport> {
        self.inner.lock().engine()?.validate(sink)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.inner.lock().engine()?.stats()
    }

    /// Milliseconds since the Unix epoch of the last backup (0 = never)
    pub fn last_backup(&self) -> Result<u64> {
        self.inner.lock().engine()?.last_backup()
    }

    /// Counter bumped on every change, for cheap "anything new?" checks
    pub fn index_version(&self) -> Result<u32> {
        self.inner.lock().engine()?.index_version()
    }

    /// What had to be fixed when the store was last opened
    pub fn load_report(&self) -> Result<LoadReport> {
        Ok(self.inner.lock().engine()?.load_report().clone())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn check_key(key: &str, allow_trailing_slash: bool) -> Result<()> {
    if !key.starts_with('/') {
        return Err(StoreError::BadKey {
            key: key.to_string(),
            reason: "key must start with '/'",
        });
    }
    if key.len() == 1 {
        return Err(StoreError::BadKey {
            key: key.to_string(),
            reason: "key has no name",
        });
    }
    if !allow_trailing_slash && key.ends_with('/') {
        return Err(StoreError::BadKey {
            key: key.to_string(),
            reason: "key must not end with '/'",
        });
    }
    Ok(())
}

fn check_scope(scope: &str) -> Result<()> {
    if !scope.starts_with('/') {
        return Err(StoreError::BadKey {
            key: scope.to_string(),
            reason: "scope must start with '/'",
        });
    }
    Ok(())
}

/// Serialize `value` into the reusable buffer
fn flatten<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<()> {
    buf.clear();
    bincode::serialize_into(buf.writer(), value).map_err(|e| StoreError::Serialization(e.to_string()))
}
