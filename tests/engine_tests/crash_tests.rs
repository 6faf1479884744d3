//! Crash recovery tests
//!
//! These tests build store files by hand in the states a crash can leave
//! behind and check what opening them produces.
//!
//! These tests verify:
//! - Two copies of a key (interrupted relocation): the newer one wins
//! - A free slot split interrupted after the tail header was written
//! - A store dropped without closing reopens with all acknowledged writes
//! - Damaged items and short files fail to open, or are salvaged in
//!   recovery mode

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use objstore::storage::layout::{
    checksum, FreeHeader, ItemHeader, StoreHeader, ITEM_HEADER_SIZE, STORE_HEADER_SIZE,
};
use objstore::{Config, ObjectStore, ReadResult};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const NAME: &str = "Crash";

fn store_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.ObjStore", NAME))
}

fn open(dir: &Path, recovery: bool) -> objstore::Result<ObjectStore> {
    let config = Config::builder()
        .data_dir(dir)
        .store_name(NAME)
        .recovery_mode(recovery)
        .build();
    ObjectStore::open(config).map(|(store, _)| store)
}

fn item_slot(key: &str, value: &[u8], version: u32) -> Vec<u8> {
    let header = ItemHeader {
        allocated: value.len() as u32,
        used: value.len() as u32,
        version,
        checksum: checksum(value),
        key_len: key.len() as u32,
    };
    let mut slot = header.encode().to_vec();
    slot.extend_from_slice(key.as_bytes());
    slot.extend_from_slice(value);
    slot
}

fn free_slot(size: u32) -> Vec<u8> {
    let mut slot = FreeHeader::new(size).encode().to_vec();
    slot.resize(size as usize, 0);
    slot
}

/// Write a store file made of the given slots, back to back
fn write_store(dir: &Path, slots: &[Vec<u8>]) {
    let mut data = StoreHeader::default().encode().to_vec();
    for slot in slots {
        data.extend_from_slice(slot);
    }
    fs::write(store_path(dir), data).unwrap();
}

fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

fn value_of(store: &ObjectStore, key: &str) -> Vec<u8> {
    store.read(key, 0).unwrap().into_value().unwrap()
}

// =============================================================================
// Interrupted Update Tests
// =============================================================================

#[test]
fn test_newer_copy_wins_after_interrupted_relocation() {
    let temp_dir = TempDir::new().unwrap();
    write_store(
        temp_dir.path(),
        &[item_slot("/k", b"old", 1), item_slot("/k", b"new", 2), free_slot(1000)],
    );

    let store = open(temp_dir.path(), false).unwrap();

    assert_eq!(
        store.read("/k", 0).unwrap(),
        ReadResult::NewData { value: b"new".to_vec(), version: 2 }
    );
    let report = store.load_report().unwrap();
    assert_eq!(report.duplicates_resolved, 1);
    assert_eq!(store.object_count().unwrap(), 1);
    assert!(store.validate(None).unwrap().is_clean());
}

#[test]
fn test_newer_copy_wins_when_it_comes_first() {
    let temp_dir = TempDir::new().unwrap();
    write_store(
        temp_dir.path(),
        &[item_slot("/k", b"new", 5), item_slot("/k", b"old", 4), free_slot(1000)],
    );

    let store = open(temp_dir.path(), false).unwrap();

    assert_eq!(value_of(&store, "/k"), b"new");
    assert_eq!(store.key_exists("/k").unwrap(), Some(5));
    assert!(store.validate(None).unwrap().is_clean());
    store.close().unwrap();

    // The stale copy was rewritten as free space, the next open is clean
    let store = open(temp_dir.path(), false).unwrap();
    assert!(store.load_report().unwrap().is_clean());
    assert_eq!(store.stats().unwrap().free_slots, 2);
}

#[test]
fn test_interrupted_split_leaves_one_slot() {
    let temp_dir = TempDir::new().unwrap();

    // The tail header of a split was written, the original was not shrunk
    let mut slot = free_slot(2000);
    slot[500..512].copy_from_slice(&FreeHeader::new(1500).encode());
    write_store(temp_dir.path(), &[slot]);

    let store = open(temp_dir.path(), false).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.free_slots, 1);
    assert_eq!(stats.free_bytes, 2000);
    assert!(store.validate(None).unwrap().is_clean());

    store.add("/after", b"ok", 0).unwrap();
    assert_eq!(value_of(&store, "/after"), b"ok");
}

// =============================================================================
// Unclean Shutdown Tests
// =============================================================================

#[test]
fn test_acknowledged_writes_survive_missing_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open(temp_dir.path(), false).unwrap();
        store.add("/a", b"alpha", 0).unwrap();
        store.add("/b", b"beta", 0).unwrap();
        store.update("/a", b"alpha, longer than before").unwrap();
        store.delete("/b").unwrap();
        // Skip close and drop entirely
        std::mem::forget(store);
    }

    let store = open(temp_dir.path(), false).unwrap();

    assert_eq!(value_of(&store, "/a"), b"alpha, longer than before");
    assert_eq!(store.key_exists("/b").unwrap(), None);
    assert_eq!(store.index_version().unwrap(), 4);
    assert!(store.validate(None).unwrap().is_clean());
}

// =============================================================================
// Damage Tests
// =============================================================================

#[test]
fn test_damaged_value_needs_recovery_mode() {
    let temp_dir = TempDir::new().unwrap();
    write_store(
        temp_dir.path(),
        &[
            item_slot("/good", b"fine", 1),
            item_slot("/bad", b"soon broken", 3),
            item_slot("/also", b"fine too", 1),
            free_slot(100),
        ],
    );
    let bad_value = STORE_HEADER_SIZE as u64
        + (ITEM_HEADER_SIZE as u64 + 5 + 4)
        + ITEM_HEADER_SIZE as u64
        + 4;
    patch(&store_path(temp_dir.path()), bad_value, b"?");

    let err = open(temp_dir.path(), false).err().unwrap();
    assert!(err.is_format_error());

    let store = open(temp_dir.path(), true).unwrap();
    assert_eq!(store.all_keys().unwrap(), vec!["/also", "/good"]);
    assert_eq!(store.load_report().unwrap().slots_salvaged, 1);
    assert!(store.validate(None).unwrap().is_clean());
}

#[test]
fn test_short_file_needs_recovery_mode() {
    let temp_dir = TempDir::new().unwrap();

    // A free header claims more than the file holds (interrupted growth)
    let mut slot = free_slot(4000);
    slot.truncate(1000);
    write_store(temp_dir.path(), &[item_slot("/k", b"v", 1), slot]);

    let err = open(temp_dir.path(), false).err().unwrap();
    assert!(err.is_format_error());

    let store = open(temp_dir.path(), true).unwrap();
    assert_eq!(value_of(&store, "/k"), b"v");
    let stats = store.stats().unwrap();
    assert_eq!(stats.free_slots, 1);
    assert_eq!(stats.free_bytes, 1000);
    assert!(store.validate(None).unwrap().is_clean());
}

#[test]
fn test_garbage_tail_is_freed_in_recovery_mode() {
    let temp_dir = TempDir::new().unwrap();
    write_store(temp_dir.path(), &[item_slot("/k", b"v", 1), vec![0x5Au8; 300]]);

    assert!(open(temp_dir.path(), false).is_err());

    let store = open(temp_dir.path(), true).unwrap();
    assert_eq!(store.object_count().unwrap(), 1);
    assert_eq!(store.stats().unwrap().free_bytes, 300);

    // Freed space is usable
    store.add("/new", &[1u8; 200], 0).unwrap();
    assert!(store.validate(None).unwrap().is_clean());
}
