//! Compaction, backup and repair tests
//!
//! These tests verify:
//! - Explicit compaction squeezes out free space and keeps a backup
//! - Objects damaged on disk are dropped by compaction, the rest survive
//! - A fragmented store compacts itself when an add cannot be placed
//! - Backups rotate (newest in StoreBack1, previous in StoreBack2)
//! - A backup file opens as an ordinary store
//! - Offline repair salvages intact objects into a new store

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use objstore::storage::layout::{
    checksum, FreeHeader, ItemHeader, StoreHeader, COMPACT_ALIGN, ITEM_HEADER_SIZE,
    MIN_EXPAND, STORE_HEADER_SIZE,
};
use objstore::{repair, Config, ObjectStore};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const NAME: &str = "Comp";

fn open(dir: &Path, name: &str) -> ObjectStore {
    let config = Config::builder().data_dir(dir).store_name(name).build();
    ObjectStore::open(config).unwrap().0
}

fn file_in(dir: &Path, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", NAME, ext))
}

/// Copy a file into a fresh directory as `<name>.ObjStore` and open it
fn open_copy(file: &Path, name: &str) -> (TempDir, ObjectStore) {
    let temp_dir = TempDir::new().unwrap();
    fs::copy(file, temp_dir.path().join(format!("{}.ObjStore", name))).unwrap();
    let store = open(temp_dir.path(), name);
    (temp_dir, store)
}

fn value_of(store: &ObjectStore, key: &str) -> Vec<u8> {
    store.read(key, 0).unwrap().into_value().unwrap()
}

fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
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

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compact_removes_fragmentation() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    for i in 0..20 {
        store.add(&format!("/c/{:02}", i), &[i as u8; 100], 0).unwrap();
    }
    for i in (0..20).step_by(2) {
        store.delete(&format!("/c/{:02}", i)).unwrap();
    }
    assert!(store.stats().unwrap().free_slots > 1);

    store.compact().unwrap();

    let live = 10 * (ITEM_HEADER_SIZE as u64 + 5 + 100);
    let tail = (MIN_EXPAND as u64 / COMPACT_ALIGN as u64 + 1) * COMPACT_ALIGN as u64;
    let stats = store.stats().unwrap();
    assert_eq!(stats.objects, 10);
    assert_eq!(stats.free_slots, 1);
    assert_eq!(stats.free_bytes, tail);
    assert_eq!(stats.file_size, STORE_HEADER_SIZE as u64 + live + tail);

    for i in (1..20).step_by(2) {
        assert_eq!(value_of(&store, &format!("/c/{:02}", i)), vec![i as u8; 100]);
    }
    assert!(store.validate(None).unwrap().is_clean());
    assert!(file_in(temp_dir.path(), "StoreBack1").exists(), "old file kept as backup");
    assert!(!file_in(temp_dir.path(), "TmpStore").exists());
}

#[test]
fn test_compact_keeps_reserve_and_versions() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    store.add("/r", b"short", 100).unwrap();
    store.update("/r", b"still short").unwrap();

    store.compact().unwrap();

    assert_eq!(store.key_exists("/r").unwrap(), Some(2));
    let before = store.stats().unwrap();
    store.update("/r", &[7u8; 90]).unwrap();
    let after = store.stats().unwrap();
    assert_eq!(before.free_bytes, after.free_bytes, "grew inside its reserve");
}

#[test]
fn test_compact_drops_damaged_object() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    store.add("/good", b"fine", 0).unwrap();
    store.add("/bad", b"soon broken", 0).unwrap();
    store.add("/last", b"also fine", 0).unwrap();

    // Damage the second value behind the open store's back
    let bad_value = STORE_HEADER_SIZE as u64
        + (ITEM_HEADER_SIZE as u64 + 5 + 4)
        + ITEM_HEADER_SIZE as u64
        + 4;
    patch(&file_in(temp_dir.path(), "ObjStore"), bad_value, b"?");

    store.compact().unwrap();

    assert_eq!(store.all_keys().unwrap(), vec!["/good", "/last"]);
    assert_eq!(value_of(&store, "/last"), b"also fine");
    let live = (ITEM_HEADER_SIZE as u64 + 5 + 4) + (ITEM_HEADER_SIZE as u64 + 5 + 9);
    let tail = (MIN_EXPAND as u64 / COMPACT_ALIGN as u64 + 1) * COMPACT_ALIGN as u64;
    assert_eq!(store.stats().unwrap().file_size, STORE_HEADER_SIZE as u64 + live + tail);
    assert!(store.validate(None).unwrap().is_clean());

    // The damaged copy only lives on in the backup, which needs recovery mode
    let restore_dir = TempDir::new().unwrap();
    fs::copy(
        file_in(temp_dir.path(), "StoreBack1"),
        restore_dir.path().join("Old.ObjStore"),
    )
    .unwrap();
    let config = Config::builder()
        .data_dir(restore_dir.path())
        .store_name("Old")
        .build();
    assert!(ObjectStore::open(config).err().unwrap().is_format_error());
}

#[test]
fn test_compacting_twice_changes_nothing_but_offsets() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    for i in 0..10 {
        store.add(&format!("/i/{}", i), format!("value-{}", i).as_bytes(), i * 3).unwrap();
    }

    store.compact().unwrap();
    let first = store.stats().unwrap();
    store.compact().unwrap();
    let second = store.stats().unwrap();

    assert_eq!(first.file_size, second.file_size);
    assert_eq!(first.free_bytes, second.free_bytes);
    for i in 0..10 {
        assert_eq!(value_of(&store, &format!("/i/{}", i)), format!("value-{}", i).into_bytes());
    }
    assert!(store.validate(None).unwrap().is_clean());
}

#[test]
fn test_fragmented_store_compacts_on_add() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);

    // 100 slots of 1032 bytes, then free every other one
    for i in 0..100 {
        store.add(&format!("/obj/{:03}", i), &[1u8; 1000], 0).unwrap();
    }
    for i in (0..100).step_by(2) {
        store.delete(&format!("/obj/{:03}", i)).unwrap();
    }
    let fragmented = store.stats().unwrap();
    assert_eq!(fragmented.free_slots, 51);
    assert!(fragmented.largest_free < 30_028);

    store.add("/big", &[2u8; 30_000], 0).unwrap();

    // The old file became the backup and the new one has a single tail
    assert!(file_in(temp_dir.path(), "StoreBack1").exists());
    let stats = store.stats().unwrap();
    assert_eq!(stats.objects, 51);
    assert_eq!(stats.file_size, 532 + 50 * 1032 + 98_304);
    assert_eq!(stats.free_slots, 1);
    assert_eq!(value_of(&store, "/big"), vec![2u8; 30_000]);
    assert_eq!(value_of(&store, "/obj/099"), vec![1u8; 1000]);
    assert!(store.validate(None).unwrap().is_clean());
}

// =============================================================================
// Backup Tests
// =============================================================================

#[test]
fn test_backup_rotates_and_opens_as_store() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    assert_eq!(store.last_backup().unwrap(), 0);

    store.add("/a", b"first", 0).unwrap();
    store.backup().unwrap();
    store.add("/b", b"second", 0).unwrap();
    store.backup().unwrap();

    let stamp = store.last_backup().unwrap();
    assert!(stamp > 0);
    let back1 = file_in(temp_dir.path(), "StoreBack1");
    let back2 = file_in(temp_dir.path(), "StoreBack2");
    assert!(back1.exists());
    assert!(back2.exists());

    let (_d1, newest) = open_copy(&back1, "Restore");
    assert_eq!(newest.all_keys().unwrap(), vec!["/a", "/b"]);
    assert_eq!(value_of(&newest, "/b"), b"second");
    assert_eq!(newest.stats().unwrap().free_slots, 0);
    assert!(newest.validate(None).unwrap().is_clean());

    let (_d2, previous) = open_copy(&back2, "Restore");
    assert_eq!(previous.all_keys().unwrap(), vec!["/a"]);

    // The live store is untouched and remembers the backup time
    assert_eq!(store.object_count().unwrap(), 2);
    store.close().unwrap();
    let store = open(temp_dir.path(), NAME);
    assert_eq!(store.last_backup().unwrap(), stamp);
}

#[test]
fn test_backup_does_not_bump_index_version() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    store.add("/a", b"1", 0).unwrap();
    let version = store.index_version().unwrap();

    store.backup().unwrap();

    assert_eq!(store.index_version().unwrap(), version);
}

// =============================================================================
// Repair Tests
// =============================================================================

#[test]
fn test_repair_skips_damaged_objects() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path(), NAME);
    store.add("/r/one", b"1111", 0).unwrap();
    store.add("/r/two", b"2222", 0).unwrap();
    store.add("/r/thr", b"3333", 0).unwrap();
    store.close().unwrap();

    let src = file_in(temp_dir.path(), "ObjStore");
    let mut data = fs::read(&src).unwrap();
    let second_value = STORE_HEADER_SIZE as usize + (ITEM_HEADER_SIZE as usize + 10) + ITEM_HEADER_SIZE as usize + 6;
    data[second_value] ^= 0xFF;
    fs::write(&src, &data).unwrap();

    let dst = temp_dir.path().join("Repaired.ObjStore");
    let report = repair(&src, &dst, true).unwrap();

    assert_eq!(report.recovered, 2);
    assert_eq!(report.damaged_items, 1);
    assert!(report.skipped_bytes > 0);

    let repaired = open(temp_dir.path(), "Repaired");
    assert_eq!(repaired.all_keys().unwrap(), vec!["/r/one", "/r/thr"]);
    assert_eq!(value_of(&repaired, "/r/thr"), b"3333");
    assert!(repaired.validate(None).unwrap().is_clean());
}

#[test]
fn test_repair_keeps_newest_copy() {
    let temp_dir = TempDir::new().unwrap();
    let src = temp_dir.path().join("Dup.ObjStore");
    let mut data = StoreHeader::default().encode().to_vec();
    data.extend(item_slot("/k", b"v7", 7));
    data.extend(item_slot("/K", b"v9", 9));
    data.extend(item_slot("/k", b"v8", 8));
    let mut tail = FreeHeader::new(64).encode().to_vec();
    tail.resize(64, 0);
    data.extend(tail);
    fs::write(&src, data).unwrap();

    let dst = temp_dir.path().join("Fixed.ObjStore");
    let report = repair(&src, &dst, false).unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.duplicates_dropped, 2);
    assert_eq!(report.skipped_bytes, 0);

    let fixed = open(temp_dir.path(), "Fixed");
    assert_eq!(fixed.key_exists("/K").unwrap(), Some(9));
    assert_eq!(value_of(&fixed, "/K"), b"v9");
}
