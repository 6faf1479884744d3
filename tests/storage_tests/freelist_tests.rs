//! Tests for the free list
//!
//! These tests verify:
//! - Near-exact slots are handed out whole
//! - Best-fit splitting and the headers it leaves on disk
//! - Coalescing on give-back (both sides, one side, disabled)
//! - Merging runs of adjacent slots
//! - Internal errors for engine misuse

use std::path::PathBuf;

use objstore::storage::layout::{FreeHeader, FREE_HEADER_SIZE, MIN_FREE_SLOT};
use objstore::storage::{FreeList, FreeListItem, FreeSlot, StoreFile};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_file(len: u64) -> (TempDir, StoreFile) {
    let temp_dir = TempDir::new().unwrap();
    let path: PathBuf = temp_dir.path().join("free.bin");
    let mut file = StoreFile::create(&path).unwrap();
    file.set_len(len).unwrap();
    (temp_dir, file)
}

fn disk_size(file: &mut StoreFile, offset: u32) -> u32 {
    let mut raw = [0u8; FREE_HEADER_SIZE as usize];
    file.read_at(offset as u64, &mut raw).unwrap();
    FreeHeader::decode(&raw, offset as u64).unwrap().size
}

fn entries(list: &FreeList) -> Vec<(u32, u32)> {
    list.iter().map(|e| (e.offset, e.size)).collect()
}

// =============================================================================
// Find Tests
// =============================================================================

#[test]
fn test_find_in_empty_list() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    assert_eq!(list.find_free_space(&mut file, 100).unwrap(), None);
}

#[test]
fn test_near_exact_slot_taken_whole() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 120, false).unwrap();

    let slot = list.find_free_space(&mut file, 100).unwrap().unwrap();

    assert_eq!(slot, FreeSlot { offset: 532, size: 120 });
    assert_eq!(entries(&list), vec![(532, 120)], "not split, still listed");
}

#[test]
fn test_smallest_fitting_slot_is_split() {
    let (_temp, mut file) = setup_file(8192);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 1000, false).unwrap();
    list.give_back(&mut file, 1600, 300, false).unwrap();
    list.give_back(&mut file, 2000, 50, false).unwrap();

    let slot = list.find_free_space(&mut file, 100).unwrap().unwrap();

    assert_eq!(slot, FreeSlot { offset: 1600, size: 100 });
    assert_eq!(
        entries(&list),
        vec![(532, 1000), (1600, 100), (1700, 200), (2000, 50)]
    );
    assert_eq!(disk_size(&mut file, 1600), 100);
    assert_eq!(disk_size(&mut file, 1700), 200);
}

#[test]
fn test_split_never_leaves_tiny_tail() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 100 + MIN_FREE_SLOT + 1, false).unwrap();

    let slot = list.find_free_space(&mut file, 100).unwrap().unwrap();

    assert_eq!(slot.size, 100);
    for entry in list.iter() {
        assert!(entry.size >= MIN_FREE_SLOT);
    }
}

// =============================================================================
// Give-back Tests
// =============================================================================

#[test]
fn test_give_back_merges_both_neighbours() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 100, false).unwrap();
    list.give_back(&mut file, 732, 100, false).unwrap();

    let index = list.give_back(&mut file, 632, 100, true).unwrap();

    assert_eq!(index, 0);
    assert_eq!(entries(&list), vec![(532, 300)]);
    assert_eq!(disk_size(&mut file, 532), 300);
}

#[test]
fn test_give_back_merges_following_slot() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 800, 200, false).unwrap();

    list.give_back(&mut file, 700, 100, true).unwrap();

    assert_eq!(entries(&list), vec![(700, 300)]);
    assert_eq!(disk_size(&mut file, 700), 300);
}

#[test]
fn test_give_back_without_coalescing() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 100, false).unwrap();

    list.give_back(&mut file, 632, 100, false).unwrap();

    assert_eq!(entries(&list), vec![(532, 100), (632, 100)]);
    assert_eq!(disk_size(&mut file, 532), 100);
    assert_eq!(disk_size(&mut file, 632), 100);
}

#[test]
fn test_give_back_below_minimum_is_internal() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();

    let err = list.give_back(&mut file, 532, MIN_FREE_SLOT - 1, true).unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn test_give_back_overlap_is_internal() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 200, false).unwrap();

    let err = list.give_back(&mut file, 600, 100, true).unwrap_err();
    assert!(err.is_internal());
}

// =============================================================================
// Bookkeeping Tests
// =============================================================================

#[test]
fn test_coalesce_adjacent_runs() {
    let (_temp, mut file) = setup_file(4096);
    let mut list = FreeList::new();
    list.give_back(&mut file, 532, 100, false).unwrap();
    list.give_back(&mut file, 632, 100, false).unwrap();
    list.give_back(&mut file, 732, 100, false).unwrap();
    list.give_back(&mut file, 1000, 100, false).unwrap();

    let merges = list.coalesce_adjacent(&mut file).unwrap();

    assert_eq!(merges, 2);
    assert_eq!(entries(&list), vec![(532, 300), (1000, 100)]);
    assert_eq!(disk_size(&mut file, 532), 300);
    assert_eq!(list.total_free(), 400);
    assert_eq!(list.largest(), 300);
}

#[test]
fn test_remove_unknown_offset_is_internal() {
    let mut list = FreeList::new();
    list.insert_sorted(FreeListItem::new(532, 100));

    assert!(list.remove_at_offset(600).unwrap_err().is_internal());
    assert_eq!(list.remove_at_offset(532).unwrap(), FreeListItem::new(532, 100));
    assert!(list.is_empty());
}
