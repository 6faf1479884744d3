//! Storage Module
//!
//! The on-disk half of the store: byte layout of every header, a thin file
//! wrapper with positional reads/writes, and the free list that hands out
//! byte ranges inside the file.
//!
//! ## File Format (all integers little-endian)
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Store Header (532 bytes)                                     │
//! │   Magic1 (4) | LastBackup: u64 (8) | IndexVersion: u32 (4)   │
//! │   Reserved (512) | Magic2 (4)                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slots (repeated until end of file, no gaps)                  │
//! │                                                              │
//! │   Item slot:                                                 │
//! │   ┌───────┬─────┬────┬───────┬─────┬──────┬─────┬───────┬───┐│
//! │   │Magic  │Alloc│Used│Version│CRC32│KeyLen│ Key │ Value │Pad││
//! │   └───────┴─────┴────┴───────┴─────┴──────┴─────┴───────┴───┘│
//! │     (value = Used bytes, Value + Pad = Alloc bytes)          │
//! │                                                              │
//! │   Free slot:                                                 │
//! │   ┌───────┬──────┬────────────────┬──────────────┐           │
//! │   │Magic  │ Size │ Size ^ FreeMark│ (free bytes) │           │
//! │   └───────┴──────┴────────────────┴──────────────┘           │
//! │     (Size counts the whole slot, header included)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod layout;
pub mod file;
pub mod freelist;

pub use file::StoreFile;
pub use freelist::{FreeList, FreeListItem, FreeSlot};
pub use layout::{FreeHeader, ItemHeader, StoreHeader};
