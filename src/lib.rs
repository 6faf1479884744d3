//! # objstore
//!
//! An embedded, single-file object store:
//! - Values are byte blobs addressed by slash-delimited path keys
//! - Every object carries a version and a CRC-32 of its value
//! - Free space is managed with an on-disk free list
//! - Compaction, rotating backups and crash recovery built in
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ObjectStore (facade)                       │
//! │      key checks, reusable buffers, one store-wide lock      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     StoreEngine                             │
//! │   add / update / delete / read / compact / backup / validate│
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐               ┌──────────────────┐
//!   │   Item Index    │               │    Free List     │
//!   │ (Index Builder) │               │ (split / merge)  │
//!   └────────┬────────┘               └────────┬─────────┘
//!            │                                  │
//!            └────────────────┬─────────────────┘
//!                             ▼
//!                   ┌──────────────────┐
//!                   │  <name>.ObjStore │
//!                   │  (binary layout) │
//!                   └──────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;
pub mod index;
pub mod engine;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, StoreFlags};
pub use engine::{repair, RepairReport, StoreStats, ValidationReport};
pub use error::{Result, StoreError};
pub use index::LoadReport;
pub use store::{ObjectStore, ReadResult};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of objstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
