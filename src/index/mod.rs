//! Index Module
//!
//! In-memory view of the store file: one `StoreItem` per live object, keyed
//! by its path, plus the builder that reconstructs the index (and the free
//! list) by scanning the file from front to back.
//!
//! ## Key Structure
//! ```text
//!   /settings/ui/window
//!   └────┬─────┘└──┬──┘
//!      scope      name
//! ```
//! The scope keeps its trailing '/', so scope queries never confuse
//! `/a/b/` with `/a/bc/`.

mod item;
mod builder;

pub use builder::{build_index, LoadReport, LoadedIndex};
pub use item::{fold_key, normalize_scope, ItemIndex, StoreItem};
