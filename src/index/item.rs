//! Store items and the key index

use std::collections::btree_map::{BTreeMap, Entry};
use std::ops::Bound;

use crate::storage::layout::ITEM_HEADER_SIZE;

/// In-memory entry for one live object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreItem {
    /// File offset of the item header
    pub offset: u32,
    /// Bytes of the current value
    pub used: u32,
    /// Bytes reserved for the value
    pub allocated: u32,
    pub version: u32,
    /// Key as stored on disk
    pub key: String,
    /// Length of the scope prefix, trailing '/' included
    scope_len: usize,
}

impl StoreItem {
    pub fn new(key: String, offset: u32, used: u32, allocated: u32, version: u32) -> Self {
        let scope_len = key.rfind('/').map(|i| i + 1).unwrap_or(0);
        Self {
            offset,
            used,
            allocated,
            version,
            key,
            scope_len,
        }
    }

    /// Everything up to and including the last '/'
    pub fn scope(&self) -> &str {
        &self.key[..self.scope_len]
    }

    /// Everything after the last '/'
    pub fn name(&self) -> &str {
        &self.key[self.scope_len..]
    }

    pub fn key_len(&self) -> u32 {
        self.key.len() as u32
    }

    /// Whole slot: header + key + allocated value bytes
    pub fn slot_size(&self) -> u32 {
        ITEM_HEADER_SIZE + self.key_len() + self.allocated
    }

    /// Slot size needed to hold `value_len` bytes under this key
    pub fn storage_required(&self, value_len: u32) -> u64 {
        ITEM_HEADER_SIZE as u64 + self.key_len() as u64 + value_len as u64
    }
}

/// Comparison form of a key. Case folding is ASCII-only so byte positions
/// in the folded key line up with the original.
pub fn fold_key(key: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        key.to_string()
    } else {
        key.to_ascii_lowercase()
    }
}

/// Scope with exactly one trailing '/'
pub fn normalize_scope(scope: &str) -> String {
    let mut scope = scope.trim_end_matches('/').to_string();
    scope.push('/');
    scope
}

/// Key → item map honouring the store's case sensitivity
#[derive(Debug, Clone)]
pub struct ItemIndex {
    case_sensitive: bool,
    items: BTreeMap<String, StoreItem>,
}

impl ItemIndex {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            items: BTreeMap::new(),
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&StoreItem> {
        self.items.get(&self.fold(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut StoreItem> {
        let folded = self.fold(key);
        self.items.get_mut(&folded)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(&self.fold(key))
    }

    /// Insert an item, handing back whatever was stored under the same key
    pub fn insert(&mut self, item: StoreItem) -> Option<StoreItem> {
        let folded = self.fold(&item.key);
        match self.items.entry(folded) {
            Entry::Occupied(mut slot) => Some(std::mem::replace(slot.get_mut(), item)),
            Entry::Vacant(slot) => {
                slot.insert(item);
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<StoreItem> {
        let folded = self.fold(key);
        self.items.remove(&folded)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Items in key order
    pub fn iter(&self) -> impl Iterator<Item = &StoreItem> {
        self.items.values()
    }

    /// Items in file order
    pub fn by_offset(&self) -> Vec<&StoreItem> {
        let mut items: Vec<&StoreItem> = self.items.values().collect();
        items.sort_by_key(|item| item.offset);
        items
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.values().map(|item| item.key.clone()).collect()
    }

    // =========================================================================
    // Scope Queries
    // =========================================================================

    /// Objects whose scope is exactly `scope`
    pub fn objects_in_scope(&self, scope: &str) -> Vec<String> {
        let folded = self.fold(&normalize_scope(scope));
        self.under(&folded)
            .filter(|(k, item)| k.len() > folded.len() && item.scope_len == folded.len())
            .map(|(_, item)| item.key.clone())
            .collect()
    }

    /// Child scopes exactly one level below `scope` that directly hold an
    /// object, each with a trailing '/' and in the case it was stored with.
    ///
    /// Deeper scopes do not count, so `/a/b/c/y` alone gives `/a` no
    /// sub-scopes.
    pub fn sub_scopes(&self, scope: &str) -> Vec<String> {
        let folded = self.fold(&normalize_scope(scope));
        let mut seen: BTreeMap<String, String> = BTreeMap::new();

        for (k, item) in self.under(&folded) {
            let rest = &k[folded.len()..];
            match rest.find('/') {
                Some(slash) if folded.len() + slash + 1 == item.scope_len => {
                    seen.entry(k[..item.scope_len].to_string())
                        .or_insert_with(|| item.scope().to_string());
                }
                _ => {}
            }
        }

        seen.into_values().collect()
    }

    /// Every object at or below `scope`
    pub fn all_objects_under(&self, scope: &str) -> Vec<String> {
        let folded = self.fold(&normalize_scope(scope));
        self.under(&folded).map(|(_, item)| item.key.clone()).collect()
    }

    /// Every object named `name` at or below `scope`
    pub fn find_name_under(&self, name: &str, scope: &str) -> Vec<String> {
        let folded = self.fold(&normalize_scope(scope));
        let name = self.fold(name);
        self.under(&folded)
            .filter(|(_, item)| self.fold(item.name()) == name)
            .map(|(_, item)| item.key.clone())
            .collect()
    }

    fn under<'a>(&'a self, folded_prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a StoreItem)> + 'a {
        self.items
            .range::<str, _>((Bound::Included(folded_prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(folded_prefix))
    }

    fn fold(&self, key: &str) -> String {
        fold_key(key, self.case_sensitive)
    }
}
