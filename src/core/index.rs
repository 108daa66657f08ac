use crate::core::constants::EntryId;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One `(value, id)` tuple of an attribute index.
///
/// The same tuple lives in the forward index (ordered by value, then id) and in
/// the reverse index (ordered by id, then value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub value: String,
    pub id: EntryId,
}

impl IndexEntry {
    pub fn new(value: impl Into<String>, id: EntryId) -> Self {
        Self {
            value: value.into(),
            id,
        }
    }
}

/// Which side of an attribute index a cursor walks; doubles as the comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexOrder {
    Forward,
    Reverse,
}

impl IndexOrder {
    pub fn from_forward(is_forward: bool) -> Self {
        if is_forward {
            IndexOrder::Forward
        } else {
            IndexOrder::Reverse
        }
    }

    pub fn compare(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        match self {
            IndexOrder::Forward => a.value.cmp(&b.value).then(a.id.cmp(&b.id)),
            IndexOrder::Reverse => a.id.cmp(&b.id).then_with(|| a.value.cmp(&b.value)),
        }
    }

    /// Compares only the leading component: value for forward, id for reverse.
    pub fn compare_key(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        match self {
            IndexOrder::Forward => a.value.cmp(&b.value),
            IndexOrder::Reverse => a.id.cmp(&b.id),
        }
    }
}

/// Restricts a cursor to the entries sharing one leading key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyLock {
    /// Forward index: only entries with this value.
    Value(String),
    /// Reverse index: only entries of this entry id.
    Id(EntryId),
}

impl KeyLock {
    pub fn from_keys(only_value_key: Option<String>, only_id_key: Option<EntryId>) -> Option<KeyLock> {
        match (only_value_key, only_id_key) {
            (Some(value), _) => Some(KeyLock::Value(value)),
            (None, Some(id)) => Some(KeyLock::Id(id)),
            (None, None) => None,
        }
    }

    pub fn validate(&self, order: IndexOrder) -> Result<()> {
        match (self, order) {
            (KeyLock::Value(_), IndexOrder::Forward) | (KeyLock::Id(_), IndexOrder::Reverse) => Ok(()),
            (lock, order) => Err(Error::InvalidIndexLock {
                details: format!("{:?} cannot lock a {:?} index", lock, order),
            }),
        }
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        match self {
            KeyLock::Value(value) => &entry.value == value,
            KeyLock::Id(id) => entry.id == *id,
        }
    }

    /// A search entry whose leading key equals the locked key.
    pub fn search_entry(&self) -> IndexEntry {
        match self {
            KeyLock::Value(value) => IndexEntry::new(value.clone(), 0),
            KeyLock::Id(id) => IndexEntry::new(String::new(), *id),
        }
    }
}

/// Navigable sorted set of index entries under one `IndexOrder`.
///
/// Backed by a sorted vector: positioning is a binary search, inserts shift.
/// Sets are shared behind `Arc` and copied on write, so an open cursor keeps
/// iterating the version it was opened on.
#[derive(Debug, Clone)]
pub struct SortedIndexSet {
    order: IndexOrder,
    entries: Vec<IndexEntry>,
}

impl SortedIndexSet {
    pub fn new(order: IndexOrder) -> Self {
        Self {
            order,
            entries: Vec::new(),
        }
    }

    pub fn order(&self) -> IndexOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: IndexEntry) -> bool {
        match self.entries.binary_search_by(|e| self.order.compare(e, &entry)) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, entry);
                true
            }
        }
    }

    pub fn remove(&mut self, entry: &IndexEntry) -> bool {
        match self.entries.binary_search_by(|e| self.order.compare(e, entry)) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, entry: &IndexEntry) -> bool {
        self.entries
            .binary_search_by(|e| self.order.compare(e, entry))
            .is_ok()
    }

    pub fn get(&self, pos: usize) -> Option<&IndexEntry> {
        self.entries.get(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Index of the first entry `>= target`.
    pub fn lower_bound(&self, target: &IndexEntry) -> usize {
        self.entries
            .partition_point(|e| self.order.compare(e, target) == Ordering::Less)
    }

    /// Index of the first entry `> target`.
    pub fn upper_bound(&self, target: &IndexEntry) -> usize {
        self.entries
            .partition_point(|e| self.order.compare(e, target) != Ordering::Greater)
    }

    /// Index of the first entry whose leading key is `>=` the target's.
    pub fn key_lower_bound(&self, target: &IndexEntry) -> usize {
        self.entries
            .partition_point(|e| self.order.compare_key(e, target) == Ordering::Less)
    }

    /// Index of the first entry whose leading key is `>` the target's.
    pub fn key_upper_bound(&self, target: &IndexEntry) -> usize {
        self.entries
            .partition_point(|e| self.order.compare_key(e, target) != Ordering::Greater)
    }

    /// `[start, end)` of the entries a lock admits; the whole set without one.
    pub fn lock_range(&self, lock: Option<&KeyLock>) -> (usize, usize) {
        match lock {
            None => (0, self.entries.len()),
            Some(lock) => {
                let target = lock.search_entry();
                (self.key_lower_bound(&target), self.key_upper_bound(&target))
            }
        }
    }
}

/// Ordered cursor over index entries.
///
/// A cursor sits in a gap between entries. `next`/`previous` move across one
/// entry and return whether one was there; `get` returns the entry last moved
/// across. Positioning calls leave the cursor unpositioned until the next move.
pub trait IndexCursor: Send {
    fn before_first(&mut self) -> Result<()>;

    fn after_last(&mut self) -> Result<()>;

    /// Next `next()` returns the first entry `>= entry`.
    fn before(&mut self, entry: &IndexEntry) -> Result<()>;

    /// Next `next()` returns the first entry `> entry`.
    fn after(&mut self, entry: &IndexEntry) -> Result<()>;

    /// Like `before`, but only the leading key of `target` counts: the cursor
    /// lands before every entry sharing that key.
    fn before_key(&mut self, target: &IndexEntry) -> Result<()>;

    /// Skips past every entry sharing the leading key of `target`.
    fn after_key(&mut self, target: &IndexEntry) -> Result<()>;

    fn next(&mut self) -> Result<bool>;

    fn previous(&mut self) -> Result<bool>;

    fn get(&self) -> Result<IndexEntry>;

    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Drains a cursor forward from its current position.
pub fn collect_forward(cursor: &mut dyn IndexCursor) -> Result<Vec<IndexEntry>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.push(cursor.get()?);
    }
    Ok(out)
}

/// Drains a cursor backward from its current position.
pub fn collect_backward(cursor: &mut dyn IndexCursor) -> Result<Vec<IndexEntry>> {
    let mut out = Vec::new();
    while cursor.previous()? {
        out.push(cursor.get()?);
    }
    Ok(out)
}
