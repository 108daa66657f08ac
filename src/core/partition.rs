use crate::core::constants::*;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::errors::*;
use crate::core::index::{IndexCursor, IndexEntry, IndexOrder, KeyLock, SortedIndexSet};
use crate::core::txn_index_cursor::TxnIndexCursor;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A backing store the transaction engine reads from and flushes into.
///
/// Only the flush path writes through this trait; every transactional read goes
/// through the table and index wrappers, which overlay in-flight changes.
pub trait Partition: Send + Sync {
    fn suffix(&self) -> &Dn;

    fn get(&self, id: EntryId) -> Result<Option<Entry>>;

    fn put(&self, id: EntryId, entry: Entry) -> Result<()>;

    fn remove(&self, id: EntryId) -> Result<Option<Entry>>;

    /// Adds a tuple to both the forward and the reverse index of an attribute.
    fn index_add(&self, attribute_oid: &str, entry: IndexEntry) -> Result<()>;

    fn index_remove(&self, attribute_oid: &str, entry: &IndexEntry) -> Result<()>;

    fn index_cursor(
        &self,
        attribute_oid: &str,
        order: IndexOrder,
        lock: Option<KeyLock>,
    ) -> Result<Box<dyn IndexCursor>>;

    fn next_entry_id(&self) -> EntryId;

    fn sync(&self) -> Result<()>;
}

#[derive(Clone)]
struct AttributeIndex {
    forward: Arc<SortedIndexSet>,
    reverse: Arc<SortedIndexSet>,
}

impl AttributeIndex {
    fn new() -> Self {
        Self {
            forward: Arc::new(SortedIndexSet::new(IndexOrder::Forward)),
            reverse: Arc::new(SortedIndexSet::new(IndexOrder::Reverse)),
        }
    }
}

#[derive(Default)]
struct PartitionState {
    entries: BTreeMap<EntryId, Entry>,
    indexes: HashMap<String, AttributeIndex>,
}

/// In-memory partition.
///
/// Index sets are copy-on-write, so a cursor opened before a flush keeps
/// walking the version it started on.
pub struct MemoryPartition {
    suffix: Dn,
    state: RwLock<PartitionState>,
    next_id: AtomicU64,
    syncs: AtomicU64,
}

impl MemoryPartition {
    pub fn new(suffix: Dn) -> Self {
        Self {
            suffix,
            state: RwLock::new(PartitionState::default()),
            next_id: AtomicU64::new(1),
            syncs: AtomicU64::new(0),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().recover_poison().entries.len()
    }

    pub fn index_contains(&self, attribute_oid: &str, entry: &IndexEntry) -> bool {
        let state = self.state.read().recover_poison();
        state
            .indexes
            .get(&attribute_oid.to_lowercase())
            .map(|index| index.forward.contains(entry))
            .unwrap_or(false)
    }

    /// Number of `sync` calls so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl Partition for MemoryPartition {
    fn suffix(&self) -> &Dn {
        &self.suffix
    }

    fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        let state = self.state.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        Ok(state.entries.get(&id).cloned())
    }

    fn put(&self, id: EntryId, entry: Entry) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        state.entries.insert(id, entry);
        // keep ids handed out by next_entry_id ahead of anything replayed
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, id: EntryId) -> Result<Option<Entry>> {
        let mut state = self.state.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        Ok(state.entries.remove(&id))
    }

    fn index_add(&self, attribute_oid: &str, entry: IndexEntry) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        let index = state
            .indexes
            .entry(attribute_oid.to_lowercase())
            .or_insert_with(AttributeIndex::new);
        Arc::make_mut(&mut index.forward).insert(entry.clone());
        Arc::make_mut(&mut index.reverse).insert(entry);
        Ok(())
    }

    fn index_remove(&self, attribute_oid: &str, entry: &IndexEntry) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        if let Some(index) = state.indexes.get_mut(&attribute_oid.to_lowercase()) {
            Arc::make_mut(&mut index.forward).remove(entry);
            Arc::make_mut(&mut index.reverse).remove(entry);
        }
        Ok(())
    }

    fn index_cursor(
        &self,
        attribute_oid: &str,
        order: IndexOrder,
        lock: Option<KeyLock>,
    ) -> Result<Box<dyn IndexCursor>> {
        let state = self.state.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "partition.state".to_string() })?;
        let set = match state.indexes.get(&attribute_oid.to_lowercase()) {
            Some(index) => match order {
                IndexOrder::Forward => index.forward.clone(),
                IndexOrder::Reverse => index.reverse.clone(),
            },
            None => Arc::new(SortedIndexSet::new(order)),
        };
        drop(state);
        Ok(Box::new(TxnIndexCursor::new(set, lock)?))
    }

    fn next_entry_id(&self) -> EntryId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Partitions by suffix DN.
#[derive(Default)]
pub struct PartitionRegistry {
    partitions: RwLock<HashMap<Dn, Arc<dyn Partition>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: Arc<dyn Partition>) -> Result<()> {
        let mut partitions = self.partitions.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "registry.partitions".to_string() })?;
        let suffix = partition.suffix().clone();
        if partitions.contains_key(&suffix) {
            return Err(Error::illegal_state(format!("partition '{}' already registered", suffix)));
        }
        partitions.insert(suffix, partition);
        Ok(())
    }

    pub fn get(&self, suffix: &Dn) -> Result<Arc<dyn Partition>> {
        let partitions = self.partitions.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "registry.partitions".to_string() })?;
        partitions
            .get(suffix)
            .cloned()
            .ok_or_else(|| Error::PartitionNotFound { dn: suffix.to_string() })
    }

    /// The partition with the longest suffix containing `dn`.
    pub fn partition_for(&self, dn: &Dn) -> Result<Arc<dyn Partition>> {
        let partitions = self.partitions.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "registry.partitions".to_string() })?;
        partitions
            .iter()
            .filter(|(suffix, _)| dn.is_descendant_of(suffix))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, partition)| partition.clone())
            .ok_or_else(|| Error::PartitionNotFound { dn: dn.to_string() })
    }

    pub fn suffixes(&self) -> Vec<Dn> {
        self.partitions.read().recover_poison().keys().cloned().collect()
    }
}
