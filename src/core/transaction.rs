use crate::core::constants::*;
use crate::core::dn::{Dn, DnSet};
use crate::core::entry::Entry;
use crate::core::errors::*;
use crate::core::index::{IndexEntry, IndexOrder, SortedIndexSet};
use crate::core::log_edit::{ChangeKind, DataChangeContainer, LogEdit, TxnStateChange, TxnStateKind};
use crate::core::metrics::Metrics;
use crate::core::partition::{Partition, PartitionRegistry};
use crate::core::wal::WriteAheadLog;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Initial,
    Read,
    Commit,
    Abort,
}

/// `(partition suffix, attribute oid)` of one index.
type IndexKey = (Dn, String);

#[derive(Default)]
struct ChangeSet {
    log_edits: Vec<DataChangeContainer>,
    forward_adds: HashMap<IndexKey, Arc<SortedIndexSet>>,
    reverse_adds: HashMap<IndexKey, Arc<SortedIndexSet>>,
    deletes: HashMap<IndexKey, HashSet<IndexEntry>>,
    read_set: Vec<DnSet>,
    write_set: Vec<DnSet>,
}

impl ChangeSet {
    fn record_index_change(&mut self, key: IndexKey, entry: &IndexEntry, kind: ChangeKind) {
        match kind {
            ChangeKind::Add => {
                Arc::make_mut(
                    self.forward_adds
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(SortedIndexSet::new(IndexOrder::Forward))),
                )
                .insert(entry.clone());
                Arc::make_mut(
                    self.reverse_adds
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(SortedIndexSet::new(IndexOrder::Reverse))),
                )
                .insert(entry.clone());
                if let Some(deleted) = self.deletes.get_mut(&key) {
                    deleted.remove(entry);
                }
            }
            ChangeKind::Delete => {
                if let Some(adds) = self.forward_adds.get_mut(&key) {
                    Arc::make_mut(adds).remove(entry);
                }
                if let Some(adds) = self.reverse_adds.get_mut(&key) {
                    Arc::make_mut(adds).remove(entry);
                }
                self.deletes.entry(key).or_default().insert(entry.clone());
            }
        }
    }
}

/// The shared half of a read-write transaction.
///
/// Lives behind an `Arc` in the committed queue and in every dependency list
/// that references it. Only the owning worker appends to the change set; other
/// transactions read it while merging.
pub struct ReadWriteTransaction {
    start_time: Lsn,
    commit_time: AtomicU64,
    ref_count: AtomicUsize,
    changes: RwLock<ChangeSet>,
}

impl ReadWriteTransaction {
    pub(crate) fn new(start_time: Lsn) -> Self {
        Self {
            start_time,
            commit_time: AtomicU64::new(UNKNOWN_LSN),
            ref_count: AtomicUsize::new(0),
            changes: RwLock::new(ChangeSet::default()),
        }
    }

    /// Queue sentinel: never written, committed at `UNKNOWN_LSN`.
    pub(crate) fn sentinel() -> Self {
        Self::new(UNKNOWN_LSN)
    }

    pub fn start_time(&self) -> Lsn {
        self.start_time
    }

    pub fn commit_time(&self) -> Lsn {
        self.commit_time.load(Ordering::SeqCst)
    }

    pub(crate) fn set_commit_time(&self, lsn: Lsn) {
        self.commit_time.store(lsn, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// False when the count is already zero.
    fn release_ref(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn dec_ref(&self) -> Result<()> {
        if self.release_ref() {
            return Ok(());
        }
        Err(Error::invariant(format!(
            "ref count of transaction committed at {} would go negative",
            self.commit_time()
        )))
    }

    pub fn log_edit_count(&self) -> usize {
        self.changes.read().recover_poison().log_edits.len()
    }

    /// Appends a logged container and folds its index changes into the
    /// per-index summaries.
    pub(crate) fn add_log_edit(&self, container: DataChangeContainer) -> Result<()> {
        let mut changes = self.changes.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn.changes".to_string() })?;
        for (attribute_oid, entry, kind) in container.index_changes() {
            let key = (container.partition_dn.clone(), attribute_oid.to_string());
            changes.record_index_change(key, entry, kind);
        }
        changes.log_edits.push(container);
        Ok(())
    }

    pub(crate) fn add_read(&self, dn_set: DnSet) {
        self.changes.write().recover_poison().read_set.push(dn_set);
    }

    /// A write is also a read of the same subtree.
    pub(crate) fn add_write(&self, dn_set: DnSet) {
        let mut changes = self.changes.write().recover_poison();
        changes.write_set.push(dn_set.clone());
        changes.read_set.push(dn_set);
    }

    /// Whether anything this transaction read was written by `committed`.
    pub fn has_conflict(&self, committed: &ReadWriteTransaction) -> bool {
        let mine = self.changes.read().recover_poison();
        let theirs = committed.changes.read().recover_poison();
        mine.read_set
            .iter()
            .any(|read| theirs.write_set.iter().any(|write| read.conflicts_with(write)))
    }

    /// Folds this transaction's changes to one entry onto `entry`.
    pub fn apply_updates_to_entry<'a>(
        &self,
        partition_dn: &Dn,
        entry_id: EntryId,
        mut entry: Option<Cow<'a, Entry>>,
    ) -> Option<Cow<'a, Entry>> {
        let changes = self.changes.read().recover_poison();
        for container in changes.log_edits.iter().filter(|c| c.touches(partition_dn, entry_id)) {
            entry = container.apply_to_entry(entry);
        }
        entry
    }

    /// Snapshot of this transaction's adds to one side of an index.
    pub fn index_adds(&self, partition_dn: &Dn, attribute_oid: &str, order: IndexOrder) -> Option<Arc<SortedIndexSet>> {
        let changes = self.changes.read().recover_poison();
        let key = (partition_dn.clone(), attribute_oid.to_lowercase());
        let adds = match order {
            IndexOrder::Forward => changes.forward_adds.get(&key),
            IndexOrder::Reverse => changes.reverse_adds.get(&key),
        };
        adds.filter(|set| !set.is_empty()).cloned()
    }

    pub fn has_index_deletes(&self, partition_dn: &Dn, attribute_oid: &str) -> bool {
        let changes = self.changes.read().recover_poison();
        let key = (partition_dn.clone(), attribute_oid.to_lowercase());
        changes.deletes.get(&key).map(|d| !d.is_empty()).unwrap_or(false)
    }

    pub fn is_index_entry_deleted(&self, partition_dn: &Dn, attribute_oid: &str, entry: &IndexEntry) -> bool {
        let changes = self.changes.read().recover_poison();
        let key = (partition_dn.clone(), attribute_oid.to_lowercase());
        changes.deletes.get(&key).map(|d| d.contains(entry)).unwrap_or(false)
    }

    /// Writes every logged container into its partition. Partitions written to
    /// are collected into `touched` for a later sync.
    pub(crate) fn flush_into(
        &self,
        registry: &PartitionRegistry,
        touched: &mut HashMap<Dn, Arc<dyn Partition>>,
    ) -> Result<()> {
        let changes = self.changes.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn.changes".to_string() })?;
        for container in &changes.log_edits {
            let partition = match touched.get(&container.partition_dn) {
                Some(partition) => partition.clone(),
                None => {
                    let partition = registry.get(&container.partition_dn)?;
                    touched.insert(container.partition_dn.clone(), partition.clone());
                    partition
                }
            };
            container.apply_to_partition(partition.as_ref())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReadWriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteTransaction")
            .field("start_time", &self.start_time)
            .field("commit_time", &self.commit_time())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Manager state a transaction handle needs to end itself when it is dropped
/// while still open.
pub(crate) struct Reclaim {
    pub(crate) wal: Arc<dyn WriteAheadLog>,
    pub(crate) active_read_write: Arc<AtomicUsize>,
    pub(crate) metrics: Arc<Metrics>,
}

impl Reclaim {
    /// Best effort; a missing abort marker only means recovery discards the
    /// transaction as unterminated.
    pub(crate) fn log_abort(&self, start_time: Lsn) {
        let marker = LogEdit::TxnState(TxnStateChange {
            txn_id: start_time,
            state: TxnStateKind::Abort,
        });
        if let Err(e) = marker.encode().and_then(|payload| self.wal.log(&payload, false)) {
            tracing::warn!(error = %e, start_time, "failed to log abort marker");
        }
    }
}

impl std::fmt::Debug for Reclaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaim")
            .field("active_read_write", &self.active_read_write.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum TxnKind {
    /// Nested read-only begins on the same context bump `reuse_count`.
    ReadOnly { reuse_count: usize },
    ReadWrite(Arc<ReadWriteTransaction>),
}

/// A worker's handle on its transaction.
///
/// The dependency list holds, oldest first, every committed but unflushed
/// transaction this one must merge over the partitions, plus the newest
/// committed transaction it pinned at begin. A read-write transaction is the
/// last element of its own list until it ends.
///
/// Dropping a handle that is still open aborts it, so a context lost to an
/// early return or a panic never keeps the flush pinned.
#[derive(Debug)]
pub struct Transaction {
    kind: TxnKind,
    state: TxnState,
    start_time: Lsn,
    dependencies: Vec<Arc<ReadWriteTransaction>>,
    reclaim: Option<Arc<Reclaim>>,
}

impl Transaction {
    pub(crate) fn read_only() -> Self {
        Self {
            kind: TxnKind::ReadOnly { reuse_count: 0 },
            state: TxnState::Initial,
            start_time: UNKNOWN_LSN,
            dependencies: Vec::new(),
            reclaim: None,
        }
    }

    pub(crate) fn read_write(shared: Arc<ReadWriteTransaction>) -> Self {
        Self {
            start_time: shared.start_time(),
            kind: TxnKind::ReadWrite(shared),
            state: TxnState::Initial,
            dependencies: Vec::new(),
            reclaim: None,
        }
    }

    pub(crate) fn with_reclaim(mut self, reclaim: Arc<Reclaim>) -> Self {
        self.reclaim = Some(reclaim);
        self
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, TxnKind::ReadOnly { .. })
    }

    pub fn start_time(&self) -> Lsn {
        self.start_time
    }

    /// `UNKNOWN_LSN` until a read-write transaction commits; always unknown for
    /// read-only ones.
    pub fn commit_time(&self) -> Lsn {
        match &self.kind {
            TxnKind::ReadWrite(shared) => shared.commit_time(),
            TxnKind::ReadOnly { .. } => UNKNOWN_LSN,
        }
    }

    pub fn read_write_txn(&self) -> Option<&Arc<ReadWriteTransaction>> {
        match &self.kind {
            TxnKind::ReadWrite(shared) => Some(shared),
            TxnKind::ReadOnly { .. } => None,
        }
    }

    pub fn dependencies(&self) -> &[Arc<ReadWriteTransaction>] {
        &self.dependencies
    }

    pub(crate) fn reuse_count(&self) -> usize {
        match self.kind {
            TxnKind::ReadOnly { reuse_count } => reuse_count,
            TxnKind::ReadWrite(_) => 0,
        }
    }

    pub(crate) fn reuse(&mut self) {
        if let TxnKind::ReadOnly { reuse_count } = &mut self.kind {
            *reuse_count += 1;
        }
    }

    pub(crate) fn release_reuse(&mut self) {
        if let TxnKind::ReadOnly { reuse_count } = &mut self.kind {
            *reuse_count = reuse_count.saturating_sub(1);
        }
    }

    pub(crate) fn dependencies_mut(&mut self) -> &mut Vec<Arc<ReadWriteTransaction>> {
        &mut self.dependencies
    }

    pub(crate) fn start_txn(&mut self, start_time: Lsn) -> Result<()> {
        if self.state != TxnState::Initial {
            return Err(Error::illegal_state(format!("cannot start a transaction in state {:?}", self.state)));
        }
        if self.is_read_only() {
            self.start_time = start_time;
        }
        self.state = TxnState::Read;
        Ok(())
    }

    pub(crate) fn commit_txn(&mut self, commit_time: Lsn) -> Result<()> {
        if self.state != TxnState::Read {
            return Err(Error::illegal_state(format!("cannot commit a transaction in state {:?}", self.state)));
        }
        if commit_time != UNKNOWN_LSN && commit_time < self.start_time {
            return Err(Error::invariant(format!(
                "commit time {} precedes start time {}",
                commit_time, self.start_time
            )));
        }
        if let TxnKind::ReadWrite(shared) = &self.kind {
            shared.set_commit_time(commit_time);
        }
        self.state = TxnState::Commit;
        Ok(())
    }

    /// Drops the transaction's own entry from its dependency list and releases
    /// the pin on the newest dependency. The error names the broken invariant.
    pub(crate) fn release_pins(&mut self) -> std::result::Result<(), String> {
        if let TxnKind::ReadWrite(own) = &self.kind {
            match self.dependencies.pop() {
                Some(tail) if Arc::ptr_eq(&tail, own) => {}
                _ => return Err("read-write transaction is missing from its own dependency list".to_string()),
            }
        }
        let pinned = self
            .dependencies
            .last()
            .ok_or_else(|| "transaction ended with an empty dependency list".to_string())?;
        if !pinned.release_ref() {
            return Err(format!(
                "ref count of transaction committed at {} would go negative",
                pinned.commit_time()
            ));
        }
        self.dependencies.clear();
        Ok(())
    }

    pub(crate) fn abort_txn(&mut self) -> Result<()> {
        if self.state != TxnState::Read {
            return Err(Error::illegal_state(format!("cannot abort a transaction in state {:?}", self.state)));
        }
        self.state = TxnState::Abort;
        Ok(())
    }

    /// Folds every dependency's changes to one entry over the stored value.
    ///
    /// The stored entry is cloned only when some change actually alters it.
    pub fn merge_updates<'a>(
        &self,
        partition_dn: &Dn,
        entry_id: EntryId,
        stored: Option<&'a Entry>,
    ) -> Result<Option<Cow<'a, Entry>>> {
        if !matches!(self.state, TxnState::Read | TxnState::Commit) {
            return Err(Error::illegal_state(format!("cannot merge updates in state {:?}", self.state)));
        }
        let mut entry = stored.map(Cow::Borrowed);
        for dependency in &self.dependencies {
            entry = dependency.apply_updates_to_entry(partition_dn, entry_id, entry);
        }
        Ok(entry)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Read {
            return;
        }
        let Some(reclaim) = self.reclaim.take() else {
            return;
        };

        let read_only = self.is_read_only();
        if !read_only {
            reclaim.log_abort(self.start_time);
        }
        self.state = TxnState::Abort;
        if let Err(details) = self.release_pins() {
            tracing::error!(%details, "dropped transaction could not release its pins");
        }
        if !read_only {
            reclaim.active_read_write.fetch_sub(1, Ordering::SeqCst);
        }
        reclaim.metrics.on_abort();
        tracing::warn!(start_time = self.start_time, read_only, "transaction dropped while open, aborted");
    }
}

/// One worker's current-transaction slot, passed explicitly through the
/// operation layer.
#[derive(Debug, Default)]
pub struct TxnContext {
    current: Option<Transaction>,
}

impl TxnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_transaction(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut()
    }

    pub(crate) fn require(&self) -> Result<&Transaction> {
        self.current.as_ref().ok_or(Error::NoActiveTransaction)
    }

    pub(crate) fn set(&mut self, txn: Transaction) {
        self.current = Some(txn);
    }

    pub(crate) fn take(&mut self) -> Option<Transaction> {
        self.current.take()
    }
}
