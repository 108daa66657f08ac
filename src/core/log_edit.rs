use crate::core::constants::*;
use crate::core::dn::Dn;
use crate::core::entry::{Entry, Modification};
use crate::core::errors::*;
use crate::core::index::IndexEntry;
use crate::core::partition::Partition;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Delete,
}

/// One mutation of a single entry or of one of its index tuples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataChange {
    /// Whole-entry create or delete.
    EntryAddDelete { entry: Entry, kind: ChangeKind },
    /// Attribute-level modification with the modification that reverts it.
    EntryChange { redo: Modification, undo: Modification },
    /// Add or delete of one `(value, id)` tuple, in both the forward and the
    /// reverse index of `attribute_oid`.
    IndexChange {
        attribute_oid: String,
        entry: IndexEntry,
        kind: ChangeKind,
    },
}

/// The changes one operation made to one entry of one partition.
///
/// Built by the operation layer, then frozen once logged: `lsn` and `txn_id`
/// are filled in by the log manager and nothing mutates the container after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeContainer {
    pub txn_id: Lsn,
    pub partition_dn: Dn,
    pub entry_id: EntryId,
    pub changes: Vec<DataChange>,
    pub lsn: Lsn,
}

impl DataChangeContainer {
    pub fn new(partition_dn: Dn, entry_id: EntryId) -> Self {
        Self {
            txn_id: UNKNOWN_LSN,
            partition_dn,
            entry_id,
            changes: Vec::new(),
            lsn: UNKNOWN_LSN,
        }
    }

    pub fn add_entry(mut self, entry: Entry) -> Self {
        self.changes.push(DataChange::EntryAddDelete {
            entry,
            kind: ChangeKind::Add,
        });
        self
    }

    pub fn delete_entry(mut self, entry: Entry) -> Self {
        self.changes.push(DataChange::EntryAddDelete {
            entry,
            kind: ChangeKind::Delete,
        });
        self
    }

    pub fn modify(mut self, redo: Modification, undo: Modification) -> Self {
        self.changes.push(DataChange::EntryChange { redo, undo });
        self
    }

    pub fn add_index(mut self, attribute_oid: &str, entry: IndexEntry) -> Self {
        self.changes.push(DataChange::IndexChange {
            attribute_oid: attribute_oid.to_lowercase(),
            entry,
            kind: ChangeKind::Add,
        });
        self
    }

    pub fn delete_index(mut self, attribute_oid: &str, entry: IndexEntry) -> Self {
        self.changes.push(DataChange::IndexChange {
            attribute_oid: attribute_oid.to_lowercase(),
            entry,
            kind: ChangeKind::Delete,
        });
        self
    }

    pub fn touches(&self, partition_dn: &Dn, entry_id: EntryId) -> bool {
        self.entry_id == entry_id && &self.partition_dn == partition_dn
    }

    pub fn index_changes(&self) -> impl Iterator<Item = (&str, &IndexEntry, ChangeKind)> {
        self.changes.iter().filter_map(|change| match change {
            DataChange::IndexChange {
                attribute_oid,
                entry,
                kind,
            } => Some((attribute_oid.as_str(), entry, *kind)),
            _ => None,
        })
    }

    /// Folds this container's entry changes onto `entry`.
    ///
    /// A borrowed entry is cloned only when a change actually alters it, so a
    /// fold that changes nothing hands the stored value back untouched.
    pub fn apply_to_entry<'a>(&self, mut entry: Option<Cow<'a, Entry>>) -> Option<Cow<'a, Entry>> {
        for change in &self.changes {
            match change {
                DataChange::EntryAddDelete { entry: added, kind } => {
                    entry = match kind {
                        ChangeKind::Add => Some(Cow::Owned(added.clone())),
                        ChangeKind::Delete => None,
                    };
                }
                DataChange::EntryChange { redo, .. } => {
                    if let Some(current) = entry.as_mut() {
                        if current.would_change(redo) {
                            current.to_mut().apply_modification(redo);
                        }
                    }
                }
                DataChange::IndexChange { .. } => {}
            }
        }
        entry
    }

    /// Writes this container's changes into the backing partition.
    pub fn apply_to_partition(&self, partition: &dyn Partition) -> Result<()> {
        for change in &self.changes {
            match change {
                DataChange::EntryAddDelete { entry, kind } => match kind {
                    ChangeKind::Add => partition.put(self.entry_id, entry.clone())?,
                    ChangeKind::Delete => {
                        partition.remove(self.entry_id)?;
                    }
                },
                DataChange::EntryChange { redo, .. } => {
                    if let Some(mut stored) = partition.get(self.entry_id)? {
                        if stored.apply_modification(redo) {
                            partition.put(self.entry_id, stored)?;
                        }
                    }
                }
                DataChange::IndexChange {
                    attribute_oid,
                    entry,
                    kind,
                } => match kind {
                    ChangeKind::Add => partition.index_add(attribute_oid, entry.clone())?,
                    ChangeKind::Delete => partition.index_remove(attribute_oid, entry)?,
                },
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStateKind {
    Begin,
    Commit,
    Abort,
}

/// Begin/commit/abort marker. `txn_id` is the transaction's start LSN, which a
/// begin marker cannot know yet (its own LSN becomes the id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStateChange {
    pub txn_id: Lsn,
    pub state: TxnStateKind,
}

/// Every record the engine writes to the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEdit {
    Data(DataChangeContainer),
    TxnState(TxnStateChange),
    /// Everything committed at or before `flushed_lsn` is in the partitions.
    Checkpoint { flushed_lsn: Lsn },
}

impl LogEdit {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::SerializationError {
            context: "log edit".to_string(),
            error: e.to_string(),
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::DeserializationError {
            context: "log edit".to_string(),
            error: e.to_string(),
        })
    }
}
