use crate::core::constants::EntryId;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::errors::*;
use crate::core::partition::Partition;
use crate::core::transaction::ReadWriteTransaction;
use std::borrow::Cow;
use std::sync::Arc;

/// Master-table view of one partition as a transaction sees it: the stored
/// entry with every dependency's entry changes folded on top.
pub struct TableWrapper {
    partition: Arc<dyn Partition>,
    partition_dn: Dn,
    dependencies: Vec<Arc<ReadWriteTransaction>>,
}

impl TableWrapper {
    pub fn new(partition: Arc<dyn Partition>, dependencies: Vec<Arc<ReadWriteTransaction>>) -> Self {
        Self {
            partition_dn: partition.suffix().clone(),
            partition,
            dependencies,
        }
    }

    pub fn partition_dn(&self) -> &Dn {
        &self.partition_dn
    }

    pub fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        let stored = self.partition.get(id)?;
        let mut entry = stored.as_ref().map(Cow::Borrowed);
        for dependency in &self.dependencies {
            entry = dependency.apply_updates_to_entry(&self.partition_dn, id, entry);
        }
        Ok(entry.map(Cow::into_owned))
    }

    pub fn contains(&self, id: EntryId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }
}
