use crate::core::constants::*;
use crate::core::dn::{Dn, DnSet, SearchScope};
use crate::core::entry::Entry;
use crate::core::errors::*;
use crate::core::index::{IndexCursor, IndexOrder, KeyLock};
use crate::core::index_cursor_wrapper::IndexCursorWrapper;
use crate::core::log_edit::{DataChangeContainer, LogEdit};
use crate::core::table_wrapper::TableWrapper;
use crate::core::transaction::{TxnContext, TxnState};
use crate::core::txn_manager::TransactionManager;
use std::borrow::Cow;
use std::sync::Arc;

/// Logging and merge-on-read entry points for the operation layer.
///
/// Every call works on the transaction bound to the given context.
pub struct TxnLogManager {
    manager: Arc<TransactionManager>,
}

impl TxnLogManager {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Appends a change container to the WAL and to the current read-write
    /// transaction. Returns the container's LSN.
    pub fn log(&self, ctx: &TxnContext, mut container: DataChangeContainer, sync: bool) -> Result<Lsn> {
        let txn = ctx.require()?;
        let shared = txn.read_write_txn().ok_or_else(|| Error::ReadOnlyTransaction {
            operation: "log".to_string(),
        })?;
        if txn.state() != TxnState::Read {
            return Err(Error::illegal_state(format!("cannot log in state {:?}", txn.state())));
        }

        container.txn_id = shared.start_time();
        let edit = LogEdit::Data(container);
        let lsn = self.manager.wal().log(&edit.encode()?, sync)?;

        let LogEdit::Data(mut container) = edit else {
            return Err(Error::invariant("data log edit changed kind"));
        };
        container.lsn = lsn;
        shared.add_log_edit(container)?;
        Ok(lsn)
    }

    /// The entry as the current transaction sees it. The stored copy is only
    /// cloned when some dependency changed it.
    pub fn merge_updates<'a>(
        &self,
        ctx: &TxnContext,
        partition_dn: &Dn,
        entry_id: EntryId,
        stored: Option<&'a Entry>,
    ) -> Result<Option<Cow<'a, Entry>>> {
        ctx.require()?.merge_updates(partition_dn, entry_id, stored)
    }

    /// Records a read for conflict detection. Read-only transactions ignore it.
    pub fn add_read(&self, ctx: &TxnContext, base: Dn, scope: SearchScope) -> Result<()> {
        if let Some(shared) = ctx.require()?.read_write_txn() {
            shared.add_read(DnSet::new(base, scope));
        }
        Ok(())
    }

    /// Records a write, which also counts as a read of the same subtree.
    pub fn add_write(&self, ctx: &TxnContext, base: Dn, scope: SearchScope) -> Result<()> {
        let txn = ctx.require()?;
        let shared = txn.read_write_txn().ok_or_else(|| Error::ReadOnlyTransaction {
            operation: "add_write".to_string(),
        })?;
        shared.add_write(DnSet::new(base, scope));
        Ok(())
    }

    /// Opens a partition index cursor merged with the current transaction's
    /// dependencies.
    pub fn wrap(
        &self,
        ctx: &TxnContext,
        partition_dn: &Dn,
        attribute_oid: &str,
        is_forward: bool,
        only_value_key: Option<String>,
        only_id_key: Option<EntryId>,
    ) -> Result<IndexCursorWrapper> {
        let order = IndexOrder::from_forward(is_forward);
        let lock = KeyLock::from_keys(only_value_key, only_id_key);
        let partition = self.manager.partitions().get(partition_dn)?;
        let store_cursor = partition.index_cursor(attribute_oid, order, lock.clone())?;
        self.wrap_cursor(ctx, store_cursor, partition_dn, attribute_oid, order, lock)
    }

    /// Like `wrap`, over a cursor the caller already opened on the partition.
    pub fn wrap_cursor(
        &self,
        ctx: &TxnContext,
        store_cursor: Box<dyn IndexCursor>,
        partition_dn: &Dn,
        attribute_oid: &str,
        order: IndexOrder,
        lock: Option<KeyLock>,
    ) -> Result<IndexCursorWrapper> {
        let txn = ctx.require()?;
        IndexCursorWrapper::new(
            store_cursor,
            txn.dependencies().to_vec(),
            partition_dn.clone(),
            attribute_oid,
            order,
            lock,
        )
    }

    pub fn wrap_table(&self, ctx: &TxnContext, partition_dn: &Dn) -> Result<TableWrapper> {
        let txn = ctx.require()?;
        let partition = self.manager.partitions().get(partition_dn)?;
        Ok(TableWrapper::new(partition, txn.dependencies().to_vec()))
    }
}
