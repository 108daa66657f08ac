
pub mod core;

pub use core::{
    DataChangeContainer, Dn, DnSet, Entry, IndexCursor, IndexCursorWrapper, IndexEntry, IndexOrder,
    KeyLock, LogEdit, MemoryPartition, Modification, Partition, PartitionRegistry, SearchScope,
    TableWrapper, Transaction, TransactionManager, TxnContext, TxnEngine, TxnLogManager, TxnState,
};
pub use core::errors::{Error, Result};
pub use core::engine::EngineOptions;
pub use core::txn_manager::{RecoveryStats, TxnManagerOptions};
pub use core::metrics::MetricsSnapshot;
