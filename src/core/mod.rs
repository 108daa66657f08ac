pub mod constants;
pub mod errors;
pub mod dn;
pub mod entry;
pub mod index;
pub mod log_edit;
pub mod wal;
pub mod partition;
pub mod transaction;
pub mod txn_manager;
pub mod txn_index_cursor;
pub mod index_cursor_wrapper;
pub mod table_wrapper;
pub mod txn_log_manager;
pub mod cursor_reaper;
pub mod metrics;
pub mod engine;

pub use constants::*;
pub use dn::{Dn, DnSet, SearchScope};
pub use entry::{Entry, ModOp, Modification};
pub use index::{IndexCursor, IndexEntry, IndexOrder, KeyLock, SortedIndexSet};
pub use log_edit::{DataChange, DataChangeContainer, LogEdit};
pub use wal::{FileWal, MemoryWal, WriteAheadLog};
pub use partition::{MemoryPartition, Partition, PartitionRegistry};
pub use transaction::{ReadWriteTransaction, Transaction, TxnContext, TxnState};
pub use txn_manager::TransactionManager;
pub use txn_index_cursor::TxnIndexCursor;
pub use index_cursor_wrapper::IndexCursorWrapper;
pub use table_wrapper::TableWrapper;
pub use txn_log_manager::TxnLogManager;
pub use cursor_reaper::{CursorReaper, DiskSnapshotCursor, GuardedCursor, LeakableCursor};
pub use metrics::{Metrics, MetricsSnapshot};
pub use engine::{EngineOptions, TxnEngine};
