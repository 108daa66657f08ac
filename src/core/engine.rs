use crate::core::cursor_reaper::{CursorReaper, GuardedCursor};
use crate::core::dn::Dn;
use crate::core::errors::*;
use crate::core::index::IndexOrder;
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::partition::{Partition, PartitionRegistry};
use crate::core::table_wrapper::TableWrapper;
use crate::core::transaction::TxnContext;
use crate::core::txn_log_manager::TxnLogManager;
use crate::core::txn_manager::{RecoveryStats, TransactionManager, TxnManagerOptions};
use crate::core::wal::{FileWal, WriteAheadLog};
use fs2::FileExt;
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const WAL_FILE_NAME: &str = "txn.wal";
const LOCK_FILE_NAME: &str = "txn.lock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub file_permissions: u32,
    pub txn: TxnManagerOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            file_permissions: 0o644,
            txn: TxnManagerOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::DeserializationError {
            context: "engine options".to_string(),
            error: e.to_string(),
        })
    }
}

/// A transaction engine over a set of partitions, with its WAL and lock file
/// in one directory.
///
/// Opening recovers committed work from the WAL and starts the background
/// flush and cursor reaper. Only one engine may hold a directory at a time.
pub struct TxnEngine {
    dir: PathBuf,
    lock_file: Mutex<File>,
    wal: Arc<FileWal>,
    manager: Arc<TransactionManager>,
    log_manager: TxnLogManager,
    reaper: Arc<CursorReaper>,
    metrics: Arc<Metrics>,
    recovery: RecoveryStats,
    closed: AtomicBool,
}

impl TxnEngine {
    pub fn open(dir: impl AsRef<Path>, partitions: Vec<Arc<dyn Partition>>) -> Result<Self> {
        Self::open_with_options(dir, partitions, EngineOptions::default())
    }

    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open_with_options(
        dir: impl AsRef<Path>,
        partitions: Vec<Arc<dyn Partition>>,
        opts: EngineOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.as_os_str().is_empty() {
            return Err(Error::Other("engine directory cannot be empty".to_string()));
        }
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE_NAME);

        #[cfg(unix)]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(opts.file_permissions)
            .open(&lock_path)?;

        #[cfg(not(unix))]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;

        lock_file.try_lock_exclusive()?;

        let metrics = Arc::new(Metrics::new());
        let wal = Arc::new(FileWal::open(&dir.join(WAL_FILE_NAME), opts.file_permissions)?);
        wal.set_metrics(metrics.clone());

        let registry = Arc::new(PartitionRegistry::new());
        for partition in partitions {
            registry.register(partition)?;
        }

        let manager = Arc::new(TransactionManager::new(
            wal.clone(),
            registry,
            opts.txn.clone(),
            metrics.clone(),
        ));
        let recovery = manager.recover()?;
        manager.start_background_flush()?;

        let spill_dir = opts.txn.spill_dir();
        fs::create_dir_all(&spill_dir)?;
        let reaper = Arc::new(CursorReaper::new(
            opts.txn.cursor_timeout(),
            spill_dir,
            metrics.clone(),
        ));
        reaper.start(opts.txn.reaper_interval())?;

        tracing::debug!(dir = %dir.display(), "transaction engine opened");

        Ok(Self {
            dir,
            lock_file: Mutex::new(lock_file),
            wal,
            log_manager: TxnLogManager::new(manager.clone()),
            manager,
            reaper,
            metrics,
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn log_manager(&self) -> &TxnLogManager {
        &self.log_manager
    }

    pub fn reaper(&self) -> &Arc<CursorReaper> {
        &self.reaper
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineClosed);
        }
        Ok(())
    }

    pub fn begin(&self, ctx: &mut TxnContext, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        self.manager.begin(ctx, read_only)
    }

    pub fn commit(&self, ctx: &mut TxnContext) -> Result<()> {
        self.ensure_open()?;
        self.manager.commit(ctx)
    }

    pub fn abort(&self, ctx: &mut TxnContext) -> Result<()> {
        self.manager.abort(ctx)
    }

    pub fn run_in_txn<F, R>(&self, ctx: &mut TxnContext, read_only: bool, f: F) -> Result<R>
    where
        F: FnMut(&mut TxnContext) -> Result<R>,
    {
        self.ensure_open()?;
        self.manager.run_in_txn(ctx, read_only, f)
    }

    /// An index cursor over the transaction's view, watched by the reaper.
    pub fn open_index_cursor(
        &self,
        ctx: &TxnContext,
        partition_dn: &Dn,
        attribute_oid: &str,
        is_forward: bool,
        only_value_key: Option<String>,
        only_id_key: Option<u64>,
    ) -> Result<GuardedCursor> {
        self.ensure_open()?;
        let wrapper = self.log_manager.wrap(
            ctx,
            partition_dn,
            attribute_oid,
            is_forward,
            only_value_key,
            only_id_key,
        )?;
        self.reaper.guard(IndexOrder::from_forward(is_forward), Box::new(wrapper))
    }

    pub fn table(&self, ctx: &TxnContext, partition_dn: &Dn) -> Result<TableWrapper> {
        self.ensure_open()?;
        self.log_manager.wrap_table(ctx, partition_dn)
    }

    /// Flushes whatever can be flushed now.
    pub fn apply_pending(&self) -> Result<()> {
        self.ensure_open()?;
        self.manager.apply_pending()
    }

    /// Stops the background threads, flushes, syncs the WAL and releases the
    /// directory lock. The lock is released even when the final flush fails.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.reaper.shutdown();
        self.manager.shutdown();

        let flushed = self.manager.apply_pending();
        let synced = self.wal.close();

        let lock_file = self.lock_file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "engine.lock_file".to_string() })?;
        FileExt::unlock(&*lock_file)?;

        tracing::debug!(dir = %self.dir.display(), "transaction engine closed");
        flushed.and(synced)
    }
}

impl Drop for TxnEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "transaction engine did not close cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dn::SearchScope;
    use crate::core::entry::Entry;
    use crate::core::index::{collect_forward, IndexCursor, IndexEntry};
    use crate::core::log_edit::DataChangeContainer;
    use crate::core::partition::MemoryPartition;
    use tempfile::TempDir;

    fn suffix() -> Dn {
        Dn::parse("dc=example").unwrap()
    }

    fn quiet_options(spill: &Path) -> EngineOptions {
        let mut opts = EngineOptions::default();
        opts.txn.flush_interval_ms = 60_000;
        opts.txn.flush_threshold = usize::MAX;
        opts.txn.cursor_timeout_ms = 60_000;
        opts.txn.spill_dir = Some(spill.to_path_buf());
        opts
    }

    fn add_person(engine: &TxnEngine, ctx: &mut TxnContext, id: u64, cn: &str) {
        engine.begin(ctx, false).unwrap();
        let dn = Dn::parse(&format!("cn={},dc=example", cn)).unwrap();
        let log = engine.log_manager();
        log.add_write(ctx, dn.clone(), SearchScope::Object).unwrap();
        log.log(
            ctx,
            DataChangeContainer::new(suffix(), id)
                .add_entry(Entry::new(dn).with_attribute("cn", &[cn]))
                .add_index("cn", IndexEntry::new(cn, id)),
            false,
        )
        .unwrap();
        engine.commit(ctx).unwrap();
    }

    #[test]
    fn test_open_commit_close() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MemoryPartition::new(suffix()));
        let engine = TxnEngine::open_with_options(
            dir.path(),
            vec![partition.clone()],
            quiet_options(dir.path()),
        )
        .unwrap();

        let mut ctx = TxnContext::new();
        add_person(&engine, &mut ctx, 1, "alice");
        assert!(partition.get(1).unwrap().is_none());

        engine.begin(&mut ctx, true).unwrap();
        assert!(engine.table(&ctx, &suffix()).unwrap().contains(1).unwrap());
        let mut cursor = engine
            .open_index_cursor(&ctx, &suffix(), "cn", true, None, None)
            .unwrap();
        assert_eq!(collect_forward(&mut cursor).unwrap(), vec![IndexEntry::new("alice", 1)]);
        cursor.close().unwrap();
        engine.commit(&mut ctx).unwrap();

        engine.close().unwrap();
        assert!(partition.get(1).unwrap().is_some());
        assert!(matches!(engine.begin(&mut ctx, true), Err(Error::EngineClosed)));
        let snapshot = engine.metrics();
        assert_eq!(snapshot.commits, 2);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let first = TxnEngine::open_with_options(
            dir.path(),
            vec![Arc::new(MemoryPartition::new(suffix()))],
            quiet_options(dir.path()),
        )
        .unwrap();

        let second = TxnEngine::open_with_options(
            dir.path(),
            vec![Arc::new(MemoryPartition::new(suffix()))],
            quiet_options(dir.path()),
        );
        assert!(second.is_err());

        first.close().unwrap();
        let third = TxnEngine::open_with_options(
            dir.path(),
            vec![Arc::new(MemoryPartition::new(suffix()))],
            quiet_options(dir.path()),
        );
        assert!(third.is_ok());
    }

    #[test]
    fn test_options_from_json() {
        let opts = EngineOptions::from_json(r#"{"file_permissions": 384, "txn": {"flush_threshold": 8}}"#).unwrap();
        assert_eq!(opts.file_permissions, 0o600);
        assert_eq!(opts.txn.flush_threshold, 8);
        assert!(EngineOptions::from_json("[").is_err());
    }
}
