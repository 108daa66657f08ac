use dirtxn::core::metrics::Metrics;
use dirtxn::core::wal::MemoryWal;
use dirtxn::{
    DataChangeContainer, Dn, Entry, Error, IndexCursor, IndexEntry, IndexOrder, KeyLock,
    MemoryPartition, Partition, PartitionRegistry, Result, SearchScope, TransactionManager,
    TxnContext, TxnLogManager, TxnManagerOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A memory partition whose writes can be made to fail.
struct FailingPartition {
    inner: MemoryPartition,
    failing: AtomicBool,
}

impl FailingPartition {
    fn new(suffix: Dn) -> Self {
        Self {
            inner: MemoryPartition::new(suffix),
            failing: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Io("disk full".to_string()));
        }
        Ok(())
    }
}

impl Partition for FailingPartition {
    fn suffix(&self) -> &Dn {
        self.inner.suffix()
    }

    fn get(&self, id: u64) -> Result<Option<Entry>> {
        self.inner.get(id)
    }

    fn put(&self, id: u64, entry: Entry) -> Result<()> {
        self.check()?;
        self.inner.put(id, entry)
    }

    fn remove(&self, id: u64) -> Result<Option<Entry>> {
        self.check()?;
        self.inner.remove(id)
    }

    fn index_add(&self, attribute_oid: &str, entry: IndexEntry) -> Result<()> {
        self.check()?;
        self.inner.index_add(attribute_oid, entry)
    }

    fn index_remove(&self, attribute_oid: &str, entry: &IndexEntry) -> Result<()> {
        self.check()?;
        self.inner.index_remove(attribute_oid, entry)
    }

    fn index_cursor(
        &self,
        attribute_oid: &str,
        order: IndexOrder,
        lock: Option<KeyLock>,
    ) -> Result<Box<dyn IndexCursor>> {
        self.inner.index_cursor(attribute_oid, order, lock)
    }

    fn next_entry_id(&self) -> u64 {
        self.inner.next_entry_id()
    }

    fn sync(&self) -> Result<()> {
        self.check()?;
        self.inner.sync()
    }
}

fn suffix() -> Dn {
    Dn::parse("dc=example").unwrap()
}

fn setup(options: TxnManagerOptions) -> (Arc<TransactionManager>, TxnLogManager, Arc<FailingPartition>) {
    let partition = Arc::new(FailingPartition::new(suffix()));
    let registry = Arc::new(PartitionRegistry::new());
    registry.register(partition.clone()).unwrap();
    let manager = Arc::new(TransactionManager::new(
        Arc::new(MemoryWal::new()),
        registry,
        options,
        Arc::new(Metrics::new()),
    ));
    let log = TxnLogManager::new(manager.clone());
    (manager, log, partition)
}

fn commit_entry(manager: &TransactionManager, log: &TxnLogManager, id: u64) -> Result<()> {
    let mut ctx = TxnContext::new();
    manager.begin(&mut ctx, false)?;
    let dn = Dn::parse(&format!("cn=e{},dc=example", id))?;
    log.add_write(&ctx, dn.clone(), SearchScope::Object)?;
    log.log(&ctx, DataChangeContainer::new(suffix(), id).add_entry(Entry::new(dn)), false)?;
    manager.commit(&mut ctx)
}

#[test]
fn test_flush_failure_latches() {
    let mut options = TxnManagerOptions::default();
    options.flush_threshold = usize::MAX;
    let (manager, log, partition) = setup(options);

    commit_entry(&manager, &log, 1).unwrap();
    partition.failing.store(true, Ordering::SeqCst);

    assert!(manager.apply_pending().unwrap_err().is_io());
    assert!(manager.is_flush_failed());

    // the latch holds even once the partition recovers
    partition.failing.store(false, Ordering::SeqCst);
    assert!(matches!(manager.apply_pending(), Err(Error::FlushFailed { .. })));

    let mut ctx = TxnContext::new();
    let err = manager.begin(&mut ctx, false).unwrap_err();
    assert!(matches!(err, Error::FlushFailed { .. }));
    assert!(err.is_io());
    assert!(!ctx.has_transaction());
    assert_eq!(manager.metrics().snapshot().flush_failures, 1);
}

#[test]
fn test_commit_fails_after_latch() {
    let mut options = TxnManagerOptions::default();
    options.flush_threshold = usize::MAX;
    let (manager, log, partition) = setup(options);

    // begun after the commit, so the flush reaches entry 1 before the pin stops it
    commit_entry(&manager, &log, 1).unwrap();
    let mut ctx = TxnContext::new();
    manager.begin(&mut ctx, false).unwrap();

    partition.failing.store(true, Ordering::SeqCst);
    assert!(manager.apply_pending().is_err());

    let err = manager.commit(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::FlushFailed { .. }));
    assert!(!ctx.has_transaction());
    assert_eq!(manager.metrics().snapshot().in_flight, 0);
}

#[test]
fn test_read_only_commit_fails_after_latch() {
    let mut options = TxnManagerOptions::default();
    options.flush_threshold = usize::MAX;
    let (manager, log, partition) = setup(options);

    commit_entry(&manager, &log, 1).unwrap();
    let mut ctx = TxnContext::new();
    manager.begin(&mut ctx, true).unwrap();

    partition.failing.store(true, Ordering::SeqCst);
    assert!(manager.apply_pending().is_err());

    let err = manager.commit(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::FlushFailed { .. }));
    assert!(!ctx.has_transaction());

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.aborts, 1);
}

#[test]
fn test_inline_flush_failure_keeps_commit() {
    let mut options = TxnManagerOptions::default();
    options.flush_threshold = 0;
    let (manager, log, partition) = setup(options);

    partition.failing.store(true, Ordering::SeqCst);
    // durable in the WAL even though the inline flush fails
    commit_entry(&manager, &log, 1).unwrap();
    assert!(manager.is_flush_failed());

    let err = commit_entry(&manager, &log, 2).unwrap_err();
    assert!(matches!(err, Error::FlushFailed { .. }));
}

#[test]
fn test_background_flush_failure_surfaces() {
    let mut options = TxnManagerOptions::default();
    options.flush_interval_ms = 5;
    options.flush_threshold = usize::MAX;
    let (manager, log, partition) = setup(options);
    manager.start_background_flush().unwrap();

    partition.failing.store(true, Ordering::SeqCst);
    commit_entry(&manager, &log, 1).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.is_flush_failed() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(manager.is_flush_failed());

    let mut ctx = TxnContext::new();
    assert!(matches!(manager.begin(&mut ctx, true), Err(Error::FlushFailed { .. })));
    manager.shutdown();
}
