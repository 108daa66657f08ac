use crate::core::constants::*;
use crate::core::dn::Dn;
use crate::core::errors::*;
use crate::core::log_edit::{DataChangeContainer, LogEdit, TxnStateChange, TxnStateKind};
use crate::core::metrics::Metrics;
use crate::core::partition::{Partition, PartitionRegistry};
use crate::core::transaction::{ReadWriteTransaction, Reclaim, Transaction, TxnContext, TxnState};
use crate::core::wal::WriteAheadLog;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tuning for the transaction manager, loadable from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxnManagerOptions {
    /// Period of the background flush.
    pub flush_interval_ms: u64,
    /// A commit that leaves more than this many transactions queued flushes
    /// inline.
    pub flush_threshold: usize,
    /// Cursors open longer than this are spilled to disk and closed.
    pub cursor_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    /// Where reaped cursors are spilled; the system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
    pub max_retries: usize,
    pub retry_backoff_base_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for TxnManagerOptions {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            cursor_timeout_ms: DEFAULT_CURSOR_TIMEOUT.as_millis() as u64,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL.as_millis() as u64,
            spill_dir: None,
            max_retries: 3,
            retry_backoff_base_ms: 1,
            max_retry_backoff_ms: 100,
        }
    }
}

impl TxnManagerOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::DeserializationError {
            context: "transaction manager options".to_string(),
            error: e.to_string(),
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn cursor_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.spill_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// What `recover` found in the WAL.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub checkpoint_lsn: Lsn,
    pub transactions_replayed: usize,
    pub transactions_discarded: usize,
    pub containers_applied: usize,
}

#[derive(Default)]
struct FlushState {
    shutdown: bool,
}

/// `flush_lock` and the wakeup condvar of the background flush.
#[derive(Default)]
struct FlushControl {
    state: Mutex<FlushState>,
    cond: Condvar,
}

/// Begins, verifies, commits and aborts transactions, and flushes committed
/// ones into the partitions.
///
/// Lock order: `verify_lock` before `write_txns_lock`; the committed queue
/// mutex is a leaf and is never held across WAL or partition I/O.
pub struct TransactionManager {
    wal: Arc<dyn WriteAheadLog>,
    partitions: Arc<PartitionRegistry>,
    options: TxnManagerOptions,
    metrics: Arc<Metrics>,

    committed_queue: Mutex<VecDeque<Arc<ReadWriteTransaction>>>,
    latest_committed: RwLock<Arc<ReadWriteTransaction>>,
    latest_verified: RwLock<Arc<ReadWriteTransaction>>,
    latest_flushed_lsn: AtomicU64,
    flush_failed: AtomicBool,
    flush_failure: Mutex<Option<String>>,
    active_read_write: Arc<AtomicUsize>,
    reclaim: Arc<Reclaim>,

    write_txns_lock: Mutex<()>,
    verify_lock: Mutex<()>,
    flush_control: Arc<FlushControl>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        partitions: Arc<PartitionRegistry>,
        options: TxnManagerOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let sentinel = Arc::new(ReadWriteTransaction::sentinel());
        let active_read_write = Arc::new(AtomicUsize::new(0));
        let reclaim = Arc::new(Reclaim {
            wal: wal.clone(),
            active_read_write: active_read_write.clone(),
            metrics: metrics.clone(),
        });
        let mut queue = VecDeque::new();
        queue.push_back(sentinel.clone());

        Self {
            wal,
            partitions,
            options,
            metrics,
            committed_queue: Mutex::new(queue),
            latest_committed: RwLock::new(sentinel.clone()),
            latest_verified: RwLock::new(sentinel),
            latest_flushed_lsn: AtomicU64::new(UNKNOWN_LSN),
            flush_failed: AtomicBool::new(false),
            flush_failure: Mutex::new(None),
            active_read_write,
            reclaim,
            write_txns_lock: Mutex::new(()),
            verify_lock: Mutex::new(()),
            flush_control: Arc::new(FlushControl::default()),
            flush_thread: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &TxnManagerOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn partitions(&self) -> &Arc<PartitionRegistry> {
        &self.partitions
    }

    pub(crate) fn wal(&self) -> &Arc<dyn WriteAheadLog> {
        &self.wal
    }

    pub fn latest_flushed_lsn(&self) -> Lsn {
        self.latest_flushed_lsn.load(Ordering::SeqCst)
    }

    pub fn latest_committed_lsn(&self) -> Lsn {
        self.latest_committed.read().recover_poison().commit_time()
    }

    pub fn committed_queue_len(&self) -> usize {
        self.committed_queue.lock().recover_poison().len()
    }

    /// Commit times of every queued transaction, oldest first.
    pub fn committed_queue_lsns(&self) -> Vec<Lsn> {
        self.committed_queue
            .lock()
            .recover_poison()
            .iter()
            .map(|txn| txn.commit_time())
            .collect()
    }

    pub fn is_flush_failed(&self) -> bool {
        self.flush_failed.load(Ordering::SeqCst)
    }

    fn check_flush_failed(&self) -> Result<()> {
        if !self.is_flush_failed() {
            return Ok(());
        }
        let details = self
            .flush_failure
            .lock()
            .recover_poison()
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::FlushFailed { details })
    }

    /// Binds a new transaction to `ctx`.
    ///
    /// A read-only begin on a context that already holds a read-only
    /// transaction reuses it; every other begin on a busy context fails.
    pub fn begin(&self, ctx: &mut TxnContext, read_only: bool) -> Result<()> {
        self.check_flush_failed()?;

        if let Some(current) = ctx.current_mut() {
            if read_only && current.is_read_only() {
                current.reuse();
                return Ok(());
            }
            return Err(Error::illegal_state("a transaction is already active in this context"));
        }

        let txn = if read_only {
            self.begin_read_only()?
        } else {
            self.begin_read_write()?
        };
        ctx.set(txn);
        Ok(())
    }

    fn begin_read_only(&self) -> Result<Transaction> {
        let last = self.pin_latest(&self.latest_committed, "txn_manager.latest_committed")?;

        let mut txn = Transaction::read_only().with_reclaim(self.reclaim.clone());
        if let Err(e) = self.build_dependency_list(&last, txn.dependencies_mut()) {
            if let Err(unpin_err) = last.dec_ref() {
                tracing::warn!(error = %unpin_err, "unpinning after a failed begin also failed");
            }
            return Err(e);
        }
        txn.start_txn(last.commit_time())?;

        self.metrics.on_begin(true);
        tracing::debug!(start_time = txn.start_time(), deps = txn.dependencies().len(), "began read-only transaction");
        Ok(txn)
    }

    fn begin_read_write(&self) -> Result<Transaction> {
        let _write_guard = self.write_txns_lock.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.write_txns_lock".to_string() })?;

        let start_time = self.log_state(
            TxnStateChange {
                txn_id: UNKNOWN_LSN,
                state: TxnStateKind::Begin,
            },
            false,
        )?;

        let last = self.pin_latest(&self.latest_verified, "txn_manager.latest_verified")?;

        let shared = Arc::new(ReadWriteTransaction::new(start_time));
        let mut txn = Transaction::read_write(shared.clone()).with_reclaim(self.reclaim.clone());
        if let Err(e) = self.build_dependency_list(&last, txn.dependencies_mut()) {
            if let Err(unpin_err) = last.dec_ref() {
                tracing::warn!(error = %unpin_err, "unpinning after a failed begin also failed");
            }
            return Err(e);
        }
        txn.dependencies_mut().push(shared);
        txn.start_txn(start_time)?;

        self.active_read_write.fetch_add(1, Ordering::SeqCst);
        self.metrics.on_begin(false);
        tracing::debug!(start_time, deps = txn.dependencies().len() - 1, "began read-write transaction");
        Ok(txn)
    }

    /// Takes a reference on the transaction in `slot`, retrying until the slot
    /// still points at the same transaction after the increment.
    fn pin_latest(
        &self,
        slot: &RwLock<Arc<ReadWriteTransaction>>,
        lock_name: &str,
    ) -> Result<Arc<ReadWriteTransaction>> {
        loop {
            let candidate = slot.read()
                .map_err(|_| Error::LockPoisoned { lock_name: lock_name.to_string() })?
                .clone();
            candidate.inc_ref();

            let still_latest = {
                let current = slot.read()
                    .map_err(|_| Error::LockPoisoned { lock_name: lock_name.to_string() })?;
                Arc::ptr_eq(&candidate, &current)
            };
            if still_latest {
                return Ok(candidate);
            }
            candidate.dec_ref()?;
        }
    }

    /// Collects, oldest first, the unflushed queued transactions committed no
    /// later than `last`. `last` itself always ends the list.
    fn build_dependency_list(
        &self,
        last: &Arc<ReadWriteTransaction>,
        dependencies: &mut Vec<Arc<ReadWriteTransaction>>,
    ) -> Result<()> {
        let flushed = self.latest_flushed_lsn.load(Ordering::SeqCst);
        let last_commit = last.commit_time();

        let queue = self.committed_queue.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.committed_queue".to_string() })?;
        for txn in queue.iter() {
            if txn.commit_time() > last_commit {
                break;
            }
            if txn.commit_time() > flushed || Arc::ptr_eq(txn, last) {
                dependencies.push(txn.clone());
            }
        }
        drop(queue);

        match dependencies.last() {
            Some(tail) if Arc::ptr_eq(tail, last) => Ok(()),
            _ => Err(Error::invariant(format!(
                "pinned transaction committed at {} is missing from the committed queue",
                last_commit
            ))),
        }
    }

    /// Commits the context's transaction.
    ///
    /// On any failure before the commit record is durable the transaction is
    /// aborted and the context cleared; the caller retries from scratch.
    pub fn commit(&self, ctx: &mut TxnContext) -> Result<()> {
        let mut txn = ctx.take().ok_or(Error::NoActiveTransaction)?;

        if txn.reuse_count() > 0 {
            txn.release_reuse();
            ctx.set(txn);
            return Ok(());
        }

        // fail fast once flushing is disabled, readers included
        if let Err(e) = self.check_flush_failed() {
            if let Err(abort_err) = self.abort_txn(txn) {
                tracing::warn!(error = %abort_err, "abort after refused commit also failed");
            }
            return Err(e);
        }

        if txn.is_read_only() {
            txn.commit_txn(UNKNOWN_LSN)?;
            self.end_txn(&mut txn)?;
            self.metrics.on_commit();
            return Ok(());
        }

        if let Err(e) = self.verify_and_publish(&mut txn) {
            if e.is_conflict() {
                self.metrics.on_conflict();
                tracing::warn!(start_time = txn.start_time(), "transaction conflict, aborting");
            }
            if let Err(abort_err) = self.abort_txn(txn) {
                tracing::warn!(error = %abort_err, "abort after failed commit also failed");
            }
            return Err(e);
        }

        self.end_txn(&mut txn)?;
        self.active_read_write.fetch_sub(1, Ordering::SeqCst);
        self.metrics.on_commit();
        tracing::debug!(start_time = txn.start_time(), commit_time = txn.commit_time(), "committed transaction");

        if self.committed_queue_len() > self.options.flush_threshold {
            // the commit is durable; a failed flush surfaces on the next begin or commit
            if let Err(e) = self.apply_pending() {
                tracing::warn!(error = %e, "inline flush after commit failed");
            }
        }
        Ok(())
    }

    fn verify_and_publish(&self, txn: &mut Transaction) -> Result<()> {
        let shared = txn
            .read_write_txn()
            .cloned()
            .ok_or_else(|| Error::invariant("read-write commit without a shared transaction"))?;

        let _verify_guard = self.verify_lock.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.verify_lock".to_string() })?;

        let concurrent: Vec<Arc<ReadWriteTransaction>> = self
            .committed_queue
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.committed_queue".to_string() })?
            .iter()
            .filter(|other| other.commit_time() >= shared.start_time())
            .cloned()
            .collect();
        if concurrent.iter().any(|other| shared.has_conflict(other)) {
            return Err(Error::Conflict);
        }

        let _write_guard = self.write_txns_lock.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.write_txns_lock".to_string() })?;

        let commit_time = self.log_state(
            TxnStateChange {
                txn_id: shared.start_time(),
                state: TxnStateKind::Commit,
            },
            true,
        )?;
        txn.commit_txn(commit_time)?;

        *self.latest_verified.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.latest_verified".to_string() })? = shared.clone();
        self.committed_queue
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.committed_queue".to_string() })?
            .push_back(shared.clone());
        *self.latest_committed.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.latest_committed".to_string() })? = shared;
        Ok(())
    }

    /// Aborts the context's transaction. With no transaction bound this fails
    /// with `NoActiveTransaction`, so a second abort is rejected.
    pub fn abort(&self, ctx: &mut TxnContext) -> Result<()> {
        let mut txn = ctx.take().ok_or(Error::NoActiveTransaction)?;
        if txn.reuse_count() > 0 {
            txn.release_reuse();
            ctx.set(txn);
            return Ok(());
        }
        self.abort_txn(txn)
    }

    fn abort_txn(&self, mut txn: Transaction) -> Result<()> {
        if !txn.is_read_only() {
            self.reclaim.log_abort(txn.start_time());
        }

        txn.abort_txn()?;
        self.end_txn(&mut txn)?;
        if !txn.is_read_only() {
            self.active_read_write.fetch_sub(1, Ordering::SeqCst);
        }
        self.metrics.on_abort();
        tracing::debug!(start_time = txn.start_time(), "aborted transaction");
        Ok(())
    }

    /// Drops the transaction's own entry and releases its pin on the newest
    /// dependency.
    fn end_txn(&self, txn: &mut Transaction) -> Result<()> {
        txn.release_pins().map_err(|details| Error::invariant(details))
    }

    /// Detaches the context's transaction so it can be resumed elsewhere.
    /// Dropping the returned handle without resuming it aborts the transaction.
    pub fn suspend(&self, ctx: &mut TxnContext) -> Result<Transaction> {
        ctx.take().ok_or(Error::NoActiveTransaction)
    }

    pub fn resume(&self, ctx: &mut TxnContext, txn: Transaction) -> Result<()> {
        if ctx.has_transaction() {
            return Err(Error::illegal_state("cannot resume into a context with an active transaction"));
        }
        if txn.state() != TxnState::Read {
            return Err(Error::illegal_state(format!("cannot resume a transaction in state {:?}", txn.state())));
        }
        ctx.set(txn);
        Ok(())
    }

    /// Runs `f` inside a transaction, retrying on conflict with exponential
    /// backoff. Any other error aborts and is returned as is.
    pub fn run_in_txn<F, R>(&self, ctx: &mut TxnContext, read_only: bool, mut f: F) -> Result<R>
    where
        F: FnMut(&mut TxnContext) -> Result<R>,
    {
        let mut last_err = None;

        for attempt in 0..=self.options.max_retries {
            self.begin(ctx, read_only)?;

            match f(ctx) {
                Ok(result) => match self.commit(ctx) {
                    Ok(()) => return Ok(result),
                    Err(e) if e.is_conflict() => last_err = Some(e),
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    if ctx.has_transaction() {
                        if let Err(abort_err) = self.abort(ctx) {
                            tracing::warn!(error = %abort_err, "abort after failed transaction body also failed");
                        }
                    }
                    return Err(e);
                }
            }

            if attempt < self.options.max_retries {
                let factor = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX);
                let backoff_ms = self
                    .options
                    .retry_backoff_base_ms
                    .saturating_mul(factor)
                    .min(self.options.max_retry_backoff_ms);
                if backoff_ms > 0 {
                    thread::sleep(Duration::from_millis(backoff_ms));
                }
            }
        }

        Err(last_err.unwrap_or(Error::Conflict))
    }

    fn log_state(&self, change: TxnStateChange, sync: bool) -> Result<Lsn> {
        let payload = LogEdit::TxnState(change).encode()?;
        self.wal.log(&payload, sync)
    }

    /// Flushes whatever committed transactions can be flushed now.
    pub fn apply_pending(&self) -> Result<()> {
        self.check_flush_failed()?;
        let _flush_guard = self.flush_control.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.flush_lock".to_string() })?;
        self.flush_locked()
    }

    /// Caller holds the flush lock.
    fn flush_locked(&self) -> Result<()> {
        self.check_flush_failed()?;
        match self.flush_pass() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.flush_failed.store(true, Ordering::SeqCst);
                *self.flush_failure.lock().recover_poison() = Some(e.to_string());
                self.metrics.on_flush_failure();
                tracing::error!(error = %e, "flush failed, refusing further flushes");
                Err(e)
            }
        }
    }

    fn flush_pass(&self) -> Result<()> {
        let started = Instant::now();
        let latest = self.latest_committed.read()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.latest_committed".to_string() })?
            .clone();
        let initial_flushed = self.latest_flushed_lsn.load(Ordering::SeqCst);
        let mut flushed = initial_flushed;

        let snapshot: Vec<Arc<ReadWriteTransaction>> = self
            .committed_queue
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.committed_queue".to_string() })?
            .iter()
            .cloned()
            .collect();

        let mut touched: HashMap<Dn, Arc<dyn Partition>> = HashMap::new();
        let mut applied = 0;
        let mut removable = 0;
        for txn in &snapshot {
            if txn.commit_time() > flushed {
                txn.flush_into(&self.partitions, &mut touched)?;
                flushed = txn.commit_time();
                self.latest_flushed_lsn.store(flushed, Ordering::SeqCst);
                applied += 1;
            }
            // the latest committed must stay reachable, and a pinned transaction
            // marks the newest state some reader may see
            if Arc::ptr_eq(txn, &latest) || txn.ref_count() > 0 {
                break;
            }
            removable += 1;
        }

        for partition in touched.values() {
            partition.sync()?;
        }

        let queue_len = {
            let mut queue = self.committed_queue.lock()
                .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.committed_queue".to_string() })?;
            for _ in 0..removable {
                queue.pop_front();
            }
            queue.len()
        };

        if flushed > initial_flushed {
            self.write_checkpoint(flushed)?;
        }

        self.metrics.on_flush_pass(applied, queue_len + removable, started.elapsed());
        if applied > 0 || removable > 0 {
            tracing::debug!(applied, removed = removable, flushed_lsn = flushed, "flush pass");
        }
        Ok(())
    }

    /// Logs a checkpoint record and truncates the WAL when nothing in it is
    /// still needed: no read-write transaction is open and every committed one
    /// is flushed.
    fn write_checkpoint(&self, flushed_lsn: Lsn) -> Result<()> {
        let payload = LogEdit::Checkpoint { flushed_lsn }.encode()?;
        let checkpoint_lsn = self.wal.log(&payload, true)?;
        self.metrics.on_checkpoint();

        let _write_guard = self.write_txns_lock.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.write_txns_lock".to_string() })?;
        if self.active_read_write.load(Ordering::SeqCst) == 0 && self.latest_committed_lsn() == flushed_lsn {
            if self.wal.checkpoint(checkpoint_lsn)? {
                tracing::debug!(checkpoint_lsn, "WAL truncated after checkpoint");
            }
        }
        Ok(())
    }

    /// Starts the periodic flush thread. Calling it again is a no-op.
    pub fn start_background_flush(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.flush_thread.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "txn_manager.flush_thread".to_string() })?;
        if slot.is_some() {
            return Ok(());
        }

        let control = self.flush_control.clone();
        let manager = Arc::downgrade(self);
        let interval = self.options.flush_interval();
        let handle = thread::Builder::new()
            .name("dirtxn-flush".to_string())
            .spawn(move || flush_loop(control, manager, interval))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops the flush thread and waits for it. No final flush is done here.
    pub fn shutdown(&self) {
        {
            let mut state = self.flush_control.state.lock().recover_poison();
            state.shutdown = true;
        }
        self.flush_control.cond.notify_all();

        let handle = self.flush_thread.lock().recover_poison().take();
        if let Some(handle) = handle {
            // the flush thread may drop the last reference itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Replays into the partitions every transaction whose commit record is in
    /// the WAL after the last checkpoint. Must run before the first begin.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let records = self.wal.read_after(UNKNOWN_LSN)?;
        let mut stats = RecoveryStats {
            records_scanned: records.len(),
            ..RecoveryStats::default()
        };

        let mut open: HashMap<Lsn, Vec<DataChangeContainer>> = HashMap::new();
        let mut committed: Vec<(Lsn, Vec<DataChangeContainer>)> = Vec::new();
        for record in records {
            match LogEdit::decode(&record.payload)? {
                LogEdit::TxnState(change) => match change.state {
                    TxnStateKind::Begin => {
                        open.insert(record.lsn, Vec::new());
                    }
                    TxnStateKind::Commit => {
                        if let Some(containers) = open.remove(&change.txn_id) {
                            committed.push((record.lsn, containers));
                        }
                    }
                    TxnStateKind::Abort => {
                        if open.remove(&change.txn_id).is_some() {
                            stats.transactions_discarded += 1;
                        }
                    }
                },
                LogEdit::Data(container) => {
                    open.entry(container.txn_id).or_default().push(container);
                }
                LogEdit::Checkpoint { flushed_lsn } => {
                    stats.checkpoint_lsn = stats.checkpoint_lsn.max(flushed_lsn);
                }
            }
        }
        stats.transactions_discarded += open.len();

        let mut touched: HashMap<Dn, Arc<dyn Partition>> = HashMap::new();
        let mut recovered_lsn = stats.checkpoint_lsn;
        for (commit_lsn, containers) in committed {
            if commit_lsn <= stats.checkpoint_lsn {
                continue;
            }
            for container in &containers {
                let partition = match touched.get(&container.partition_dn) {
                    Some(partition) => partition.clone(),
                    None => {
                        let partition = self.partitions.get(&container.partition_dn)?;
                        touched.insert(container.partition_dn.clone(), partition.clone());
                        partition
                    }
                };
                container.apply_to_partition(partition.as_ref())?;
                stats.containers_applied += 1;
            }
            stats.transactions_replayed += 1;
            recovered_lsn = recovered_lsn.max(commit_lsn);
        }

        for partition in touched.values() {
            partition.sync()?;
        }

        self.latest_flushed_lsn.fetch_max(recovered_lsn, Ordering::SeqCst);
        self.metrics.on_recovered(stats.transactions_replayed);
        tracing::info!(
            replayed = stats.transactions_replayed,
            discarded = stats.transactions_discarded,
            checkpoint_lsn = stats.checkpoint_lsn,
            "WAL recovery complete"
        );
        Ok(stats)
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_loop(control: Arc<FlushControl>, weak: Weak<TransactionManager>, interval: Duration) {
    let mut state = control.state.lock().recover_poison();
    loop {
        if state.shutdown {
            break;
        }
        state = match control.cond.wait_timeout(state, interval) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
        if state.shutdown {
            break;
        }

        let Some(manager) = weak.upgrade() else {
            break;
        };
        if !manager.is_flush_failed() {
            if let Err(e) = manager.flush_locked() {
                tracing::warn!(error = %e, "background flush failed");
            }
        }

        // the manager may be dropped here, and its Drop takes this lock
        drop(state);
        drop(manager);
        state = control.state.lock().recover_poison();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dn::{DnSet, SearchScope};
    use crate::core::entry::Entry;
    use crate::core::partition::MemoryPartition;
    use crate::core::wal::MemoryWal;

    fn suffix() -> Dn {
        Dn::parse("dc=example").unwrap()
    }

    fn setup() -> (Arc<TransactionManager>, Arc<MemoryPartition>, Arc<MemoryWal>) {
        let partition = Arc::new(MemoryPartition::new(suffix()));
        let registry = Arc::new(PartitionRegistry::new());
        registry.register(partition.clone()).unwrap();
        let wal = Arc::new(MemoryWal::new());
        let options = TxnManagerOptions {
            flush_threshold: usize::MAX,
            ..TxnManagerOptions::default()
        };
        let manager = Arc::new(TransactionManager::new(wal.clone(), registry, options, Arc::new(Metrics::new())));
        (manager, partition, wal)
    }

    fn write_entry(ctx: &TxnContext, id: u64, cn: &str) {
        let shared = ctx.current().unwrap().read_write_txn().unwrap();
        let dn = Dn::parse(&format!("cn={},dc=example", cn)).unwrap();
        shared.add_write(DnSet::new(dn.clone(), SearchScope::Object));
        shared
            .add_log_edit(
                DataChangeContainer::new(suffix(), id).add_entry(Entry::new(dn).with_attribute("cn", &[cn])),
            )
            .unwrap();
    }

    #[test]
    fn test_begin_commit_read_write() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();

        manager.begin(&mut ctx, false).unwrap();
        let start = ctx.current().unwrap().start_time();
        assert_eq!(start, 1);
        write_entry(&ctx, 1, "a");
        manager.commit(&mut ctx).unwrap();

        assert!(!ctx.has_transaction());
        assert_eq!(manager.latest_committed_lsn(), 2);
        assert_eq!(manager.committed_queue_lsns(), vec![UNKNOWN_LSN, 2]);
    }

    #[test]
    fn test_double_begin_rejected() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        assert!(matches!(manager.begin(&mut ctx, false), Err(Error::IllegalState { .. })));
        assert!(matches!(manager.begin(&mut ctx, true), Err(Error::IllegalState { .. })));
        manager.abort(&mut ctx).unwrap();
    }

    #[test]
    fn test_reentrant_read_only_begin() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, true).unwrap();
        manager.begin(&mut ctx, true).unwrap();

        manager.commit(&mut ctx).unwrap();
        assert!(ctx.has_transaction());
        manager.commit(&mut ctx).unwrap();
        assert!(!ctx.has_transaction());
        assert!(matches!(manager.commit(&mut ctx), Err(Error::NoActiveTransaction)));
    }

    #[test]
    fn test_read_only_begin_never_logs() {
        let (manager, _partition, wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, true).unwrap();
        manager.commit(&mut ctx).unwrap();
        assert_eq!(wal.record_count(), 0);
    }

    #[test]
    fn test_read_only_pins_latest() {
        let (manager, _partition, _wal) = setup();
        let mut writer = TxnContext::new();
        manager.begin(&mut writer, false).unwrap();
        write_entry(&writer, 1, "a");
        manager.commit(&mut writer).unwrap();

        let mut reader = TxnContext::new();
        manager.begin(&mut reader, true).unwrap();
        let txn = reader.current().unwrap();
        assert_eq!(txn.start_time(), 2);
        let pinned = txn.dependencies().last().unwrap().clone();
        assert_eq!(pinned.ref_count(), 1);

        manager.commit(&mut reader).unwrap();
        assert_eq!(pinned.ref_count(), 0);
    }

    #[test]
    fn test_overlapping_writes_conflict() {
        let (manager, _partition, _wal) = setup();
        let mut a = TxnContext::new();
        let mut b = TxnContext::new();
        manager.begin(&mut a, false).unwrap();
        manager.begin(&mut b, false).unwrap();
        write_entry(&a, 1, "same");
        write_entry(&b, 1, "same");

        manager.commit(&mut b).unwrap();
        assert!(manager.commit(&mut a).unwrap_err().is_conflict());
        assert!(!a.has_transaction());
        assert_eq!(manager.metrics().snapshot().conflicts, 1);
        assert_eq!(manager.metrics().snapshot().aborts, 1);
    }

    #[test]
    fn test_abort_releases_pin_and_is_not_queued() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        let pinned = ctx.current().unwrap().dependencies()[0].clone();
        assert_eq!(pinned.ref_count(), 1);
        write_entry(&ctx, 1, "a");

        manager.abort(&mut ctx).unwrap();
        assert_eq!(pinned.ref_count(), 0);
        assert_eq!(manager.committed_queue_len(), 1);
        assert!(matches!(manager.abort(&mut ctx), Err(Error::NoActiveTransaction)));
    }

    #[test]
    fn test_suspend_resume() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        let suspended = manager.suspend(&mut ctx).unwrap();
        assert!(!ctx.has_transaction());

        // the context is free for other work while the handle is detached
        manager.begin(&mut ctx, true).unwrap();
        manager.commit(&mut ctx).unwrap();

        manager.resume(&mut ctx, suspended).unwrap();
        assert!(!ctx.current().unwrap().is_read_only());
        manager.commit(&mut ctx).unwrap();
        assert!(matches!(manager.suspend(&mut ctx), Err(Error::NoActiveTransaction)));
    }

    #[test]
    fn test_resume_into_busy_context_fails() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, true).unwrap();
        let suspended = manager.suspend(&mut ctx).unwrap();

        manager.begin(&mut ctx, true).unwrap();
        assert!(matches!(manager.resume(&mut ctx, suspended), Err(Error::IllegalState { .. })));
        manager.commit(&mut ctx).unwrap();
    }

    #[test]
    fn test_dropped_transactions_release_flush() {
        let (manager, partition, wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        write_entry(&ctx, 1, "a");
        manager.commit(&mut ctx).unwrap();

        let mut reader = TxnContext::new();
        manager.begin(&mut reader, true).unwrap();
        let mut writer = TxnContext::new();
        manager.begin(&mut writer, false).unwrap();
        let suspended = manager.suspend(&mut writer).unwrap();
        let pinned = suspended.dependencies()[0].clone();
        assert_eq!(pinned.ref_count(), 2);

        for (id, cn) in [(2, "b"), (3, "c")] {
            manager.begin(&mut ctx, false).unwrap();
            write_entry(&ctx, id, cn);
            manager.commit(&mut ctx).unwrap();
        }

        // both pins hold the flush at the first commit
        manager.apply_pending().unwrap();
        assert_eq!(partition.entry_count(), 1);
        assert_eq!(manager.committed_queue_len(), 3);

        drop(reader);
        drop(suspended);
        assert_eq!(pinned.ref_count(), 0);

        manager.apply_pending().unwrap();
        assert_eq!(partition.entry_count(), 3);
        assert_eq!(manager.latest_flushed_lsn(), manager.latest_committed_lsn());
        assert_eq!(manager.committed_queue_len(), 1);
        assert_eq!(wal.record_count(), 0);

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.aborts, 2);
    }

    #[test]
    fn test_dropping_committed_handle_is_noop() {
        let (manager, _partition, _wal) = setup();
        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        write_entry(&ctx, 1, "a");
        manager.commit(&mut ctx).unwrap();
        drop(ctx);

        let snapshot = manager.metrics().snapshot();
        assert_eq!((snapshot.commits, snapshot.aborts, snapshot.in_flight), (1, 0, 0));
    }

    #[test]
    fn test_flush_applies_and_trims_queue() {
        let (manager, partition, wal) = setup();
        let mut ctx = TxnContext::new();
        for (id, cn) in [(1, "a"), (2, "b")] {
            manager.begin(&mut ctx, false).unwrap();
            write_entry(&ctx, id, cn);
            manager.commit(&mut ctx).unwrap();
        }

        manager.apply_pending().unwrap();
        assert_eq!(partition.entry_count(), 2);
        assert_eq!(manager.latest_flushed_lsn(), manager.latest_committed_lsn());
        // only the latest committed stays queued
        assert_eq!(manager.committed_queue_len(), 1);
        assert!(partition.sync_count() >= 1);
        // nothing open and everything flushed, so the WAL was truncated
        assert_eq!(wal.record_count(), 0);
    }

    #[test]
    fn test_options_from_json() {
        let options = TxnManagerOptions::from_json(r#"{"flush_interval_ms": 5, "max_retries": 9}"#).unwrap();
        assert_eq!(options.flush_interval(), Duration::from_millis(5));
        assert_eq!(options.max_retries, 9);
        assert_eq!(options.flush_threshold, DEFAULT_FLUSH_THRESHOLD);
        assert!(TxnManagerOptions::from_json("{\"flush_interval_ms\": \"soon\"}").is_err());
    }

    #[test]
    fn test_background_flush_runs() {
        let partition = Arc::new(MemoryPartition::new(suffix()));
        let registry = Arc::new(PartitionRegistry::new());
        registry.register(partition.clone()).unwrap();
        let options = TxnManagerOptions {
            flush_interval_ms: 5,
            ..TxnManagerOptions::default()
        };
        let manager = Arc::new(TransactionManager::new(
            Arc::new(MemoryWal::new()),
            registry,
            options,
            Arc::new(Metrics::new()),
        ));
        manager.start_background_flush().unwrap();

        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        write_entry(&ctx, 1, "a");
        manager.commit(&mut ctx).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while partition.entry_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(partition.entry_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_recover_replays_only_committed() {
        let (manager, _partition, wal) = setup();
        let mut committed = TxnContext::new();
        let mut aborted = TxnContext::new();
        let mut open = TxnContext::new();

        manager.begin(&mut committed, false).unwrap();
        manager.begin(&mut aborted, false).unwrap();
        manager.begin(&mut open, false).unwrap();
        for (ctx, id) in [(&committed, 1u64), (&aborted, 2), (&open, 3)] {
            let txn = ctx.current().unwrap();
            let container = DataChangeContainer {
                txn_id: txn.start_time(),
                ..DataChangeContainer::new(suffix(), id).add_entry(Entry::new(suffix()))
            };
            wal.log(&LogEdit::Data(container).encode().unwrap(), false).unwrap();
        }
        manager.commit(&mut committed).unwrap();
        manager.abort(&mut aborted).unwrap();

        let fresh = Arc::new(MemoryPartition::new(suffix()));
        let registry = Arc::new(PartitionRegistry::new());
        registry.register(fresh.clone()).unwrap();
        let replay = TransactionManager::new(wal, registry, TxnManagerOptions::default(), Arc::new(Metrics::new()));
        let stats = replay.recover().unwrap();

        assert_eq!(stats.transactions_replayed, 1);
        assert_eq!(stats.transactions_discarded, 2);
        assert_eq!(fresh.entry_count(), 1);
        assert!(fresh.get(1).unwrap().is_some());
        assert!(replay.latest_flushed_lsn() > UNKNOWN_LSN);
        manager.abort(&mut open).unwrap();
    }
}
