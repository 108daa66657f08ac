use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Engine counters. Relaxed atomics; a snapshot is for monitoring only.
#[derive(Debug, Default)]
pub struct Metrics {
    read_write_begins: AtomicU64,
    read_only_begins: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    in_flight: AtomicUsize,
    conflicts: AtomicU64,

    flush_passes: AtomicU64,
    transactions_flushed: AtomicU64,
    flush_micros: AtomicU64,
    peak_committed_queue: AtomicUsize,
    flush_failures: AtomicU64,

    wal_records: AtomicU64,
    wal_bytes: AtomicU64,
    checkpoints: AtomicU64,
    recovered_transactions: AtomicU64,

    cursors_reaped: AtomicU64,
    cursor_reap_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub read_write_begins: u64,
    pub read_only_begins: u64,
    pub commits: u64,
    pub aborts: u64,
    pub in_flight: usize,
    pub conflicts: u64,
    /// Share of commit attempts rejected by conflict verification.
    pub conflict_ratio: f64,

    pub flush_passes: u64,
    pub transactions_flushed: u64,
    pub mean_flush_micros: u64,
    pub peak_committed_queue: usize,
    pub flush_failures: u64,

    pub wal_records: u64,
    pub wal_bytes: u64,
    pub checkpoints: u64,
    pub recovered_transactions: u64,

    pub cursors_reaped: u64,
    pub cursor_reap_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_begin(&self, read_only: bool) {
        if read_only {
            bump(&self.read_only_begins);
        } else {
            bump(&self.read_write_begins);
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_commit(&self) {
        bump(&self.commits);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_abort(&self) {
        bump(&self.aborts);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counted in addition to the abort that follows it.
    pub fn on_conflict(&self) {
        bump(&self.conflicts);
    }

    pub fn on_flush_pass(&self, flushed: usize, queue_len: usize, elapsed: Duration) {
        bump(&self.flush_passes);
        self.transactions_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
        self.flush_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.peak_committed_queue.fetch_max(queue_len, Ordering::Relaxed);
    }

    pub fn on_flush_failure(&self) {
        bump(&self.flush_failures);
    }

    pub fn on_wal_append(&self, bytes: u64) {
        bump(&self.wal_records);
        self.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_checkpoint(&self) {
        bump(&self.checkpoints);
    }

    pub fn on_recovered(&self, transactions: usize) {
        self.recovered_transactions.fetch_add(transactions as u64, Ordering::Relaxed);
    }

    pub fn on_cursor_reaped(&self) {
        bump(&self.cursors_reaped);
    }

    pub fn on_cursor_reap_failure(&self) {
        bump(&self.cursor_reap_failures);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let commits = load(&self.commits);
        let conflicts = load(&self.conflicts);
        let flush_passes = load(&self.flush_passes);

        MetricsSnapshot {
            read_write_begins: load(&self.read_write_begins),
            read_only_begins: load(&self.read_only_begins),
            commits,
            aborts: load(&self.aborts),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            conflicts,
            conflict_ratio: match commits + conflicts {
                0 => 0.0,
                attempts => conflicts as f64 / attempts as f64,
            },

            flush_passes,
            transactions_flushed: load(&self.transactions_flushed),
            mean_flush_micros: load(&self.flush_micros).checked_div(flush_passes).unwrap_or(0),
            peak_committed_queue: self.peak_committed_queue.load(Ordering::Relaxed),
            flush_failures: load(&self.flush_failures),

            wal_records: load(&self.wal_records),
            wal_bytes: load(&self.wal_bytes),
            checkpoints: load(&self.checkpoints),
            recovered_transactions: load(&self.recovered_transactions),

            cursors_reaped: load(&self.cursors_reaped),
            cursor_reap_failures: load(&self.cursor_reap_failures),
        }
    }
}
