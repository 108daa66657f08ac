use crate::core::errors::*;
use crate::core::index::{IndexCursor, IndexEntry, IndexOrder};
use crate::core::metrics::Metrics;
use std::cmp::Ordering as CmpOrdering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the reaper needs from a cursor it may have to force-close.
pub trait LeakableCursor: Send + Sync {
    fn id(&self) -> u64;

    fn opened_at(&self) -> Instant;

    /// Blocks a concurrent close until `unpin`. Returns false when the cursor
    /// is already closed.
    fn pin(&self) -> bool;

    fn unpin(&self);

    fn is_closed(&self) -> bool;

    /// Replaces the live cursor with a disk copy at the same position.
    /// Returns false when there was nothing left to spill.
    fn snapshot_to_disk(&self, dir: &Path) -> Result<bool>;
}

/// Read-only cursor over entries spilled to a file.
///
/// The file holds `[u32 len][json entry]` records in cursor order; only their
/// offsets stay in memory. The file is removed on close.
pub struct DiskSnapshotCursor {
    path: PathBuf,
    file: File,
    order: IndexOrder,
    offsets: Vec<u64>,
    // gap index, or the entry index the cursor is on
    position: usize,
    current: Option<IndexEntry>,
    closed: bool,
}

impl DiskSnapshotCursor {
    pub fn create(path: PathBuf, order: IndexOrder, entries: &[IndexEntry]) -> Result<Self> {
        let mut entries = entries.iter().cloned();
        Self::write_records(path, order, || Ok(entries.next()))
    }

    /// Streams `cursor` from its first entry straight into a new spill file.
    pub fn spill(path: PathBuf, order: IndexOrder, cursor: &mut dyn IndexCursor) -> Result<Self> {
        cursor.before_first()?;
        Self::write_records(path, order, || match cursor.next()? {
            true => cursor.get().map(Some),
            false => Ok(None),
        })
    }

    fn write_records<F>(path: PathBuf, order: IndexOrder, next_entry: F) -> Result<Self>
    where
        F: FnMut() -> Result<Option<IndexEntry>>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let offsets = match write_framed(&file, next_entry) {
            Ok(offsets) => offsets,
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %remove_err, "failed to remove partial spill file");
                }
                return Err(e);
            }
        };

        Ok(Self {
            path,
            file,
            order,
            offsets,
            position: 0,
            current: None,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    fn read_at(&mut self, idx: usize) -> Result<IndexEntry> {
        let offset = *self.offsets.get(idx).ok_or(Error::InvalidCursorPosition)?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len = [0u8; 4];
        self.file.read_exact(&mut len)?;
        let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
        self.file.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// First index whose entry does not satisfy `pred`; entries satisfying it
    /// must form a prefix.
    fn partition_point<F>(&mut self, pred: F) -> Result<usize>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let (mut lo, mut hi) = (0, self.offsets.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.read_at(mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn park(&mut self, gap: usize) -> Result<()> {
        self.ensure_open()?;
        self.position = gap;
        self.current = None;
        Ok(())
    }

    fn remove_file(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove spilled cursor file");
            }
        }
    }
}

/// Writes `[u32 len][json]` records until `next_entry` runs dry and returns
/// their offsets.
fn write_framed<F>(file: &File, mut next_entry: F) -> Result<Vec<u64>>
where
    F: FnMut() -> Result<Option<IndexEntry>>,
{
    let mut offsets = Vec::new();
    let mut offset = 0u64;
    let mut writer = BufWriter::new(file);
    while let Some(entry) = next_entry()? {
        let bytes = serde_json::to_vec(&entry).map_err(|e| Error::SerializationError {
            context: "spilled index entry".to_string(),
            error: e.to_string(),
        })?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
        offsets.push(offset);
        offset += 4 + bytes.len() as u64;
    }
    writer.flush()?;
    Ok(offsets)
}

impl IndexCursor for DiskSnapshotCursor {
    fn before_first(&mut self) -> Result<()> {
        self.park(0)
    }

    fn after_last(&mut self) -> Result<()> {
        let end = self.offsets.len();
        self.park(end)
    }

    fn before(&mut self, entry: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let order = self.order;
        let gap = self.partition_point(|e| order.compare(e, entry) == CmpOrdering::Less)?;
        self.park(gap)
    }

    fn after(&mut self, entry: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let order = self.order;
        let gap = self.partition_point(|e| order.compare(e, entry) != CmpOrdering::Greater)?;
        self.park(gap)
    }

    fn before_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let order = self.order;
        let gap = self.partition_point(|e| order.compare_key(e, target) == CmpOrdering::Less)?;
        self.park(gap)
    }

    fn after_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let order = self.order;
        let gap = self.partition_point(|e| order.compare_key(e, target) != CmpOrdering::Greater)?;
        self.park(gap)
    }

    fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let candidate = if self.current.is_some() { self.position + 1 } else { self.position };
        if candidate < self.offsets.len() {
            self.current = Some(self.read_at(candidate)?);
            self.position = candidate;
            Ok(true)
        } else {
            self.park(self.offsets.len())?;
            Ok(false)
        }
    }

    fn previous(&mut self) -> Result<bool> {
        self.ensure_open()?;
        match self.position.checked_sub(1) {
            Some(candidate) => {
                self.current = Some(self.read_at(candidate)?);
                self.position = candidate;
                Ok(true)
            }
            None => {
                self.park(0)?;
                Ok(false)
            }
        }
    }

    fn get(&self) -> Result<IndexEntry> {
        self.ensure_open()?;
        self.current.clone().ok_or(Error::InvalidCursorPosition)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.current = None;
            self.remove_file();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for DiskSnapshotCursor {
    fn drop(&mut self) {
        if !self.closed {
            self.remove_file();
        }
    }
}

/// Last positioning call or entry moved onto, replayed onto a spilled copy.
#[derive(Debug, Clone)]
enum Mark {
    BeforeFirst,
    AfterLast,
    Before(IndexEntry),
    After(IndexEntry),
    BeforeKey(IndexEntry),
    AfterKey(IndexEntry),
    On(IndexEntry),
}

impl Mark {
    fn replay(&self, cursor: &mut dyn IndexCursor) -> Result<()> {
        match self {
            Mark::BeforeFirst => cursor.before_first(),
            Mark::AfterLast => cursor.after_last(),
            Mark::Before(e) => cursor.before(e),
            Mark::After(e) => cursor.after(e),
            Mark::BeforeKey(e) => cursor.before_key(e),
            Mark::AfterKey(e) => cursor.after_key(e),
            Mark::On(e) => {
                cursor.before(e)?;
                if cursor.next()? {
                    Ok(())
                } else {
                    Err(Error::invariant("spilled cursor lost its current entry"))
                }
            }
        }
    }
}

enum Source {
    Live(Box<dyn IndexCursor>),
    Spilled(DiskSnapshotCursor),
    Closed,
}

impl Source {
    fn cursor(&mut self) -> Result<&mut dyn IndexCursor> {
        match self {
            Source::Live(cursor) => Ok(cursor.as_mut()),
            Source::Spilled(cursor) => Ok(cursor),
            Source::Closed => Err(Error::CursorClosed),
        }
    }
}

struct GuardState {
    source: Source,
    mark: Mark,
    pins: usize,
    close_requested: bool,
}

impl GuardState {
    fn close_source(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.source, Source::Closed) {
            Source::Live(mut cursor) => cursor.close(),
            Source::Spilled(mut cursor) => cursor.close(),
            Source::Closed => Ok(()),
        }
    }
}

struct GuardInner {
    id: u64,
    order: IndexOrder,
    opened_at: Instant,
    state: Mutex<GuardState>,
}

impl LeakableCursor for GuardInner {
    fn id(&self) -> u64 {
        self.id
    }

    fn opened_at(&self) -> Instant {
        self.opened_at
    }

    fn pin(&self) -> bool {
        let mut state = self.state.lock().recover_poison();
        if state.close_requested || matches!(state.source, Source::Closed) {
            return false;
        }
        state.pins += 1;
        true
    }

    fn unpin(&self) {
        let mut state = self.state.lock().recover_poison();
        state.pins = state.pins.saturating_sub(1);
        if state.pins == 0 && state.close_requested {
            if let Err(e) = state.close_source() {
                tracing::warn!(cursor = self.id, error = %e, "deferred cursor close failed");
            }
        }
    }

    fn is_closed(&self) -> bool {
        let state = self.state.lock().recover_poison();
        state.close_requested || matches!(state.source, Source::Closed)
    }

    fn snapshot_to_disk(&self, dir: &Path) -> Result<bool> {
        let mut state = self.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "guarded_cursor.state".to_string() })?;
        if state.close_requested {
            return Ok(false);
        }
        let GuardState { source, mark, .. } = &mut *state;
        let Source::Live(live) = source else {
            return Ok(false);
        };

        let path = dir.join(format!("dirtxn-cursor-{}-{}.spill", std::process::id(), self.id));
        let spilled = DiskSnapshotCursor::spill(path, self.order, live.as_mut())
            .and_then(|mut disk| mark.replay(&mut disk).map(|_| disk));
        let disk = match spilled {
            Ok(disk) => disk,
            Err(e) => {
                // leave the live cursor usable where it was
                if let Err(replay_err) = mark.replay(live.as_mut()) {
                    tracing::warn!(cursor = self.id, error = %replay_err, "restoring live cursor position failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = live.close() {
            tracing::warn!(cursor = self.id, error = %e, "closing live cursor after spill failed");
        }
        *source = Source::Spilled(disk);
        Ok(true)
    }
}

/// Index cursor the reaper can take over.
///
/// Every call goes through one mutex, so a spill only ever happens between
/// two calls and the caller keeps its position.
pub struct GuardedCursor {
    inner: Arc<GuardInner>,
}

impl GuardedCursor {
    pub fn new(id: u64, order: IndexOrder, cursor: Box<dyn IndexCursor>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                id,
                order,
                opened_at: Instant::now(),
                state: Mutex::new(GuardState {
                    source: Source::Live(cursor),
                    mark: Mark::BeforeFirst,
                    pins: 0,
                    close_requested: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the reaper has replaced the live cursor with a disk copy.
    pub fn is_spilled(&self) -> bool {
        let state = self.inner.state.lock().recover_poison();
        matches!(state.source, Source::Spilled(_))
    }

    pub fn leakable(&self) -> Weak<dyn LeakableCursor> {
        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        weak
    }

    fn position<F>(&mut self, mark: Mark, op: F) -> Result<()>
    where
        F: FnOnce(&mut dyn IndexCursor) -> Result<()>,
    {
        let mut state = self.inner.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "guarded_cursor.state".to_string() })?;
        if state.close_requested {
            return Err(Error::CursorClosed);
        }
        op(state.source.cursor()?)?;
        state.mark = mark;
        Ok(())
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let mut state = self.inner.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "guarded_cursor.state".to_string() })?;
        if state.close_requested {
            return Err(Error::CursorClosed);
        }
        let cursor = state.source.cursor()?;
        let moved = if forward { cursor.next()? } else { cursor.previous()? };
        let mark = match (moved, forward) {
            (true, _) => Mark::On(cursor.get()?),
            (false, true) => Mark::AfterLast,
            (false, false) => Mark::BeforeFirst,
        };
        state.mark = mark;
        Ok(moved)
    }
}

impl IndexCursor for GuardedCursor {
    fn before_first(&mut self) -> Result<()> {
        self.position(Mark::BeforeFirst, |c| c.before_first())
    }

    fn after_last(&mut self) -> Result<()> {
        self.position(Mark::AfterLast, |c| c.after_last())
    }

    fn before(&mut self, entry: &IndexEntry) -> Result<()> {
        self.position(Mark::Before(entry.clone()), |c| c.before(entry))
    }

    fn after(&mut self, entry: &IndexEntry) -> Result<()> {
        self.position(Mark::After(entry.clone()), |c| c.after(entry))
    }

    fn before_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.position(Mark::BeforeKey(target.clone()), |c| c.before_key(target))
    }

    fn after_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.position(Mark::AfterKey(target.clone()), |c| c.after_key(target))
    }

    fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    fn previous(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn get(&self) -> Result<IndexEntry> {
        let mut state = self.inner.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "guarded_cursor.state".to_string() })?;
        if state.close_requested {
            return Err(Error::CursorClosed);
        }
        state.source.cursor()?.get()
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.inner.state.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "guarded_cursor.state".to_string() })?;
        if state.pins > 0 {
            state.close_requested = true;
            return Ok(());
        }
        state.close_source()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Drop for GuardedCursor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing dropped cursor failed");
        }
    }
}

#[derive(Default)]
struct ReaperState {
    shutdown: bool,
}

#[derive(Default)]
struct ReaperControl {
    state: Mutex<ReaperState>,
    cond: Condvar,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub spilled: usize,
    pub failed: usize,
    pub tracked: usize,
}

/// Watches registered cursors and spills the ones held open past the timeout.
pub struct CursorReaper {
    cursors: Mutex<Vec<Weak<dyn LeakableCursor>>>,
    timeout: Duration,
    spill_dir: PathBuf,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
    control: Arc<ReaperControl>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CursorReaper {
    pub fn new(timeout: Duration, spill_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        Self {
            cursors: Mutex::new(Vec::new()),
            timeout,
            spill_dir,
            metrics,
            next_id: AtomicU64::new(1),
            control: Arc::new(ReaperControl::default()),
            thread: Mutex::new(None),
        }
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Wraps a cursor and starts tracking it.
    pub fn guard(&self, order: IndexOrder, cursor: Box<dyn IndexCursor>) -> Result<GuardedCursor> {
        let guarded = GuardedCursor::new(self.next_id.fetch_add(1, Ordering::SeqCst), order, cursor);
        self.register(guarded.leakable())?;
        Ok(guarded)
    }

    pub fn register(&self, cursor: Weak<dyn LeakableCursor>) -> Result<()> {
        let mut cursors = self.cursors.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "cursor_reaper.cursors".to_string() })?;
        cursors.push(cursor);
        Ok(())
    }

    pub fn tracked(&self) -> usize {
        self.cursors.lock().recover_poison().len()
    }

    /// Spills every tracked cursor open longer than the timeout. A cursor that
    /// fails to spill is logged and dropped from tracking; the sweep goes on.
    pub fn sweep(&self) -> SweepReport {
        let candidates: Vec<Arc<dyn LeakableCursor>> = {
            let mut cursors = self.cursors.lock().recover_poison();
            cursors.retain(|weak| weak.upgrade().map(|c| !c.is_closed()).unwrap_or(false));
            cursors.iter().filter_map(Weak::upgrade).collect()
        };

        let mut report = SweepReport::default();
        let mut done = Vec::new();
        for cursor in candidates {
            let age = cursor.opened_at().elapsed();
            if age < self.timeout {
                continue;
            }
            if !cursor.pin() {
                done.push(cursor.id());
                continue;
            }
            let result = if cursor.is_closed() {
                Ok(false)
            } else {
                cursor.snapshot_to_disk(&self.spill_dir)
            };
            cursor.unpin();

            match result {
                Ok(true) => {
                    tracing::warn!(
                        cursor = cursor.id(),
                        age_ms = age.as_millis() as u64,
                        "leaked cursor spilled to disk"
                    );
                    self.metrics.on_cursor_reaped();
                    report.spilled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(cursor = cursor.id(), error = %e, "failed to spill leaked cursor");
                    self.metrics.on_cursor_reap_failure();
                    report.failed += 1;
                }
            }
            done.push(cursor.id());
        }

        let mut cursors = self.cursors.lock().recover_poison();
        cursors.retain(|weak| match weak.upgrade() {
            Some(cursor) => !done.contains(&cursor.id()),
            None => false,
        });
        report.tracked = cursors.len();
        report
    }

    pub fn start(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut slot = self.thread.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "cursor_reaper.thread".to_string() })?;
        if slot.is_some() {
            return Ok(());
        }
        let control = self.control.clone();
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("dirtxn-cursor-reaper".to_string())
            .spawn(move || reaper_loop(control, weak, interval))?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.control.state.lock().recover_poison();
            state.shutdown = true;
        }
        self.control.cond.notify_all();

        let handle = self.thread.lock().recover_poison().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CursorReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reaper_loop(control: Arc<ReaperControl>, weak: Weak<CursorReaper>, interval: Duration) {
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

        let Some(reaper) = weak.upgrade() else {
            break;
        };
        drop(state);
        reaper.sweep();
        drop(reaper);
        state = control.state.lock().recover_poison();
    }
}
