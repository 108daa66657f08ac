use crate::core::errors::*;
use crate::core::index::{IndexCursor, IndexEntry, KeyLock, SortedIndexSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// In the gap before the entry at this index (`end` means after the last).
    Gap(usize),
    /// On the entry at this index.
    On(usize),
}

/// Cursor over one in-memory sorted index set.
///
/// Used for a transaction's own index adds and for `MemoryPartition` indexes.
/// The set is a shared snapshot, so positions are plain indices and a change of
/// direction just steps back from the current index instead of rescanning.
///
/// With a key lock the cursor never leaves the run of entries sharing the
/// locked key: stepping past either boundary returns `false` and parks the
/// cursor at that boundary, so a move in the other direction resumes from the
/// boundary entry.
pub struct TxnIndexCursor {
    set: Arc<SortedIndexSet>,
    lock: Option<KeyLock>,
    start: usize,
    end: usize,
    position: Position,
    closed: bool,
}

impl TxnIndexCursor {
    pub fn new(set: Arc<SortedIndexSet>, lock: Option<KeyLock>) -> Result<Self> {
        if let Some(lock) = &lock {
            lock.validate(set.order())?;
        }
        let (start, end) = set.lock_range(lock.as_ref());
        Ok(Self {
            set,
            lock,
            start,
            end,
            position: Position::Gap(start),
            closed: false,
        })
    }

    pub fn lock(&self) -> Option<&KeyLock> {
        self.lock.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    fn park(&mut self, gap: usize) {
        self.position = Position::Gap(gap.clamp(self.start, self.end));
    }
}

impl IndexCursor for TxnIndexCursor {
    fn before_first(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.park(self.start);
        Ok(())
    }

    fn after_last(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.park(self.end);
        Ok(())
    }

    fn before(&mut self, entry: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let gap = self.set.lower_bound(entry);
        self.park(gap);
        Ok(())
    }

    fn after(&mut self, entry: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let gap = self.set.upper_bound(entry);
        self.park(gap);
        Ok(())
    }

    fn before_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let gap = self.set.key_lower_bound(target);
        self.park(gap);
        Ok(())
    }

    fn after_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.ensure_open()?;
        let gap = self.set.key_upper_bound(target);
        self.park(gap);
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let candidate = match self.position {
            Position::Gap(gap) => gap,
            Position::On(idx) => idx + 1,
        };
        if candidate < self.end {
            self.position = Position::On(candidate);
            Ok(true)
        } else {
            self.position = Position::Gap(self.end);
            Ok(false)
        }
    }

    fn previous(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let candidate = match self.position {
            Position::Gap(gap) => gap.checked_sub(1),
            Position::On(idx) => idx.checked_sub(1),
        };
        match candidate {
            Some(idx) if idx >= self.start => {
                self.position = Position::On(idx);
                Ok(true)
            }
            _ => {
                self.position = Position::Gap(self.start);
                Ok(false)
            }
        }
    }

    fn get(&self) -> Result<IndexEntry> {
        self.ensure_open()?;
        match self.position {
            Position::On(idx) => self
                .set
                .get(idx)
                .cloned()
                .ok_or(Error::InvalidCursorPosition),
            Position::Gap(_) => Err(Error::InvalidCursorPosition),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
