use crate::core::dn::Dn;
use crate::core::errors::*;
use crate::core::index::{IndexCursor, IndexEntry, IndexOrder, KeyLock};
use crate::core::transaction::ReadWriteTransaction;
use crate::core::txn_index_cursor::TxnIndexCursor;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOp {
    Positioned,
    Next,
    Previous,
}

/// Merges a partition index cursor with the in-memory index adds of every
/// dependency transaction.
///
/// Constituent cursor 0 is the partition's; cursor `i > 0` walks the adds of
/// dependency `i - 1` and is absent when that transaction added nothing to
/// this index. An entry supplied by cursor `i` is hidden when any dependency
/// from `i - 1` onward (or any dependency at all, for the partition cursor)
/// deleted it.
pub struct IndexCursorWrapper {
    partition_dn: Dn,
    attribute_oid: String,
    order: IndexOrder,
    dependencies: Vec<Arc<ReadWriteTransaction>>,
    cursors: Vec<Option<Box<dyn IndexCursor>>>,
    values: Vec<Option<IndexEntry>>,
    /// Cursors that supplied `current`.
    suppliers: Vec<usize>,
    current: Option<IndexEntry>,
    last_op: LastOp,
    closed: bool,
}

impl IndexCursorWrapper {
    pub fn new(
        store_cursor: Box<dyn IndexCursor>,
        dependencies: Vec<Arc<ReadWriteTransaction>>,
        partition_dn: Dn,
        attribute_oid: &str,
        order: IndexOrder,
        lock: Option<KeyLock>,
    ) -> Result<Self> {
        let attribute_oid = attribute_oid.to_lowercase();

        let mut cursors: Vec<Option<Box<dyn IndexCursor>>> = Vec::with_capacity(dependencies.len() + 1);
        cursors.push(Some(store_cursor));
        for dependency in &dependencies {
            let cursor = match dependency.index_adds(&partition_dn, &attribute_oid, order) {
                Some(adds) => Some(Box::new(TxnIndexCursor::new(adds, lock.clone())?) as Box<dyn IndexCursor>),
                None => None,
            };
            cursors.push(cursor);
        }

        Ok(Self {
            partition_dn,
            attribute_oid,
            order,
            values: vec![None; cursors.len()],
            dependencies,
            cursors,
            suppliers: Vec::new(),
            current: None,
            last_op: LastOp::Positioned,
            closed: false,
        })
    }

    pub fn order(&self) -> IndexOrder {
        self.order
    }

    /// Number of dependency transactions contributing an adds cursor.
    pub fn merged_transactions(&self) -> usize {
        self.cursors.iter().skip(1).filter(|c| c.is_some()).count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    fn reposition<F>(&mut self, mut position: F) -> Result<()>
    where
        F: FnMut(&mut dyn IndexCursor) -> Result<()>,
    {
        self.ensure_open()?;
        for cursor in self.cursors.iter_mut().flatten() {
            position(cursor.as_mut())?;
        }
        self.values.iter_mut().for_each(|v| *v = None);
        self.suppliers.clear();
        self.current = None;
        self.last_op = LastOp::Positioned;
        Ok(())
    }

    fn advance(&mut self, idx: usize, forward: bool) -> Result<Option<IndexEntry>> {
        let Some(cursor) = self.cursors[idx].as_mut() else {
            return Ok(None);
        };
        let moved = if forward { cursor.next()? } else { cursor.previous()? };
        if moved {
            Ok(Some(cursor.get()?))
        } else {
            Ok(None)
        }
    }

    /// Whether `value` lies strictly past `bound` in the direction of travel.
    fn beyond(&self, value: &IndexEntry, bound: &IndexEntry, forward: bool) -> bool {
        let cmp = self.order.compare(value, bound);
        if forward {
            cmp == Ordering::Greater
        } else {
            cmp == Ordering::Less
        }
    }

    fn is_shadowed(&self, entry: &IndexEntry, supplier: usize) -> bool {
        self.dependencies[supplier.saturating_sub(1)..]
            .iter()
            .any(|dep| dep.is_index_entry_deleted(&self.partition_dn, &self.attribute_oid, entry))
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        self.ensure_open()?;
        let op = if forward { LastOp::Next } else { LastOp::Previous };

        if self.last_op == op {
            for idx in std::mem::take(&mut self.suppliers) {
                self.values[idx] = self.advance(idx, forward)?;
            }
        } else {
            let bound = match self.last_op {
                LastOp::Positioned => None,
                _ => self.current.clone(),
            };
            for idx in 0..self.cursors.len() {
                let mut value = self.advance(idx, forward)?;
                if let Some(bound) = &bound {
                    while matches!(&value, Some(v) if !self.beyond(v, bound, forward)) {
                        value = self.advance(idx, forward)?;
                    }
                }
                self.values[idx] = value;
            }
            self.suppliers.clear();
        }
        self.last_op = op;

        loop {
            let best = self
                .values
                .iter()
                .flatten()
                .min_by(|a, b| {
                    let cmp = self.order.compare(a, b);
                    if forward {
                        cmp
                    } else {
                        cmp.reverse()
                    }
                })
                .cloned();

            let Some(best) = best else {
                self.current = None;
                return Ok(false);
            };

            // the same tuple may come from several cursors once a referenced
            // transaction has been flushed into the partition
            let suppliers: Vec<usize> = self
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| matches!(v, Some(v) if self.order.compare(v, &best) == Ordering::Equal))
                .map(|(idx, _)| idx)
                .collect();
            let newest = suppliers.last().copied().unwrap_or(0);

            if self.is_shadowed(&best, newest) {
                for idx in suppliers {
                    self.values[idx] = self.advance(idx, forward)?;
                }
                continue;
            }

            self.current = Some(best);
            self.suppliers = suppliers;
            return Ok(true);
        }
    }
}

impl IndexCursor for IndexCursorWrapper {
    fn before_first(&mut self) -> Result<()> {
        self.reposition(|c| c.before_first())
    }

    fn after_last(&mut self) -> Result<()> {
        self.reposition(|c| c.after_last())
    }

    fn before(&mut self, entry: &IndexEntry) -> Result<()> {
        self.reposition(|c| c.before(entry))
    }

    fn after(&mut self, entry: &IndexEntry) -> Result<()> {
        self.reposition(|c| c.after(entry))
    }

    fn before_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.reposition(|c| c.before_key(target))
    }

    fn after_key(&mut self, target: &IndexEntry) -> Result<()> {
        self.reposition(|c| c.after_key(target))
    }

    fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    fn previous(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn get(&self) -> Result<IndexEntry> {
        self.ensure_open()?;
        self.current.clone().ok_or(Error::InvalidCursorPosition)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        let mut first_err = None;
        for cursor in self.cursors.iter_mut().flatten() {
            if let Err(e) = cursor.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
