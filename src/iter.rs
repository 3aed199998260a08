//! Stateful iterators over a `LineTable`.
//!
//! Two modes with different contracts:
//!
//! - [`Iter`] borrows the table, so the compiler already rules out mutation
//!   and lookups for its whole lifetime (even a lookup can rehash a bucket
//!   and move elements). A fingerprint of the table state is recorded at the
//!   first advance and re-checked when the iterator is dropped, as a guard
//!   on the same invariant. Every element is returned exactly once.
//! - [`SafeIter`] is a detached cursor: each advance takes the table as an
//!   argument, so the table may be mutated between advances. Rehashing and
//!   automatic shrinking are paused from the first advance until
//!   [`SafeIter::finish`], keeping elements from moving underneath the
//!   cursor.

use std::marker::PhantomData;

use crate::bucket::SLOTS_PER_BUCKET;
use crate::cursor::next_cursor;
use crate::table::{exp_to_mask, num_buckets, LineTable};
use crate::types::TableType;

/// Shared slot-then-bucket-then-table traversal state.
///
/// Table 0 is walked in cursor order starting from the rehash cursor, so
/// buckets whose elements have already moved to table 1 are skipped and
/// nothing is seen twice. Table 1 is walked linearly.
#[derive(Default)]
struct IterState {
    table: usize,
    index: usize,
    pos: usize,
    started: bool,
    done: bool,
}

impl IterState {
    /// Advance to the next occupied slot, as (table, bucket, slot)
    fn advance<T: TableType>(&mut self, t: &LineTable<T>) -> Option<(usize, usize, usize)> {
        if self.done {
            return None;
        }
        loop {
            if !self.started {
                self.started = true;
                self.table = 0;
                self.pos = 0;
                // skip the buckets that rehashing has already drained
                self.index = t.rehash_idx.unwrap_or(0);
                if num_buckets(t.bucket_exp[0]) == 0 && !self.next_table(t) {
                    return None;
                }
            } else {
                self.pos += 1;
                if self.pos == SLOTS_PER_BUCKET {
                    self.pos = 0;
                    if !self.next_bucket(t) {
                        return None;
                    }
                }
            }
            let buckets = t.buckets(self.table);
            if self.index >= buckets.len() {
                // the table was resized underneath a paused cursor
                self.done = true;
                return None;
            }
            if buckets[self.index].is_present(self.pos) {
                return Some((self.table, self.index, self.pos));
            }
        }
    }

    fn next_bucket<T: TableType>(&mut self, t: &LineTable<T>) -> bool {
        if self.table == 0 {
            self.index = next_cursor(self.index, exp_to_mask(t.bucket_exp[0]));
            if self.index == 0 {
                return self.next_table(t);
            }
            true
        } else {
            self.index += 1;
            if self.index >= num_buckets(t.bucket_exp[1]) {
                self.done = true;
                return false;
            }
            true
        }
    }

    fn next_table<T: TableType>(&mut self, t: &LineTable<T>) -> bool {
        if self.table == 0 && t.is_rehashing() {
            self.table = 1;
            self.index = 0;
            self.pos = 0;
            true
        } else {
            self.done = true;
            false
        }
    }
}

/// Borrowing iterator over the elements of a [`LineTable`].
///
/// Created by [`LineTable::iter`]. Elements are returned by value, each
/// exactly once, in no particular order.
pub struct Iter<'a, T: TableType> {
    table: &'a LineTable<T>,
    state: IterState,
    fingerprint: u64,
}

impl<T: TableType> Iterator for Iter<'_, T> {
    type Item = T::Element;

    fn next(&mut self) -> Option<T::Element> {
        if !self.state.started {
            self.fingerprint = self.table.state_fingerprint();
        }
        let (table, idx, pos) = self.state.advance(self.table)?;
        Some(unsafe { self.table.buckets(table)[idx].element(pos) })
    }
}

impl<T: TableType> Drop for Iter<'_, T> {
    fn drop(&mut self) {
        if self.state.started {
            debug_assert_eq!(
                self.fingerprint,
                self.table.state_fingerprint(),
                "table mutated during iteration"
            );
        }
    }
}

impl<T: TableType> LineTable<T> {
    /// Iterate over all elements. See [`Iter`].
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            table: self,
            state: IterState::default(),
            fingerprint: 0,
        }
    }
}

impl<'a, T: TableType> IntoIterator for &'a LineTable<T> {
    type Item = T::Element;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator cursor that tolerates mutation between advances.
///
/// ```text
/// let mut it = SafeIter::new();
/// while let Some(elem) = it.next(&mut table) {
///     // table.replace(...), table.delete(...) are fine here
/// }
/// it.finish(&mut table);
/// ```
///
/// Guarantees:
///
/// - Elements present for the entire iteration are returned exactly once.
/// - Elements deleted or replaced after they have been returned are not
///   returned again.
/// - Elements replaced before being returned are returned in their new
///   form.
/// - Elements inserted during the iteration may or may not be returned. An
///   insertion can also expand the table, which migrates everything at
///   once; elements that move this way can be missed or repeated.
///
/// [`SafeIter::finish`] must be called when done, to resume rehashing and
/// automatic shrinking.
pub struct SafeIter<T: TableType> {
    state: IterState,
    paused: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T: TableType> SafeIter<T> {
    /// Create a cursor positioned before the first element
    pub fn new() -> Self {
        SafeIter {
            state: IterState::default(),
            paused: false,
            _marker: PhantomData,
        }
    }

    /// Advance to the next element. The first call pauses rehashing and
    /// automatic shrinking on the table.
    pub fn next(&mut self, table: &mut LineTable<T>) -> Option<T::Element> {
        if !self.paused {
            self.paused = true;
            table.pause_rehashing();
            table.pause_auto_shrink();
        }
        let (tab, idx, pos) = self.state.advance(table)?;
        Some(unsafe { table.buckets(tab)[idx].element(pos) })
    }

    /// End the iteration, resuming rehashing and automatic shrinking
    pub fn finish(self, table: &mut LineTable<T>) {
        if self.paused {
            table.resume_rehashing();
            table.resume_auto_shrink();
        }
    }
}

impl<T: TableType> Default for SafeIter<T> {
    fn default() -> Self {
        Self::new()
    }
}
