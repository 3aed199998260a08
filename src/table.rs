//! Core table: two bucket arrays with incremental rehashing between them.
//!
//! - Lookups probe the rehash destination first, then the source
//! - One rehash step per read (Allow policy) or per write (Avoid policy)
//! - Probing advances in scan-cursor order, so probe chains, rehash order
//!   and scan order all agree
//! - Fill limits have soft and hard variants; the hard ones apply while
//!   resizing should be avoided

use std::fmt;
use std::num::NonZeroUsize;

use crate::bucket::{Bucket, SLOTS_PER_BUCKET, SLOT_INDEX_BITS};
use crate::cursor::{next_cursor, prev_cursor};
use crate::types::TableType;
use crate::ResizePolicy;

/// Fill limits in percent. The soft limits drive resizing in normal
/// operation; the hard limits take over when the resize policy asks to
/// avoid moving memory. Open addressing cannot run past 100% fill, so even
/// under the Avoid policy the table expands eventually, just later.
const MAX_FILL_PERCENT_SOFT: usize = 77;
const MAX_FILL_PERCENT_HARD: usize = 90;
const MIN_FILL_PERCENT_SOFT: usize = 13;
const MIN_FILL_PERCENT_HARD: usize = 3;

/// Bucket count selection: NUM_BUCKETS = ceil(capacity * FACTOR / DIVISOR),
/// with a power-of-two divisor so the division is a shift. The ratio keeps
/// the post-resize fill at 76.19% on 64-bit hosts, just under the soft max.
#[cfg(target_pointer_width = "64")]
const BUCKET_FACTOR: usize = 3;
#[cfg(target_pointer_width = "64")]
const BUCKET_DIVISOR: usize = 16;
#[cfg(target_pointer_width = "32")]
const BUCKET_FACTOR: usize = 7;
#[cfg(target_pointer_width = "32")]
const BUCKET_DIVISOR: usize = 64;

const _: () = assert!(100 * BUCKET_DIVISOR / BUCKET_FACTOR / SLOTS_PER_BUCKET <= MAX_FILL_PERCENT_SOFT);
const _: () = assert!(MAX_FILL_PERCENT_SOFT <= MAX_FILL_PERCENT_HARD);
const _: () = assert!(MAX_FILL_PERCENT_HARD < 100);

#[inline]
pub(crate) fn num_buckets(exp: i8) -> usize {
    if exp < 0 {
        0
    } else {
        1usize << exp
    }
}

/// Bitmask for turning a hash into a bucket index
#[inline]
pub(crate) fn exp_to_mask(exp: i8) -> usize {
    if exp < 0 {
        0
    } else {
        (1usize << exp) - 1
    }
}

/// Fingerprint bits: the top byte of the hash, never used for bucket
/// selection
#[inline]
pub(crate) fn high_bits(hash: u64) -> u8 {
    (hash >> 56) as u8
}

/// Smallest exponent whose bucket count can hold `min_capacity` elements
/// below the soft fill limit
fn next_bucket_exp(min_capacity: usize) -> i8 {
    if min_capacity == 0 {
        return -1;
    }
    // ceil(x / y) = floor((x - 1) / y) + 1
    let min_buckets = (min_capacity.saturating_mul(BUCKET_FACTOR) - 1) / BUCKET_DIVISOR + 1;
    if min_buckets >= usize::MAX / 2 {
        return (usize::BITS - 1) as i8;
    }
    (usize::BITS - (min_buckets - 1).leading_zeros()) as i8
}

fn alloc_buckets<E: Copy>(num_buckets: usize, try_alloc: bool) -> Result<Box<[Bucket<E>]>, AllocError> {
    let mut buckets: Vec<Bucket<E>> = Vec::new();
    if try_alloc {
        if buckets.try_reserve_exact(num_buckets).is_err() {
            return Err(AllocError);
        }
    } else {
        buckets.reserve_exact(num_buckets);
    }
    buckets.resize(num_buckets, Bucket::EMPTY);
    Ok(buckets.into_boxed_slice())
}

/// Allocation failure reported by [`LineTable::try_expand`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("hash table allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// Opaque encoding of a slot location, handed out by
/// [`LineTable::find_position_for_insert`] and
/// [`LineTable::two_phase_pop_find`].
///
/// A position stays valid only as long as the table is not operated on in
/// between; see the two-phase methods for the exact contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position(NonZeroUsize);

impl Position {
    fn encode(bucket_index: usize, pos_in_bucket: usize, table_index: usize) -> Self {
        let mut encoded = bucket_index;
        encoded = (encoded << SLOT_INDEX_BITS) | pos_in_bucket;
        encoded = (encoded << 1) | table_index;
        // offset by one so the all-zero location is representable
        Position(NonZeroUsize::MIN.saturating_add(encoded))
    }

    fn decode(self) -> (usize, usize, usize) {
        let mut encoded = self.0.get() - 1;
        let table_index = encoded & 1;
        encoded >>= 1;
        let pos_in_bucket = encoded & ((1 << SLOT_INDEX_BITS) - 1);
        encoded >>= SLOT_INDEX_BITS;
        (encoded, pos_in_bucket, table_index)
    }
}

/// An open addressing hash table with cache-line sized buckets, incremental
/// rehashing and stateless scan.
///
/// Operations that read the table still take `&mut self`: under the Allow
/// resize policy every lookup performs one incremental rehash step, moving
/// one bucket of elements from the old table to the new one.
pub struct LineTable<T: TableType> {
    pub(crate) ops: T,
    /// tables[0] is the main table, tables[1] the rehashing target
    pub(crate) tables: [Option<Box<[Bucket<T::Element>]>>; 2],
    pub(crate) used: [usize; 2],
    /// Exponent per table; bucket count is 1 << exp, -1 means no table
    pub(crate) bucket_exp: [i8; 2],
    /// Next bucket to rehash, in cursor order. None when not rehashing.
    pub(crate) rehash_idx: Option<usize>,
    pub(crate) rehash_paused: u32,
    pub(crate) auto_shrink_paused: u32,
}

impl<T: TableType> LineTable<T> {
    /// Create an empty table described by the given type
    pub fn new(ops: T) -> Self {
        let _ = Bucket::<T::Element>::LAYOUT_OK;
        LineTable {
            ops,
            tables: [None, None],
            used: [0, 0],
            bucket_exp: [-1, -1],
            rehash_idx: None,
            rehash_paused: 0,
            auto_shrink_paused: 0,
        }
    }

    /// Get a reference to the type descriptor
    #[inline]
    pub fn ops(&self) -> &T {
        &self.ops
    }

    /// Get a mutable reference to the type descriptor
    #[inline]
    pub fn ops_mut(&mut self) -> &mut T {
        &mut self.ops
    }

    /// Number of elements stored
    #[inline]
    pub fn size(&self) -> usize {
        self.used[0] + self.used[1]
    }

    /// Check if the table holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Check if incremental rehashing is in progress
    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Check if incremental rehashing is paused
    #[inline]
    pub fn is_rehashing_paused(&self) -> bool {
        self.rehash_paused > 0
    }

    /// Old and new capacity while rehashing is in progress. Also usable
    /// from the rehashing hooks.
    pub fn rehashing_info(&self) -> Option<(usize, usize)> {
        self.rehash_idx?;
        Some((
            num_buckets(self.bucket_exp[0]) * SLOTS_PER_BUCKET,
            num_buckets(self.bucket_exp[1]) * SLOTS_PER_BUCKET,
        ))
    }

    /// Pause incremental rehashing. Pauses nest.
    pub fn pause_rehashing(&mut self) {
        self.rehash_paused += 1;
    }

    /// Resume incremental rehashing after a pause
    pub fn resume_rehashing(&mut self) {
        debug_assert!(self.rehash_paused > 0);
        self.rehash_paused -= 1;
    }

    /// Pause automatic shrinking, e.g. ahead of a bulk deletion that should
    /// not trigger several intermediate resizes. Pauses nest.
    pub fn pause_auto_shrink(&mut self) {
        self.auto_shrink_paused += 1;
    }

    /// Resume automatic shrinking and apply any shrink that became due
    pub fn resume_auto_shrink(&mut self) {
        debug_assert!(self.auto_shrink_paused > 0);
        self.auto_shrink_paused -= 1;
        if self.auto_shrink_paused == 0 {
            self.shrink_if_needed();
        }
    }

    #[inline]
    pub(crate) fn buckets(&self, table: usize) -> &[Bucket<T::Element>] {
        self.tables[table].as_deref().unwrap_or(&[])
    }

    #[inline]
    pub(crate) fn buckets_mut(&mut self, table: usize) -> &mut [Bucket<T::Element>] {
        self.tables[table].as_deref_mut().unwrap_or(&mut [])
    }

    fn reset_table(&mut self, table: usize) {
        self.tables[table] = None;
        self.used[table] = 0;
        self.bucket_exp[table] = -1;
    }

    #[inline]
    fn hash_element(&self, elem: &T::Element) -> u64 {
        self.ops.hash_key(self.ops.element_key(elem))
    }

    /// Hash of the parts of the table state that change whenever elements
    /// move. Borrowing iterators record it and verify it was stable.
    pub(crate) fn state_fingerprint(&self) -> u64 {
        let integers = [
            self.tables[0].as_deref().map_or(0, |b| b.as_ptr() as usize) as u64,
            self.bucket_exp[0] as u64,
            self.used[0] as u64,
            self.tables[1].as_deref().map_or(0, |b| b.as_ptr() as usize) as u64,
            self.bucket_exp[1] as u64,
            self.used[1] as u64,
        ];
        let mut hash: u64 = 0;
        for v in integers {
            hash = hash.wrapping_add(v);
            // Tomas Wang's 64 bit integer hash
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    // --- Incremental rehashing ---

    /// Called on reads. Writes already did a find, so they rehash under the
    /// Avoid policy instead, ensuring rehashing still finishes before the
    /// table needs to resize again.
    pub(crate) fn rehash_step_on_read(&mut self) {
        if self.rehash_idx.is_none() || self.rehash_paused > 0 {
            return;
        }
        if crate::resize_policy() != ResizePolicy::Allow {
            return;
        }
        self.rehash_step();
    }

    fn rehash_step_on_write(&mut self) {
        if self.rehash_idx.is_none() || self.rehash_paused > 0 {
            return;
        }
        if crate::resize_policy() != ResizePolicy::Avoid {
            return;
        }
        self.rehash_step();
    }

    /// Move the live elements of one source bucket into the new table and
    /// advance the rehash cursor
    fn rehash_step(&mut self) {
        let idx = match self.rehash_idx {
            Some(idx) => idx,
            None => return,
        };
        let mask = exp_to_mask(self.bucket_exp[0]);
        let shrinking = self.bucket_exp[1] < self.bucket_exp[0];
        // When shrinking, the element's primary bucket equals the source
        // index unless probing ever pushed elements past the predecessor,
        // so the hash only needs recomputing when that bucket was ever full.
        let index_is_hash = shrinking && !self.buckets(0)[prev_cursor(idx, mask)].ever_full();

        for pos in 0..SLOTS_PER_BUCKET {
            let (elem, fp) = {
                let b = &self.buckets(0)[idx];
                if !b.is_present(pos) {
                    continue;
                }
                (unsafe { b.element(pos) }, b.fingerprint(pos))
            };
            let hash = if index_is_hash {
                idx as u64
            } else {
                self.hash_element(&elem)
            };
            let (table, dst_idx, dst_pos) = self.find_slot_for_insert(hash);
            debug_assert_eq!(table, 1);
            let dst = &mut self.buckets_mut(1)[dst_idx];
            dst.put(dst_pos, fp, elem);
            dst.update_ever_full();
            self.used[0] -= 1;
            self.used[1] += 1;
        }
        // the source bucket is drained; its ever-full bit stays for probes
        self.buckets_mut(0)[idx].clear_all_present();

        let next = next_cursor(idx, mask);
        if next == 0 {
            self.finish_rehashing();
        } else {
            self.rehash_idx = Some(next);
        }
    }

    /// Promote the rehashing target to main table and drop the old one
    fn finish_rehashing(&mut self) {
        T::rehashing_completed(self);
        self.tables[0] = self.tables[1].take();
        self.bucket_exp[0] = self.bucket_exp[1];
        self.used[0] = self.used[1];
        self.reset_table(1);
        self.rehash_idx = None;
    }

    // --- Resizing ---

    fn resize(&mut self, min_capacity: usize, try_alloc: bool) -> Result<bool, AllocError> {
        // we don't resize to zero
        let min_capacity = min_capacity.max(1);

        let exp = next_bucket_exp(min_capacity);
        let buckets = num_buckets(exp);
        let new_capacity = match buckets.checked_mul(SLOTS_PER_BUCKET) {
            Some(capacity) => capacity,
            None => return Ok(false),
        };
        if new_capacity < min_capacity {
            return Ok(false);
        }
        let old_exp = self.bucket_exp[if self.is_rehashing() { 1 } else { 0 }];
        if exp == old_exp {
            return Ok(false);
        }

        // A resize can't start while rehashing is ongoing; fast-forward the
        // one in progress. Under the Avoid policy this can happen several
        // times in a row for pathological write patterns.
        while self.is_rehashing() {
            self.rehash_step();
        }

        let new_table = alloc_buckets::<T::Element>(buckets, try_alloc)?;
        self.bucket_exp[1] = exp;
        self.tables[1] = Some(new_table);
        self.used[1] = 0;
        self.rehash_idx = Some(0);
        T::rehashing_started(self);

        // an empty source completes immediately
        if self.tables[0].is_none() || self.used[0] == 0 {
            self.finish_rehashing();
        } else if self.ops.instant_rehashing() {
            while self.is_rehashing() {
                self.rehash_step();
            }
        }
        Ok(true)
    }

    fn expand_internal(&mut self, size: usize, try_alloc: bool) -> Result<bool, AllocError> {
        if size < self.size() {
            return Ok(false);
        }
        self.resize(size, try_alloc)
    }

    /// Expand to at least the given capacity. Returns whether the table
    /// grew; an allocation failure aborts the process.
    pub fn expand(&mut self, size: usize) -> bool {
        self.expand_internal(size, false).unwrap_or(false)
    }

    /// Fallible expand: `Ok(true)` if the table grew, `Ok(false)` if no
    /// resize was needed, `Err` if the allocation failed.
    pub fn try_expand(&mut self, size: usize) -> Result<bool, AllocError> {
        self.expand_internal(size, true)
    }

    /// Expand when the next insertion would push the write table past its
    /// fill limit. Runs on every insertion; after restoring the resize
    /// policy to Allow a caller may want to invoke it directly.
    pub fn expand_if_needed(&mut self) -> bool {
        let min_capacity = self.used[0] + self.used[1] + 1;
        let write_exp = self.bucket_exp[if self.is_rehashing() { 1 } else { 0 }];
        let current_capacity = num_buckets(write_exp) * SLOTS_PER_BUCKET;
        let max_fill = if crate::resize_policy() == ResizePolicy::Avoid {
            MAX_FILL_PERCENT_HARD
        } else {
            MAX_FILL_PERCENT_SOFT
        };
        if min_capacity * 100 <= current_capacity * max_fill {
            return false;
        }
        self.resize(min_capacity, false).unwrap_or(false)
    }

    /// Shrink when the main table's fill dropped below the minimum. Runs on
    /// every deletion unless paused.
    pub fn shrink_if_needed(&mut self) -> bool {
        if self.is_rehashing() || self.auto_shrink_paused > 0 {
            return false;
        }
        let policy = crate::resize_policy();
        if policy == ResizePolicy::Forbid {
            return false;
        }
        let current_capacity = num_buckets(self.bucket_exp[0]) * SLOTS_PER_BUCKET;
        let min_fill = if policy == ResizePolicy::Avoid {
            MIN_FILL_PERCENT_HARD
        } else {
            MIN_FILL_PERCENT_SOFT
        };
        if self.used[0] * 100 > current_capacity * min_fill {
            return false;
        }
        self.resize(self.used[0], false).unwrap_or(false)
    }

    // --- Lookup ---

    /// Probe for the slot holding the key. Returns (table, bucket, slot).
    fn find_slot(&mut self, hash: u64, key: &T::Key) -> Option<(usize, usize, usize)> {
        if self.size() == 0 {
            return None;
        }
        let fp = high_bits(hash);

        // do some incremental rehashing
        self.rehash_step_on_read();

        // Probe the rehashing destination first: it is newer and typically
        // has fewer ever-full buckets, so chains are shorter there.
        for table in (0..2).rev() {
            if self.used[table] == 0 {
                continue;
            }
            let mask = exp_to_mask(self.bucket_exp[table]);
            let mut bucket_idx = hash as usize & mask;
            let buckets = self.buckets(table);
            loop {
                let b = &buckets[bucket_idx];
                for pos in b.candidates(fp) {
                    let elem = unsafe { b.element_ref(pos) };
                    if self.ops.key_eq(key, self.ops.element_key(elem)) {
                        return Some((table, bucket_idx, pos));
                    }
                }
                if !b.ever_full() {
                    break;
                }
                bucket_idx = next_cursor(bucket_idx, mask);
            }
        }
        None
    }

    /// Look up an element by key
    pub fn find(&mut self, key: &T::Key) -> Option<T::Element> {
        if self.size() == 0 {
            return None;
        }
        let hash = self.ops.hash_key(key);
        let (table, idx, pos) = self.find_slot(hash, key)?;
        Some(unsafe { self.buckets(table)[idx].element(pos) })
    }

    /// First free slot for the hash, probing the write table in cursor
    /// order. Returns (table, bucket, slot).
    fn find_slot_for_insert(&self, hash: u64) -> (usize, usize, usize) {
        let table = if self.is_rehashing() { 1 } else { 0 };
        let mask = exp_to_mask(self.bucket_exp[table]);
        let buckets = self.buckets(table);
        debug_assert!(!buckets.is_empty());
        let mut bucket_idx = hash as usize & mask;
        loop {
            if let Some(pos) = buckets[bucket_idx].first_free() {
                return (table, bucket_idx, pos);
            }
            bucket_idx = next_cursor(bucket_idx, mask);
        }
    }

    // --- Insertion ---

    /// Insert without checking for an existing matching key; the caller has
    /// already ruled that out
    fn insert(&mut self, hash: u64, elem: T::Element) {
        self.expand_if_needed();
        self.rehash_step_on_write();
        let (table, idx, pos) = self.find_slot_for_insert(hash);
        let b = &mut self.buckets_mut(table)[idx];
        b.put(pos, high_bits(hash), elem);
        b.update_ever_full();
        self.used[table] += 1;
    }

    /// Add an element. Returns false if an element with the same key
    /// already exists.
    pub fn add(&mut self, elem: T::Element) -> bool {
        self.add_or_find(elem).is_ok()
    }

    /// Add an element, or surface the existing one with the same key
    pub fn add_or_find(&mut self, elem: T::Element) -> Result<(), T::Element> {
        let hash = self.hash_element(&elem);
        let existing = {
            let key = self.ops.element_key(&elem);
            self.find_slot(hash, key)
        };
        match existing {
            Some((table, idx, pos)) => Err(unsafe { self.buckets(table)[idx].element(pos) }),
            None => {
                self.insert(hash, elem);
                Ok(())
            }
        }
    }

    /// Add or overwrite. Returns true if a new element was inserted, false
    /// if an existing one was replaced (after running its destructor).
    pub fn replace(&mut self, elem: T::Element) -> bool {
        let hash = self.hash_element(&elem);
        let existing = {
            let key = self.ops.element_key(&elem);
            self.find_slot(hash, key)
        };
        match existing {
            Some((table, idx, pos)) => {
                let old = unsafe { self.buckets(table)[idx].element(pos) };
                self.ops.destroy_element(old);
                unsafe { *self.buckets_mut(table)[idx].element_mut(pos) = elem };
                false
            }
            None => {
                self.insert(hash, elem);
                true
            }
        }
    }

    /// First phase of a two-phase insert: locate the slot where an element
    /// with this key would go, without creating the element yet.
    ///
    /// Returns `Err` with the existing element if the key is already in the
    /// table. On `Ok`, pass the position to
    /// [`LineTable::insert_at_position`]. No other table operation may
    /// happen in between, not even a lookup: a read can trigger an
    /// incremental rehash step that moves elements and invalidates the
    /// position.
    pub fn find_position_for_insert(&mut self, key: &T::Key) -> Result<Position, T::Element> {
        let hash = self.ops.hash_key(key);
        if let Some((table, idx, pos)) = self.find_slot(hash, key) {
            return Err(unsafe { self.buckets(table)[idx].element(pos) });
        }
        self.expand_if_needed();
        self.rehash_step_on_write();
        let (table, idx, pos) = self.find_slot_for_insert(hash);
        // store the fingerprint now; the second phase then has no need to
        // hash the key again
        self.buckets_mut(table)[idx].set_fingerprint(pos, high_bits(hash));
        Ok(Position::encode(idx, pos, table))
    }

    /// Second phase of a two-phase insert. The element must carry the key
    /// that produced the position.
    pub fn insert_at_position(&mut self, elem: T::Element, position: Position) {
        let (idx, pos, table) = position.decode();
        let b = &mut self.buckets_mut(table)[idx];
        assert!(!b.is_present(pos), "position used after table mutation");
        // the fingerprint was stored when the position was handed out
        b.occupy(pos, elem);
        b.update_ever_full();
        self.used[table] += 1;
    }

    // --- Deletion ---

    /// Remove and return the element matching the key. The destructor is
    /// not called.
    pub fn pop(&mut self, key: &T::Key) -> Option<T::Element> {
        if self.size() == 0 {
            return None;
        }
        let hash = self.ops.hash_key(key);
        let (table, idx, pos) = self.find_slot(hash, key)?;
        let elem = unsafe { self.buckets(table)[idx].element(pos) };
        self.buckets_mut(table)[idx].clear_slot(pos);
        self.used[table] -= 1;
        self.shrink_if_needed();
        Some(elem)
    }

    /// Delete the element matching the key, running its destructor.
    /// Returns whether an element was deleted.
    pub fn delete(&mut self, key: &T::Key) -> bool {
        match self.pop(key) {
            Some(elem) => {
                self.ops.destroy_element(elem);
                true
            }
            None => false,
        }
    }

    /// First phase of a two-phase pop: find an element and its position so
    /// it can be deleted later without a second lookup.
    ///
    /// Rehashing is paused until [`LineTable::two_phase_pop_delete`] is
    /// called with the returned position, so other operations are permitted
    /// in between (unlike the two-phase insert contract).
    pub fn two_phase_pop_find(&mut self, key: &T::Key) -> Option<(T::Element, Position)> {
        if self.size() == 0 {
            return None;
        }
        let hash = self.ops.hash_key(key);
        let (table, idx, pos) = self.find_slot(hash, key)?;
        self.pause_rehashing();
        let elem = unsafe { self.buckets(table)[idx].element(pos) };
        Some((elem, Position::encode(idx, pos, table)))
    }

    /// Second phase of a two-phase pop: delete the element at the position
    /// and resume rehashing
    pub fn two_phase_pop_delete(&mut self, position: Position) {
        let (idx, pos, table) = position.decode();
        let elem = {
            let b = &mut self.buckets_mut(table)[idx];
            assert!(b.is_present(pos), "position used after table mutation");
            let elem = unsafe { b.element(pos) };
            b.clear_slot(pos);
            elem
        };
        self.ops.destroy_element(elem);
        self.used[table] -= 1;
        self.shrink_if_needed();
        self.resume_rehashing();
    }

    // --- Bulk teardown ---

    /// Delete all elements, running their destructors, and free both tables
    pub fn clear(&mut self) {
        self.clear_with_progress(|| {});
    }

    /// Like [`LineTable::clear`], invoking the callback every 65 536
    /// buckets so long-running teardowns can report progress
    pub fn clear_with_progress(&mut self, mut progress: impl FnMut()) {
        if self.is_rehashing() {
            // behave as if rehashing had completed
            T::rehashing_completed(self);
            self.rehash_idx = None;
        }
        for table in 0..2 {
            if self.bucket_exp[table] < 0 {
                continue;
            }
            for idx in 0..num_buckets(self.bucket_exp[table]) {
                if idx & 65535 == 0 {
                    progress();
                }
                for pos in 0..SLOTS_PER_BUCKET {
                    let elem = {
                        let b = &self.buckets(table)[idx];
                        if !b.is_present(pos) {
                            continue;
                        }
                        unsafe { b.element(pos) }
                    };
                    self.ops.destroy_element(elem);
                }
            }
            self.reset_table(table);
        }
    }
}

impl<T: TableType> Drop for LineTable<T> {
    fn drop(&mut self) {
        self.clear_with_progress(|| {});
    }
}

#[cfg(test)]
impl<T: TableType> LineTable<T> {
    /// Every stored fingerprint must be the top byte of its element's hash
    pub(crate) fn check_fingerprints(&self) {
        for table in 0..2 {
            for b in self.buckets(table) {
                for pos in 0..SLOTS_PER_BUCKET {
                    if !b.is_present(pos) {
                        continue;
                    }
                    let elem = unsafe { b.element(pos) };
                    assert_eq!(b.fingerprint(pos), high_bits(self.hash_element(&elem)));
                }
            }
        }
    }

    /// Every bucket between an element's primary bucket and its actual
    /// bucket (in cursor order) must be marked ever-full
    pub(crate) fn check_probe_chains(&self) {
        for table in 0..2 {
            let mask = exp_to_mask(self.bucket_exp[table]);
            for (idx, b) in self.buckets(table).iter().enumerate() {
                for pos in 0..SLOTS_PER_BUCKET {
                    if !b.is_present(pos) {
                        continue;
                    }
                    let elem = unsafe { b.element(pos) };
                    let mut probe = self.hash_element(&elem) as usize & mask;
                    let mut steps = 0;
                    while probe != idx {
                        assert!(
                            self.buckets(table)[probe].ever_full(),
                            "break in probe chain at bucket {} of table {}",
                            probe,
                            table
                        );
                        probe = next_cursor(probe, mask);
                        steps += 1;
                        assert!(steps <= mask + 1, "probe chain does not reach its bucket");
                    }
                }
            }
        }
    }

    /// The write table must never run past the hard fill limit
    pub(crate) fn check_fill_limit(&self) {
        let write = if self.is_rehashing() { 1 } else { 0 };
        let capacity = num_buckets(self.bucket_exp[write]) * SLOTS_PER_BUCKET;
        assert!(self.used[write] * 100 <= capacity * MAX_FILL_PERCENT_HARD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{exclusive_policy, pack, CountingOps, IdentityOps, NumOps, PackedOps};
    use crate::{set_resize_policy, ResizePolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_is_empty() {
        let table = LineTable::new(NumOps);
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
        assert!(!table.is_rehashing());
        assert_eq!(table.rehashing_info(), None);
    }

    #[test]
    fn test_find_on_empty() {
        let mut table = LineTable::new(NumOps);
        assert_eq!(table.find(&1), None);
        assert_eq!(table.pop(&1), None);
        assert!(!table.delete(&1));
    }

    #[test]
    fn test_insert_find_delete() {
        let mut table = LineTable::new(NumOps);

        for key in 1..=1000u64 {
            assert!(table.add(key), "duplicate reported for {}", key);
        }
        assert_eq!(table.size(), 1000);
        for key in 1..=1000u64 {
            assert_eq!(table.find(&key), Some(key));
        }
        table.check_fingerprints();
        table.check_probe_chains();

        for key in (1..=1000u64).step_by(2) {
            assert!(table.delete(&key));
        }
        assert_eq!(table.size(), 500);
        assert_eq!(table.find(&2), Some(2));
        assert_eq!(table.find(&3), None);
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut table = LineTable::new(NumOps);
        assert!(table.add(10));
        assert!(!table.add(10));
        assert_eq!(table.size(), 1);
        assert_eq!(table.add_or_find(10), Err(10));
    }

    #[test]
    fn test_add_or_find_surfaces_existing() {
        let mut table = LineTable::new(PackedOps);
        assert_eq!(table.add_or_find(pack(5, 100)), Ok(()));
        // same key, different payload: the stored element is surfaced
        assert_eq!(table.add_or_find(pack(5, 200)), Err(pack(5, 100)));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_replace_destroys_old_exactly_once() {
        let (ops, destroyed) = CountingOps::new();
        let mut table = LineTable::new(ops);

        assert!(table.replace(pack(1, 10)));
        assert!(destroyed.borrow().is_empty());

        assert!(!table.replace(pack(1, 20)));
        assert_eq!(destroyed.borrow().as_slice(), &[pack(1, 10)]);
        assert_eq!(table.find(&pack(1, 0)), Some(pack(1, 20)));
        assert_eq!(table.size(), 1);
        drop(table);
        assert_eq!(destroyed.borrow().as_slice(), &[pack(1, 10), pack(1, 20)]);
    }

    #[test]
    fn test_pop_does_not_destroy() {
        let (ops, destroyed) = CountingOps::new();
        let mut table = LineTable::new(ops);

        table.add(pack(3, 33));
        assert_eq!(table.pop(&pack(3, 0)), Some(pack(3, 33)));
        assert!(destroyed.borrow().is_empty());
        assert_eq!(table.size(), 0);

        table.add(pack(4, 44));
        assert!(table.delete(&pack(4, 0)));
        assert_eq!(destroyed.borrow().as_slice(), &[pack(4, 44)]);
    }

    #[test]
    fn test_two_phase_insert() {
        let mut table = LineTable::new(PackedOps);

        let position = table
            .find_position_for_insert(&pack(9, 0))
            .expect("key is absent");
        table.insert_at_position(pack(9, 99), position);
        assert_eq!(table.find(&pack(9, 0)), Some(pack(9, 99)));
        assert_eq!(table.size(), 1);

        // with the key present the existing element is surfaced instead
        assert_eq!(table.find_position_for_insert(&pack(9, 0)), Err(pack(9, 99)));
        table.check_fingerprints();
    }

    #[test]
    fn test_two_phase_pop() {
        let (ops, destroyed) = CountingOps::new();
        let mut table = LineTable::new(ops);
        for key in 0..100u32 {
            table.add(pack(key, key));
        }

        let (elem, position) = table.two_phase_pop_find(&pack(42, 0)).expect("present");
        assert_eq!(elem, pack(42, 42));
        assert!(table.is_rehashing_paused());
        // other operations are fine while the position is held
        assert_eq!(table.find(&pack(7, 0)), Some(pack(7, 7)));

        table.two_phase_pop_delete(position);
        assert!(!table.is_rehashing_paused());
        assert_eq!(destroyed.borrow().as_slice(), &[pack(42, 42)]);
        assert_eq!(table.find(&pack(42, 0)), None);
        assert_eq!(table.size(), 99);
    }

    #[test]
    fn test_expand_and_try_expand() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);

        assert_eq!(table.try_expand(1000), Ok(true));
        let capacity = num_buckets(table.bucket_exp[0]) * SLOTS_PER_BUCKET;
        assert!(capacity >= 1000);

        // a second request for the same capacity changes nothing
        assert_eq!(table.try_expand(1000), Ok(false));

        for key in 0..1000u64 {
            table.add(key);
        }
        // can't expand below the current size
        assert!(!table.expand(500));
        assert_eq!(table.try_expand(500), Ok(false));
        assert_eq!(table.size(), 1000);

        assert_eq!(table.try_expand(5000), Ok(true));
        while table.is_rehashing() {
            table.find(&0);
        }
        for key in 0..1000u64 {
            assert_eq!(table.find(&key), Some(key));
        }
    }

    #[test]
    fn test_collision_chain_and_tombstones() {
        let mut table = LineTable::new(IdentityOps);
        table.pause_auto_shrink();
        table.expand(40);
        assert_eq!(num_buckets(table.bucket_exp[0]), 8);

        // ten keys, all with low bits 0: everything lands in bucket 0 and
        // overflows along the probe chain
        let keys: Vec<u64> = (1..=10).map(|i| (i << 56) | (i << 8)).collect();
        for &key in &keys {
            assert!(table.add(key));
        }
        // one resident in bucket 7, so later misses exercise real probing
        let resident = (15u64 << 56) | 7;
        table.add(resident);

        for &key in &keys {
            assert_eq!(table.find(&key), Some(key));
        }
        assert!(table.buckets(0)[0].ever_full());
        assert!(table.longest_probing_chain() >= 1);
        table.check_probe_chains();

        for &key in &keys {
            assert!(table.delete(&key));
        }
        assert_eq!(table.size(), 1);
        // the tombstones stay, and probing past drained buckets still
        // terminates with a miss
        assert!(table.buckets(0)[0].ever_full());
        for &key in &keys {
            assert_eq!(table.find(&key), None);
        }
        assert_eq!(table.find(&resident), Some(resident));
        table.resume_auto_shrink();
    }

    #[test]
    fn test_fill_stays_under_hard_limit() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);
        for key in 0..5000u64 {
            table.add(key);
            if key % 97 == 0 {
                table.check_fill_limit();
            }
        }
        table.check_fill_limit();
        table.check_fingerprints();
    }

    #[test]
    fn test_resize_policy_interplay() {
        let _guard = exclusive_policy();
        set_resize_policy(ResizePolicy::Avoid);

        let mut table = LineTable::new(NumOps);
        table.expand(40);
        assert_eq!(num_buckets(table.bucket_exp[0]), 8);
        let capacity = 8 * SLOTS_PER_BUCKET;

        // fill to ~80%: above the soft limit, below the hard one
        let count = capacity * 80 / 100;
        for key in 0..count as u64 {
            table.add(key);
        }
        assert!(!table.is_rehashing());
        assert_eq!(num_buckets(table.bucket_exp[0]), 8);

        // back to normal operation the pending expand kicks in
        set_resize_policy(ResizePolicy::Allow);
        assert!(table.expand_if_needed());
        assert!(table.is_rehashing());

        // reads drive the incremental rehash to completion
        while table.is_rehashing() {
            table.find(&0);
        }
        for key in 0..count as u64 {
            assert_eq!(table.find(&key), Some(key));
        }
        assert_eq!(table.size(), count);
        table.check_fingerprints();
        table.check_probe_chains();
    }

    #[test]
    fn test_shrink_after_deletes() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);
        for key in 0..1000u64 {
            table.add(key);
        }
        let peak = num_buckets(table.bucket_exp[0]).max(num_buckets(table.bucket_exp[1]));

        for key in 100..1000u64 {
            table.delete(&key);
        }
        while table.is_rehashing() {
            table.find(&0);
        }
        assert!(num_buckets(table.bucket_exp[0]) < peak);
        for key in 0..100u64 {
            assert_eq!(table.find(&key), Some(key));
        }
    }

    #[test]
    fn test_pause_auto_shrink() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);
        for key in 0..1000u64 {
            table.add(key);
        }
        while table.is_rehashing() {
            table.find(&0);
        }
        let buckets_before = num_buckets(table.bucket_exp[0]);

        table.pause_auto_shrink();
        for key in 10..1000u64 {
            table.delete(&key);
        }
        assert_eq!(num_buckets(table.bucket_exp[0]), buckets_before);

        table.resume_auto_shrink();
        while table.is_rehashing() {
            table.find(&0);
        }
        assert!(num_buckets(table.bucket_exp[0]) < buckets_before);
        for key in 0..10u64 {
            assert_eq!(table.find(&key), Some(key));
        }
    }

    #[test]
    fn test_clear_runs_destructors() {
        let (ops, destroyed) = CountingOps::new();
        let mut table = LineTable::new(ops);
        for key in 0..50u32 {
            table.add(pack(key, key));
        }

        let mut ticks = 0;
        table.clear_with_progress(|| ticks += 1);
        assert!(ticks >= 1);
        assert_eq!(destroyed.borrow().len(), 50);
        assert!(table.is_empty());
        assert!(!table.is_rehashing());

        // clearing again is a no-op
        table.clear();
        assert_eq!(destroyed.borrow().len(), 50);
    }

    #[test]
    fn test_drop_runs_destructors() {
        let (ops, destroyed) = CountingOps::new();
        {
            let mut table = LineTable::new(ops);
            for key in 0..20u32 {
                table.add(pack(key, 0));
            }
        }
        assert_eq!(destroyed.borrow().len(), 20);
    }

    struct InstantOps;

    impl TableType for InstantOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            crate::testutil::sip_u64(*key)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }

        fn instant_rehashing(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_instant_rehashing() {
        let mut table = LineTable::new(InstantOps);
        for key in 0..500u64 {
            table.add(key);
            assert!(!table.is_rehashing());
        }
        for key in 0..500u64 {
            assert_eq!(table.find(&key), Some(key));
        }
    }

    static HOOK_STARTED: AtomicUsize = AtomicUsize::new(0);
    static HOOK_COMPLETED: AtomicUsize = AtomicUsize::new(0);

    struct HookOps;

    impl TableType for HookOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            crate::testutil::sip_u64(*key)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }

        fn rehashing_started(table: &mut LineTable<Self>) {
            assert!(table.rehashing_info().is_some());
            HOOK_STARTED.fetch_add(1, Ordering::Relaxed);
        }

        fn rehashing_completed(table: &mut LineTable<Self>) {
            assert!(table.is_rehashing());
            HOOK_COMPLETED.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_rehashing_hooks_fire_in_pairs() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(HookOps);
        for key in 0..2000u64 {
            table.add(key);
        }
        while table.is_rehashing() {
            table.find(&0);
        }
        let started = HOOK_STARTED.load(Ordering::Relaxed);
        let completed = HOOK_COMPLETED.load(Ordering::Relaxed);
        assert!(started >= 1);
        assert_eq!(started, completed);
    }

    #[test]
    fn test_find_during_rehash_covers_both_tables() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);
        for key in 0..100u64 {
            table.add(key);
        }

        // start a resize with migration deferred
        set_resize_policy(ResizePolicy::Avoid);
        table.expand(1000);
        assert!(table.is_rehashing());

        // New inserts land in the destination table while old elements sit
        // in the source; lookups must see both. Each insert performs one
        // migration step under the Avoid policy, so stay well below the
        // source bucket count to remain mid-rehash.
        for key in 100..110u64 {
            table.add(key);
        }
        assert!(table.is_rehashing());
        for key in 0..110u64 {
            assert_eq!(table.find(&key), Some(key), "missing {}", key);
        }
        assert_eq!(table.size(), 110);

        set_resize_policy(ResizePolicy::Allow);
        while table.is_rehashing() {
            table.find(&0);
        }
        for key in 0..110u64 {
            assert_eq!(table.find(&key), Some(key));
        }
        table.check_fingerprints();
        table.check_probe_chains();
    }

    #[test]
    fn test_forbid_blocks_rehash_steps() {
        let _guard = exclusive_policy();
        let mut table = LineTable::new(NumOps);
        for key in 0..100u64 {
            table.add(key);
        }
        set_resize_policy(ResizePolicy::Avoid);
        table.expand(1000);
        assert!(table.is_rehashing());

        set_resize_policy(ResizePolicy::Forbid);
        let idx_before = table.rehash_idx;
        for key in 0..100u64 {
            table.find(&key);
        }
        assert_eq!(table.rehash_idx, idx_before);
    }

    #[test]
    fn test_size_accounting_over_mixed_ops() {
        let mut table = LineTable::new(NumOps);
        let mut expected = 0usize;
        for round in 0..3u64 {
            for key in 0..300u64 {
                if table.add(round * 1000 + key) {
                    expected += 1;
                }
            }
            for key in (0..300u64).step_by(3) {
                if table.delete(&(round * 1000 + key)) {
                    expected -= 1;
                }
            }
            assert_eq!(table.size(), expected);
        }
    }

    #[test]
    fn test_position_token_roundtrip() {
        let position = Position::encode(12345, SLOTS_PER_BUCKET - 1, 1);
        assert_eq!(position.decode(), (12345, SLOTS_PER_BUCKET - 1, 1));
        let position = Position::encode(0, 0, 0);
        assert_eq!(position.decode(), (0, 0, 0));
    }

    #[test]
    fn test_next_bucket_exp() {
        assert_eq!(next_bucket_exp(0), -1);
        assert_eq!(next_bucket_exp(1), 0);
        // eight buckets hold 40 elements below the soft limit
        #[cfg(target_pointer_width = "64")]
        assert_eq!(next_bucket_exp(40), 3);
        for capacity in 1..5000usize {
            let exp = next_bucket_exp(capacity);
            assert!(num_buckets(exp) * SLOTS_PER_BUCKET >= capacity);
        }
    }

    #[test]
    fn test_mem_usage_tracks_tables() {
        let mut table = LineTable::new(NumOps);
        let empty = table.mem_usage();
        table.expand(1000);
        assert!(table.mem_usage() > empty);
    }
}
