//! Stateless scan and random sampling.
//!
//! Scan walks the table with nothing but a cursor owned by the caller. The
//! table may be mutated or resized arbitrarily between calls; the cursor
//! stays meaningful because buckets are visited in reverse-bit order, which
//! is stable across power-of-two resizes.
//!
//! Guarantees for a full traversal (cursor 0 until 0 comes back):
//!
//! - An element present in the table for the entire traversal is emitted at
//!   least once. Probe chains wrapping past cursor zero, or elements
//!   migrating between the tables, can cause a second emission, never more.
//! - Elements inserted or deleted mid-traversal may or may not be emitted.

use rand::Rng;

use crate::bucket::{Bucket, SLOTS_PER_BUCKET};
use crate::cursor::{cursor_is_less_than, next_cursor};
use crate::table::{exp_to_mask, LineTable};
use crate::types::TableType;

/// Scan behaviour tweaks
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanFlags {
    /// Advance the cursor a single step instead of following complete
    /// probe chains. Cheaper per call, but elements rehashed between calls
    /// can be missed; used for sampling, where the liveness guarantee does
    /// not matter.
    pub single_step: bool,
}

/// Number of slots inspected by a weak random pick
const WEAK_RANDOM_SAMPLE_SIZE: usize = SLOTS_PER_BUCKET;

/// Number of slots inspected by a fair random pick. The wider window evens
/// out the skew that bucket fill differences cause.
const FAIR_RANDOM_SAMPLE_SIZE: usize = SLOTS_PER_BUCKET * 40;

/// Emit every present element of a bucket; report whether probing must
/// continue past it
fn emit_bucket<E: Copy>(b: &mut Bucket<E>, emit: &mut dyn FnMut(&mut E)) -> bool {
    for pos in 0..SLOTS_PER_BUCKET {
        if b.is_present(pos) {
            emit(unsafe { b.element_mut(pos) });
        }
    }
    b.ever_full()
}

impl<T: TableType> LineTable<T> {
    /// Scan the table statelessly.
    ///
    /// Start with a cursor of 0 and keep feeding the returned cursor back
    /// in; 0 means the traversal is complete. The callback receives each
    /// emitted element by value.
    pub fn scan(&mut self, cursor: usize, flags: ScanFlags, mut emit: impl FnMut(T::Element)) -> usize {
        self.scan_inner(cursor, flags, &mut |slot| emit(*slot))
    }

    /// Like [`LineTable::scan`], but the callback receives a mutable
    /// reference to the element's slot, so it can rewrite the element in
    /// place (e.g. replacing a pointer after defragmenting the allocation).
    /// The replacement must carry the same key.
    pub fn scan_mut(
        &mut self,
        cursor: usize,
        flags: ScanFlags,
        mut emit: impl FnMut(&mut T::Element),
    ) -> usize {
        self.scan_inner(cursor, flags, &mut emit)
    }

    fn scan_inner(
        &mut self,
        mut cursor: usize,
        flags: ScanFlags,
        emit: &mut dyn FnMut(&mut T::Element),
    ) -> usize {
        if self.size() == 0 {
            return 0;
        }

        // the callback must not observe elements mid-move
        self.pause_rehashing();

        // When the cursor wraps past zero with a probe chain still open, the
        // chain is finished first, but 0 is returned to report completion.
        let mut cursor_passed_zero = false;
        loop {
            // set when an emitted bucket was ever full, meaning elements
            // that hash to it may sit further along the probe chain; they
            // must be covered in this same call or a rehash in between
            // could move them behind the cursor
            let mut in_probe_sequence = false;

            match self.rehash_idx {
                None => {
                    let mask = exp_to_mask(self.bucket_exp[0]);
                    let b = &mut self.buckets_mut(0)[cursor & mask];
                    in_probe_sequence |= emit_bucket(b, emit);
                    cursor = next_cursor(cursor, mask);
                }
                Some(rehash_idx) => {
                    // Both tables are live. The rehash source is always
                    // table 0, but it can be the smaller table (expanding)
                    // or the larger one (shrinking).
                    let (small, large) = if self.bucket_exp[0] <= self.bucket_exp[1] {
                        (0, 1)
                    } else {
                        (1, 0)
                    };
                    let mask_small = exp_to_mask(self.bucket_exp[small]);
                    let mask_large = exp_to_mask(self.bucket_exp[large]);

                    // The bucket in the smaller table, unless it is the
                    // rehash source and this index has already been drained.
                    if small == 1 || !cursor_is_less_than(cursor & mask_small, rehash_idx) {
                        let b = &mut self.buckets_mut(small)[cursor & mask_small];
                        in_probe_sequence |= emit_bucket(b, emit);
                    }

                    // Every bucket in the larger table whose low bits equal
                    // the cursor position in the smaller table.
                    loop {
                        if large == 1 || !cursor_is_less_than(cursor & mask_large, rehash_idx) {
                            let b = &mut self.buckets_mut(large)[cursor & mask_large];
                            in_probe_sequence |= emit_bucket(b, emit);
                        }

                        // increment the cursor bits not covered by the
                        // smaller mask
                        cursor = next_cursor(cursor, mask_large);
                        if cursor & (mask_small ^ mask_large) == 0 {
                            break;
                        }
                    }
                }
            }

            if cursor == 0 {
                cursor_passed_zero = true;
            }
            if flags.single_step || !in_probe_sequence {
                break;
            }
        }

        self.resume_rehashing();
        if cursor_passed_zero {
            0
        } else {
            cursor
        }
    }

    /// Sample a run of elements starting at a random cursor. Returns
    /// exactly `count` elements unless the table holds fewer; an element
    /// can appear more than once in the sample.
    pub fn sample_elements(&mut self, count: usize) -> Vec<T::Element> {
        let count = count.min(self.size());
        let mut samples = Vec::with_capacity(count);
        if count == 0 {
            return samples;
        }
        let mut cursor: usize = rand::thread_rng().gen();
        while samples.len() < count {
            self.rehash_step_on_read();
            cursor = self.scan(cursor, ScanFlags { single_step: true }, |elem| {
                if samples.len() < count {
                    samples.push(elem);
                }
            });
        }
        samples
    }

    fn random_from_window(&mut self, window: usize) -> Option<T::Element> {
        let samples = self.sample_elements(window);
        if samples.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..samples.len());
        Some(samples[idx])
    }

    /// Pick a random element cheaply. The distribution is skewed towards
    /// elements in densely filled regions.
    pub fn random_element(&mut self) -> Option<T::Element> {
        self.random_from_window(WEAK_RANDOM_SAMPLE_SIZE)
    }

    /// Pick a random element with a much more uniform distribution, paying
    /// for a 40x larger sample window
    pub fn fair_random_element(&mut self) -> Option<T::Element> {
        self.random_from_window(FAIR_RANDOM_SAMPLE_SIZE)
    }
}
