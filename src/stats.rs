//! Size accounting and probe-chain statistics.

use std::mem;

use crate::bucket::{Bucket, SLOTS_PER_BUCKET};
use crate::cursor::next_cursor;
use crate::table::{exp_to_mask, num_buckets, LineTable};
use crate::types::TableType;

/// Number of bins in the chain-length histogram; longer chains land in the
/// last bin
pub const STATS_VECTLEN: usize = 50;

/// Statistics for one of the two tables of a [`LineTable`].
#[derive(Clone, Debug)]
pub struct TableStats {
    /// 0 for the main table, 1 for the rehashing target
    pub table_index: usize,
    /// Number of buckets
    pub buckets: usize,
    /// Total element capacity
    pub size: usize,
    /// Number of elements stored
    pub used: usize,
    /// Longest run of ever-full buckets
    pub max_chain_len: usize,
    /// Number of ever-full buckets
    pub total_chain_len: usize,
    /// Runs of ever-full buckets by length
    pub chain_len_histogram: [usize; STATS_VECTLEN],
}

impl TableStats {
    /// Fold another table's stats into this one, e.g. to aggregate over
    /// both tables or over many tables backing one keyspace
    pub fn combine(&mut self, other: &TableStats) {
        self.buckets += other.buckets;
        self.size += other.size;
        self.used += other.used;
        self.max_chain_len = self.max_chain_len.max(other.max_chain_len);
        self.total_chain_len += other.total_chain_len;
        for (into, from) in self.chain_len_histogram.iter_mut().zip(&other.chain_len_histogram) {
            *into += from;
        }
    }
}

impl<T: TableType> LineTable<T> {
    /// Collect statistics for one table. With `full` set the buckets are
    /// walked to build the chain-length histogram; otherwise only the size
    /// accounting is filled in.
    pub fn stats(&self, table_index: usize, full: bool) -> TableStats {
        let buckets = num_buckets(self.bucket_exp[table_index]);
        let mut stats = TableStats {
            table_index,
            buckets,
            size: buckets * SLOTS_PER_BUCKET,
            used: self.used[table_index],
            max_chain_len: 0,
            total_chain_len: 0,
            chain_len_histogram: [0; STATS_VECTLEN],
        };
        if !full {
            return stats;
        }
        let mut chain_len = 0usize;
        for b in self.buckets(table_index) {
            if b.ever_full() {
                stats.total_chain_len += 1;
                chain_len += 1;
            } else {
                // end of a run, zero-length runs included
                stats.chain_len_histogram[chain_len.min(STATS_VECTLEN - 1)] += 1;
                stats.max_chain_len = stats.max_chain_len.max(chain_len);
                chain_len = 0;
            }
        }
        stats
    }

    /// Longest probe chain over both tables, following cursor order
    pub fn longest_probing_chain(&self) -> usize {
        let mut maxlen = 0;
        for table in 0..2 {
            if self.bucket_exp[table] < 0 {
                continue;
            }
            let mask = exp_to_mask(self.bucket_exp[table]);
            let mut cursor = 0;
            let mut chain_len = 0;
            loop {
                debug_assert!(cursor <= mask);
                if self.buckets(table)[cursor].ever_full() {
                    chain_len += 1;
                    maxlen = maxlen.max(chain_len);
                } else {
                    chain_len = 0;
                }
                cursor = next_cursor(cursor, mask);
                if cursor == 0 {
                    break;
                }
            }
        }
        maxlen
    }

    /// Memory held by the table structure and its bucket arrays, excluding
    /// whatever the elements themselves point to
    pub fn mem_usage(&self) -> usize {
        let buckets = num_buckets(self.bucket_exp[0]) + num_buckets(self.bucket_exp[1]);
        mem::size_of::<Self>() + buckets * mem::size_of::<Bucket<T::Element>>()
    }
}
