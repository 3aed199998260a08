//! An open addressing hash table with cache-line sized buckets.
//!
//! - 64-byte buckets holding 7 word-sized elements on 64-bit hosts (12 on
//!   32-bit), with an 8-bit fingerprint per slot checked before the full key
//!   comparison
//! - A single ever-full bit per bucket acts as a shared tombstone, so probes
//!   know when to continue without per-slot bookkeeping
//! - Incremental rehashing between two tables, interleaved with normal
//!   operations one bucket at a time
//! - Stateless iteration with [`LineTable::scan`]: a reverse-bit cursor that
//!   stays meaningful across resizes and never misses a live element
//! - Two-phase insert and pop through opaque position tokens, avoiding
//!   repeated lookups
//!
//! The table stores pointer-sized opaque elements rather than key-value
//! entries. Using it as a set is straightforward; a key-value store packs
//! both into one object and stores a handle to it. A [`TableType`]
//! implementation provided at creation tells the table how to extract keys,
//! hash them, compare them and destroy elements.
//!
//! The resize policy and the hash function seed are process-wide. The policy
//! exists for callers that fork snapshot children: under
//! [`ResizePolicy::Avoid`] the table still expands when it must, but element
//! migration is deferred so copy-on-write pages stay clean.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use siphasher::sip::SipHasher13;

mod bucket;
mod cursor;

pub mod iter;
pub mod scan;
pub mod stats;
pub mod table;
pub mod types;

pub use iter::{Iter, SafeIter};
pub use scan::ScanFlags;
pub use stats::TableStats;
pub use table::{AllocError, LineTable, Position};
pub use types::TableType;

/// Process-wide resize behaviour, consulted by every table operation.
///
/// The policy tracks process-level events: a supervisor sets `Avoid` while a
/// forked snapshot child is sharing pages copy-on-write, and `Forbid` inside
/// a child that never inserts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Rehash as required for optimal performance.
    Allow,
    /// Avoid moving memory: expansion still happens when open addressing
    /// demands it, but migration steps run only on writes and the fill
    /// limits stretch to their hard values.
    Avoid,
    /// No rehashing and no shrinking at all.
    Forbid,
}

static RESIZE_POLICY: AtomicU8 = AtomicU8::new(ResizePolicy::Allow as u8);

/// Set the process-wide resize policy.
pub fn set_resize_policy(policy: ResizePolicy) {
    RESIZE_POLICY.store(policy as u8, Ordering::Relaxed);
}

/// Get the process-wide resize policy.
pub fn resize_policy() -> ResizePolicy {
    match RESIZE_POLICY.load(Ordering::Relaxed) {
        0 => ResizePolicy::Allow,
        1 => ResizePolicy::Avoid,
        _ => ResizePolicy::Forbid,
    }
}

static HASH_SEED_LO: AtomicU64 = AtomicU64::new(0);
static HASH_SEED_HI: AtomicU64 = AtomicU64::new(0);

/// Set the 16-byte seed used by [`hash_bytes`] and [`hash_bytes_nocase`].
///
/// Set this once at startup, before any table keyed through these helpers
/// holds elements: changing the seed changes every subsequent hash.
pub fn set_hash_function_seed(seed: [u8; 16]) {
    let mut half = [0u8; 8];
    half.copy_from_slice(&seed[..8]);
    HASH_SEED_LO.store(u64::from_le_bytes(half), Ordering::Relaxed);
    half.copy_from_slice(&seed[8..]);
    HASH_SEED_HI.store(u64::from_le_bytes(half), Ordering::Relaxed);
}

/// Get the process-wide hash function seed.
pub fn hash_function_seed() -> [u8; 16] {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&HASH_SEED_LO.load(Ordering::Relaxed).to_le_bytes());
    seed[8..].copy_from_slice(&HASH_SEED_HI.load(Ordering::Relaxed).to_le_bytes());
    seed
}

/// Hash a byte string with the seeded default hash function.
pub fn hash_bytes(buf: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_key(&hash_function_seed());
    hasher.write(buf);
    hasher.finish()
}

/// Like [`hash_bytes`], but ASCII-case-insensitive.
pub fn hash_bytes_nocase(buf: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_key(&hash_function_seed());
    let mut folded = [0u8; 64];
    let mut rest = buf;
    while !rest.is_empty() {
        let n = rest.len().min(folded.len());
        for (dst, src) in folded[..n].iter_mut().zip(&rest[..n]) {
            *dst = src.to_ascii_lowercase();
        }
        hasher.write(&folded[..n]);
        rest = &rest[n..];
    }
    hasher.finish()
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared test descriptors and a guard serializing tests that touch the
    //! process-wide resize policy.

    use std::cell::RefCell;
    use std::hash::Hasher;
    use std::rc::Rc;
    use std::sync::{Mutex, MutexGuard};

    use siphasher::sip::SipHasher13;

    use crate::types::TableType;

    static POLICY_LOCK: Mutex<()> = Mutex::new(());

    /// Guard held by tests that change the resize policy. Restores
    /// [`crate::ResizePolicy::Allow`] on drop, panicking tests included.
    pub(crate) struct PolicyGuard(#[allow(dead_code)] MutexGuard<'static, ()>);

    impl Drop for PolicyGuard {
        fn drop(&mut self) {
            crate::set_resize_policy(crate::ResizePolicy::Allow);
        }
    }

    pub(crate) fn exclusive_policy() -> PolicyGuard {
        let guard = POLICY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::set_resize_policy(crate::ResizePolicy::Allow);
        PolicyGuard(guard)
    }

    /// Fixed-seed hash so tests are independent of the process-wide seed.
    pub(crate) fn sip_u64(key: u64) -> u64 {
        let mut hasher = SipHasher13::new_with_key(&[7; 16]);
        hasher.write(&key.to_le_bytes());
        hasher.finish()
    }

    /// Set of u64 keys hashed with a fixed-seed SipHash.
    pub(crate) struct NumOps;

    impl TableType for NumOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            sip_u64(*key)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    /// Keys hash to themselves, so tests control bucket placement directly:
    /// the low bits pick the bucket and the top byte is the fingerprint.
    pub(crate) struct IdentityOps;

    impl TableType for IdentityOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            *key
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    /// Elements pack a key in the high 32 bits and a value in the low 32,
    /// the composite-object pattern the table is designed for.
    pub(crate) struct PackedOps;

    pub(crate) fn pack(key: u32, val: u32) -> u64 {
        ((key as u64) << 32) | val as u64
    }

    pub(crate) fn packed_key(elem: u64) -> u32 {
        (elem >> 32) as u32
    }

    impl TableType for PackedOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            sip_u64(key >> 32)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            (a >> 32) == (b >> 32)
        }
    }

    /// Packed keying plus a record of every destroyed element.
    pub(crate) struct CountingOps {
        pub(crate) destroyed: Rc<RefCell<Vec<u64>>>,
    }

    impl CountingOps {
        pub(crate) fn new() -> (Self, Rc<RefCell<Vec<u64>>>) {
            let destroyed = Rc::new(RefCell::new(Vec::new()));
            (
                CountingOps {
                    destroyed: destroyed.clone(),
                },
                destroyed,
            )
        }
    }

    impl TableType for CountingOps {
        type Element = u64;
        type Key = u64;

        fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
            elem
        }

        fn hash_key(&self, key: &u64) -> u64 {
            sip_u64(key >> 32)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            (a >> 32) == (b >> 32)
        }

        fn destroy_element(&self, elem: u64) {
            self.destroyed.borrow_mut().push(elem);
        }
    }
}
