//! Type descriptor for table elements.
//!
//! The table stores one word-sized opaque element per slot and never
//! inspects it on its own. Everything it needs to know about elements comes
//! from a [`TableType`] implementation supplied at creation: how to reach
//! the key inside an element, how to hash and compare keys, and what to do
//! when an element is destroyed.

use crate::table::LineTable;

/// Callbacks describing the elements stored in a [`LineTable`].
///
/// A typical element is a pointer (or an integer handle) to an object that
/// embeds its own key; using the table as a plain set of word-sized keys is
/// just as valid. The table copies elements around freely, so the element
/// type is required to be `Copy`; ownership of whatever an element points to
/// stays with the caller and ends in [`TableType::destroy_element`].
///
/// ```
/// use linetable::{LineTable, TableType};
///
/// struct NumSet;
///
/// impl TableType for NumSet {
///     type Element = u64;
///     type Key = u64;
///
///     fn element_key<'a>(&self, elem: &'a u64) -> &'a u64 {
///         elem
///     }
///
///     fn hash_key(&self, key: &u64) -> u64 {
///         linetable::hash_bytes(&key.to_le_bytes())
///     }
///
///     fn key_eq(&self, a: &u64, b: &u64) -> bool {
///         a == b
///     }
/// }
///
/// let mut table = LineTable::new(NumSet);
/// assert!(table.add(7));
/// assert!(!table.add(7));
/// assert_eq!(table.find(&7), Some(7));
/// ```
pub trait TableType: Sized {
    /// Element stored in the table. A word-sized bit pattern, typically a
    /// pointer or an integer handle.
    type Element: Copy;

    /// Key type used for lookups.
    type Key: ?Sized;

    /// Extract the key from an element. When elements are their own keys
    /// this is the identity function.
    fn element_key<'a>(&self, elem: &'a Self::Element) -> &'a Self::Key;

    /// Hash a key to 64 bits. [`crate::hash_bytes`] hashes a byte string
    /// with the process-wide seed, for implementations without an opinion.
    fn hash_key(&self, key: &Self::Key) -> u64;

    /// Compare two keys for equality. Only called after the fingerprints
    /// already matched.
    fn key_eq(&self, a: &Self::Key, b: &Self::Key) -> bool;

    /// Destroy an element. Called by `delete`, by `replace` on the element
    /// being replaced, and for every element when the table is cleared or
    /// dropped. Not called by `pop`, which hands the element back instead.
    fn destroy_element(&self, elem: Self::Element) {
        let _ = elem;
    }

    /// When true, a resize migrates everything immediately instead of
    /// rehashing incrementally.
    fn instant_rehashing(&self) -> bool {
        false
    }

    /// Invoked when incremental rehashing starts. Both tables are live;
    /// [`LineTable::rehashing_info`] reports their capacities.
    fn rehashing_started(table: &mut LineTable<Self>) {
        let _ = table;
    }

    /// Invoked when incremental rehashing is done, before the old table is
    /// dropped.
    fn rehashing_completed(table: &mut LineTable<Self>) {
        let _ = table;
    }
}
