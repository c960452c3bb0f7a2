//! Key ordering, range containment, and primary-key placement hashing.
//!
//! Index keys are opaque byte strings of up to 65535 bytes, compared
//! byte-lexicographically with a strict prefix sorting first. An indexlet
//! owns the half-open range `[first_key, first_not_owned_key)`; an empty
//! `first_not_owned_key` stands for the open upper bound.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Largest key length the wire format can carry.
pub const MAX_KEY_LENGTH: usize = u16::MAX as usize;

/// Byte-lexicographic key order; on a shared prefix the shorter key sorts
/// first.
pub fn key_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// True when `key` falls in `[first_key, first_not_owned_key)`, where an
/// empty `first_not_owned_key` means the range is unbounded above.
pub fn range_contains(first_key: &[u8], first_not_owned_key: &[u8], key: &[u8]) -> bool {
    key_compare(first_key, key) != Ordering::Greater
        && (first_not_owned_key.is_empty()
            || key_compare(key, first_not_owned_key) == Ordering::Less)
}

/// Hash placing an object's primary key into a tablet of its table.
pub fn primary_key_hash(table_id: u64, key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    table_id.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}
