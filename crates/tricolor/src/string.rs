//! String hashing and the intern table.
//!
//! The table is a chained hash table whose bucket count is always a power of
//! two. Chains hold handles; the string bodies live in the heap arena. Strings
//! are never on the general object list: the collector sweeps them bucket by
//! bucket in its own phase.
//!
//! Interning itself (lookup, resurrection, insertion) is driven by the runtime,
//! which owns both this table and the heap. See `Runtime::intern`.

use std::mem::size_of;

use crate::object::ObjRef;

/// Smallest bucket count; the table never shrinks below twice this.
pub const MIN_STRING_TABLE_SIZE: usize = 32;

/// Largest bucket count the table will double to.
const MAX_STRING_TABLE_SIZE: usize = (i32::MAX as usize) / 2;

/// Hashes a byte string.
///
/// The seed is the length. Strings of 32 bytes or more are sampled with a
/// stride of `(len >> 5) + 1`, walking back from the end, so hashing cost is
/// bounded regardless of length.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut l1 = len;
    while l1 >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(u32::from(bytes[l1 - 1]));
        l1 -= step;
    }
    h
}

/// The intern table.
#[derive(Debug, Default)]
pub struct StringTable {
    buckets: Vec<Vec<ObjRef>>,
    count: usize,
}

impl StringTable {
    /// An empty table with no buckets; the runtime sizes it on creation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: Vec::new(),
            count: 0,
        }
    }

    /// Number of buckets.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of interned strings.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Bytes charged for the bucket array.
    #[must_use]
    pub const fn bucket_bytes(size: usize) -> usize {
        size * size_of::<usize>()
    }

    /// Bucket that `hash` maps to.
    #[inline]
    #[must_use]
    pub fn bucket_index(&self, hash: u32) -> usize {
        debug_assert!(self.buckets.len().is_power_of_two());
        hash as usize & (self.buckets.len() - 1)
    }

    /// Chain of bucket `i`, newest entry last.
    #[must_use]
    pub fn bucket(&self, i: usize) -> &[ObjRef] {
        &self.buckets[i]
    }

    pub(crate) fn bucket_mut(&mut self, i: usize) -> &mut Vec<ObjRef> {
        &mut self.buckets[i]
    }

    /// Links a freshly allocated string at the head of its chain.
    pub(crate) fn insert(&mut self, hash: u32, r: ObjRef) {
        let i = self.bucket_index(hash);
        self.buckets[i].push(r);
        self.count += 1;
    }

    /// Accounts for strings the sweep unlinked.
    pub(crate) fn forget(&mut self, n: usize) {
        debug_assert!(n <= self.count);
        self.count -= n;
    }

    /// Load factor above one with room to double.
    #[must_use]
    pub fn is_crowded(&self) -> bool {
        self.count > self.buckets.len() && self.buckets.len() <= MAX_STRING_TABLE_SIZE
    }

    /// Fewer than a quarter of the buckets' worth of strings, and larger than
    /// twice the minimum.
    #[must_use]
    pub fn is_sparse(&self, min_size: usize) -> bool {
        self.count < self.buckets.len() / 4 && self.buckets.len() > min_size * 2
    }

    /// Rehashes every chain into `new_size` buckets.
    pub(crate) fn resize(&mut self, new_size: usize, hash_of: impl Fn(ObjRef) -> u32) {
        assert!(new_size.is_power_of_two(), "string table size must be a power of two");
        let mut buckets = vec![Vec::new(); new_size];
        for r in self.buckets.drain(..).flatten() {
            buckets[hash_of(r) as usize & (new_size - 1)].push(r);
        }
        self.buckets = buckets;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.buckets.iter().flatten().copied()
    }
}
