//! Sparse derivative map: an open-bucket hash table keyed by [`VariableKey`].
//!
//! Backs [`Scalar::cache`](crate::scalar::Scalar::cache): a node's full
//! gradient is realized here once so downstream consumers stop re-walking the
//! expression tree. Supports get-or-zero, merge-with-accumulation, whole-map
//! merge, and magnitude-based pruning. Buckets double when the load factor is
//! exceeded, and growth rehashes every existing entry into the new table.

use crate::key::{Key, VariableKey};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Bucket count for a map built without a size hint.
const DEFAULT_BUCKETS: usize = 16;
/// Grow when entries exceed buckets * MAX_LOAD.
const MAX_LOAD: usize = 2;

/// Sparse `VariableKey -> f64` map with accumulate-on-insert semantics.
///
/// Absent keys read as zero, so accumulating a partial derivative is one
/// operation whether or not the key has been seen before.
#[derive(Clone, Debug)]
pub struct GradientMap<K: Key> {
    buckets: Vec<Vec<(VariableKey<K>, f64)>>,
    entries: usize,
}

impl<K: Key> GradientMap<K> {
    /// Empty map with the default bucket count.
    pub fn new() -> Self {
        GradientMap::with_bucket_hint(DEFAULT_BUCKETS)
    }

    /// Empty map sized for roughly `hint` entries.
    pub fn with_bucket_hint(hint: usize) -> Self {
        let buckets = hint.next_power_of_two().max(DEFAULT_BUCKETS);
        GradientMap {
            buckets: vec![Vec::new(); buckets],
            entries: 0,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// True when no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn bucket_of(&self, key: &VariableKey<K>) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.buckets.len() - 1)
    }

    /// Stored value for `key`, or 0 when absent.
    pub fn get(&self, key: &VariableKey<K>) -> f64 {
        let b = self.bucket_of(key);
        self.buckets[b]
            .iter()
            .find(|(k, _)| k == key)
            .map_or(0.0, |(_, d)| *d)
    }

    /// Adds `delta` to the entry for `key`, inserting it when absent.
    pub fn accumulate(&mut self, key: &VariableKey<K>, delta: f64) {
        let b = self.bucket_of(key);
        if let Some(entry) = self.buckets[b].iter_mut().find(|(k, _)| k == key) {
            entry.1 += delta;
            return;
        }
        self.buckets[b].push((key.clone(), delta));
        self.entries += 1;
        if self.entries > self.buckets.len() * MAX_LOAD {
            self.grow();
        }
    }

    /// Folds every entry of `other` into this map.
    ///
    /// This is the serialized accumulation point for batch aggregation: the
    /// per-example maps may be produced in parallel, but the fold has one
    /// writer.
    pub fn merge(&mut self, other: &GradientMap<K>) {
        for (key, delta) in other.iter() {
            self.accumulate(key, delta);
        }
    }

    /// Doubles the bucket array, rehashing every existing entry.
    fn grow(&mut self) {
        let grown = vec![Vec::new(); self.buckets.len() * 2];
        let old = std::mem::replace(&mut self.buckets, grown);
        for bucket in old {
            for (key, delta) in bucket {
                let b = self.bucket_of(&key);
                self.buckets[b].push((key, delta));
            }
        }
    }

    /// Keeps only the `n` entries of largest magnitude, dropping the rest.
    pub fn retain_largest(&mut self, n: usize) {
        if self.entries <= n {
            return;
        }
        let mut all: Vec<(VariableKey<K>, f64)> =
            self.buckets.iter().flatten().cloned().collect();
        all.sort_by(|a, b| b.1.abs().partial_cmp(&a.1.abs()).unwrap());
        all.truncate(n);

        let buckets = self.buckets.len();
        self.buckets = vec![Vec::new(); buckets];
        self.entries = 0;
        for (key, delta) in all {
            let b = self.bucket_of(&key);
            self.buckets[b].push((key, delta));
            self.entries += 1;
        }
    }

    /// Iterates over all `(key, value)` entries in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (&VariableKey<K>, f64)> {
        self.buckets
            .iter()
            .flatten()
            .map(|(k, d)| (k, *d))
    }
}

impl<K: Key> Default for GradientMap<K> {
    fn default() -> Self {
        GradientMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_reads_zero() {
        let map: GradientMap<&str> = GradientMap::new();
        assert_eq!(map.get(&VariableKey::scalar("x")), 0.0);
        assert!(map.is_empty());
    }

    #[test]
    fn accumulate_adds_to_existing_entry() {
        let mut map = GradientMap::new();
        let k = VariableKey::scalar("x");
        map.accumulate(&k, 1.5);
        map.accumulate(&k, 2.5);
        assert_eq!(map.len(), 1);
        assert!((map.get(&k) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn growth_rehashes_all_entries() {
        // Force several doublings past the initial 16 buckets and verify every
        // entry is still reachable with its accumulated value afterwards.
        let mut map = GradientMap::with_bucket_hint(1);
        let n = 500;
        for i in 0..n {
            map.accumulate(&VariableKey::cell("emb", i, i % 7), i as f64 + 1.0);
        }
        assert_eq!(map.len(), n);
        for i in 0..n {
            let k = VariableKey::cell("emb", i, i % 7);
            assert!((map.get(&k) - (i as f64 + 1.0)).abs() < 1e-12, "lost {k:?}");
        }
    }

    #[test]
    fn merge_accumulates_overlapping_keys() {
        let mut a = GradientMap::new();
        let mut b = GradientMap::new();
        let shared = VariableKey::scalar("s");
        let only_b = VariableKey::scalar("b");
        a.accumulate(&shared, 1.0);
        b.accumulate(&shared, 2.0);
        b.accumulate(&only_b, 3.0);
        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert!((a.get(&shared) - 3.0).abs() < 1e-12);
        assert!((a.get(&only_b) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn retain_largest_keeps_high_magnitude_entries() {
        let mut map = GradientMap::new();
        map.accumulate(&VariableKey::scalar("small"), 0.01);
        map.accumulate(&VariableKey::scalar("neg"), -5.0);
        map.accumulate(&VariableKey::scalar("big"), 3.0);
        map.retain_largest(2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&VariableKey::scalar("small")), 0.0);
        assert!((map.get(&VariableKey::scalar("neg")) + 5.0).abs() < 1e-12);
        assert!((map.get(&VariableKey::scalar("big")) - 3.0).abs() < 1e-12);
    }
}
