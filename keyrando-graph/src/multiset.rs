use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::KeyId;

/// Multiset of key tokens, counted per key id.
///
/// Backed by a `BTreeMap` so that equality and hashing are structural
/// (states holding the same tokens compare equal) and iteration is stable
/// by key id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMultiset {
    counts: BTreeMap<KeyId, usize>,
}

impl KeyMultiset {
    pub fn new() -> Self {
        KeyMultiset::default()
    }

    pub fn add(&mut self, key: KeyId) {
        self.add_many(key, 1);
    }

    pub fn add_many(&mut self, key: KeyId, n: usize) {
        if n > 0 {
            *self.counts.entry(key).or_insert(0) += n;
        }
    }

    pub fn add_range<I: IntoIterator<Item = KeyId>>(&mut self, keys: I) {
        for key in keys {
            self.add(key);
        }
    }

    /// Removes up to `n` tokens of `key`; returns the number actually removed.
    pub fn remove_many(&mut self, key: KeyId, n: usize) -> usize {
        match self.counts.get_mut(&key) {
            Some(count) => {
                let removed = n.min(*count);
                *count -= removed;
                if *count == 0 {
                    self.counts.remove(&key);
                }
                removed
            }
            None => 0,
        }
    }

    pub fn count(&self, key: KeyId) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Total number of tokens across all keys.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Number of distinct keys present.
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `(key, count)` pairs in key-id order.
    pub fn iter(&self) -> impl Iterator<Item = (KeyId, usize)> + '_ {
        self.counts.iter().map(|(&k, &n)| (k, n))
    }

    /// Distinct key ids in order.
    pub fn keys(&self) -> impl Iterator<Item = KeyId> + '_ {
        self.counts.keys().copied()
    }

    /// Per-key maximum of `self` and `other`.
    pub fn union_max(&mut self, other: &KeyMultiset) {
        for (key, &count) in &other.counts {
            let entry = self.counts.entry(*key).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Per-key sum of `self` and `other`.
    pub fn union_sum(&mut self, other: &KeyMultiset) {
        for (key, &count) in &other.counts {
            *self.counts.entry(*key).or_insert(0) += count;
        }
    }

    /// True iff every count in `other` is covered by `self`.
    pub fn contains_all(&self, other: &KeyMultiset) -> bool {
        other.counts.iter().all(|(&k, &n)| self.count(k) >= n)
    }
}

impl FromIterator<KeyId> for KeyMultiset {
    fn from_iter<I: IntoIterator<Item = KeyId>>(iter: I) -> Self {
        let mut out = KeyMultiset::new();
        out.add_range(iter);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_count() {
        let mut m = KeyMultiset::new();
        m.add(3);
        m.add_many(3, 2);
        m.add(7);
        assert_eq!(m.count(3), 3);
        assert_eq!(m.count(7), 1);
        assert_eq!(m.count(0), 0);
        assert_eq!(m.total(), 4);
        assert_eq!(m.distinct(), 2);
    }

    #[test]
    fn remove_clamps_and_prunes() {
        let mut m: KeyMultiset = [1, 1, 2].into_iter().collect();
        assert_eq!(m.remove_many(1, 5), 2);
        assert_eq!(m.count(1), 0);
        assert_eq!(m.remove_many(9, 1), 0);
        assert_eq!(m.total(), 1);
    }

    #[test]
    fn structural_equality() {
        let a: KeyMultiset = [2, 5, 5].into_iter().collect();
        let mut b = KeyMultiset::new();
        b.add_many(5, 2);
        b.add(2);
        assert_eq!(a, b);
        let mut c = b.clone();
        c.add(5);
        assert_ne!(a, c);
    }

    #[test]
    fn union_max_and_sum() {
        let a: KeyMultiset = [1, 1, 2].into_iter().collect();
        let mut max = a.clone();
        max.union_max(&[1, 3].into_iter().collect());
        assert_eq!(max.count(1), 2);
        assert_eq!(max.count(3), 1);
        let mut sum = a.clone();
        sum.union_sum(&[1, 3].into_iter().collect());
        assert_eq!(sum.count(1), 3);
        assert_eq!(sum.count(2), 1);
        assert_eq!(sum.count(3), 1);
    }

    #[test]
    fn contains_all() {
        let held: KeyMultiset = [1, 1, 2].into_iter().collect();
        assert!(held.contains_all(&[1, 2].into_iter().collect()));
        assert!(held.contains_all(&KeyMultiset::new()));
        assert!(!held.contains_all(&[1, 1, 1].into_iter().collect()));
    }
}
