//! Small collection helpers shared across the pool.
//!
//! `AddressBook` mirrors the teacher's own collection of the same name
//! (used throughout `fsm::bfmgr`/`fsm::peermgr` as `AddressBook<PeerId, _>`):
//! an insertion-ordered map with `fastrand`-backed random sampling, used
//! wherever the pool needs to pick a random candidate peer (loader
//! selection, mempool relay fan-out) without pulling in a full weighted
//! sampling crate.
use std::collections::HashMap;
use std::hash::Hash;

/// An insertion-ordered map supporting uniform random sampling over its
/// values, backed by a shared `fastrand::Rng`.
#[derive(Debug, Clone)]
pub struct AddressBook<K, V> {
    rng: fastrand::Rng,
    order: Vec<K>,
    map: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> AddressBook<K, V> {
    /// Create an empty address book using the given RNG for sampling.
    pub fn new(rng: fastrand::Rng) -> Self {
        Self {
            rng,
            order: Vec::new(),
            map: HashMap::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.map.insert(key, value)
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Look up an entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(|k| self.map.get_key_value(k))
    }

    /// Draw a uniformly random entry, if any.
    pub fn sample(&self) -> Option<(&K, &V)> {
        if self.order.is_empty() {
            return None;
        }
        let idx = self.rng.usize(..self.order.len());
        let key = &self.order[idx];
        self.map.get_key_value(key)
    }

    /// Draw a uniformly random entry matching a predicate, if any.
    pub fn sample_with<F: Fn(&K, &V) -> bool>(&self, predicate: F) -> Option<(&K, &V)> {
        let candidates: Vec<_> = self
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rng.usize(..candidates.len());
        Some(candidates[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_round_trip() {
        let mut book: AddressBook<u32, &str> = AddressBook::new(fastrand::Rng::with_seed(1));
        book.insert(1, "a");
        book.insert(2, "b");
        assert_eq!(book.len(), 2);
        assert_eq!(book.remove(&1), Some("a"));
        assert_eq!(book.len(), 1);
        assert!(book.get(&1).is_none());
    }

    #[test]
    fn sample_returns_none_when_empty() {
        let book: AddressBook<u32, &str> = AddressBook::new(fastrand::Rng::with_seed(1));
        assert!(book.sample().is_none());
    }

    #[test]
    fn sample_with_filters() {
        let mut book: AddressBook<u32, u32> = AddressBook::new(fastrand::Rng::with_seed(7));
        book.insert(1, 10);
        book.insert(2, 20);
        let (k, v) = book.sample_with(|_, v| *v == 20).unwrap();
        assert_eq!(*k, 2);
        assert_eq!(*v, 20);
    }
}
