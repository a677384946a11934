//! In-memory indexes of live objects.
//!
//! Each index owns one map behind one lock. The lock is held only while the
//! map is read or mutated; callers get cloned values or snapshots.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A keyed set of cheaply clonable handles.
#[derive(Debug)]
pub struct Index<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for Index<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Index<K, V> {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `value`, returning the value previously stored under `key`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries().insert(key, value)
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries().get(key).cloned()
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries().remove(key)
    }

    /// Returns the first value matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&V) -> bool) -> Option<V> {
        self.entries().values().find(|v| predicate(v)).cloned()
    }

    /// Returns a clone of every value, in no particular order.
    pub fn snapshot(&self) -> Vec<V> {
        self.entries().values().cloned().collect()
    }

    /// Removes and returns every value.
    pub fn drain(&self) -> Vec<V> {
        self.entries().drain().map(|(_, v)| v).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let index = Index::new();
        assert!(index.insert("a", 1).is_none());
        assert_eq!(index.insert("a", 2), Some(1));
        assert_eq!(index.get(&"a"), Some(2));
        assert_eq!(index.remove(&"a"), Some(2));
        assert!(index.get(&"a").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn snapshot_is_detached_from_later_changes() {
        let index = Index::new();
        let _ = index.insert(1, "one");
        let _ = index.insert(2, "two");
        let mut snapshot = index.snapshot();
        let _ = index.remove(&1);

        snapshot.sort_unstable();
        assert_eq!(snapshot, vec!["one", "two"]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn find_matches_values() {
        let index = Index::new();
        let _ = index.insert(1, "alpha");
        let _ = index.insert(2, "beta");
        assert_eq!(index.find(|v| v.starts_with('b')), Some("beta"));
        assert_eq!(index.find(|v| v.is_empty()), None);
    }

    #[test]
    fn drain_empties_the_index() {
        let index = Index::new();
        let _ = index.insert(1, 'x');
        assert_eq!(index.drain(), vec!['x']);
        assert!(index.is_empty());
    }
}
