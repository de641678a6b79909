//! A keyed map with bulk application of change sets.

use fnv::FnvHashMap;

use crate::changes::{ChangeReason, ChangeSet};
use crate::{Data, Key};

/// A keyed collection materialised from change sets.
///
/// No key ordering is promised. `Refresh` and `Moved` changes are no-ops on
/// the key→value mapping.
#[derive(Clone, Debug)]
pub struct Cache<V, K> {
    data: FnvHashMap<K, V>,
}

impl<V: Data, K: Key> Cache<V, K> {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            data: FnvHashMap::default(),
        }
    }

    /// The number of keyed entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value held for `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    /// True when a value is held for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Inserts or replaces the value for `key`, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.data.insert(key, value)
    }

    /// Removes the value for `key`, returning it.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.data.remove(key)
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Iterates the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter()
    }

    /// Iterates the keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Iterates the values in arbitrary order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.data.values()
    }

    /// Applies one batch: `Add` and `Update` write the current value,
    /// `Remove` deletes, `Refresh` and `Moved` leave the mapping untouched.
    pub fn apply(&mut self, changes: &ChangeSet<V, K>) {
        for change in changes.iter() {
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    self.data.insert(change.key.clone(), change.current.clone());
                }
                ChangeReason::Remove => {
                    self.data.remove(&change.key);
                }
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
    }
}

impl<V: Data, K: Key> Default for Cache<V, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Data, K: Key> FromIterator<(K, V)> for Cache<V, K> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Change;

    #[test]
    fn apply_reconstructs_collection() {
        let mut cache = Cache::new();
        cache.apply(&ChangeSet::from(vec![
            Change::add(1, "a"),
            Change::add(2, "b"),
        ]));
        cache.apply(&ChangeSet::from(vec![
            Change::update(1, "a2", "a"),
            Change::remove(2, "b"),
            Change::refresh(1, "a2"),
        ]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&1), Some(&"a2"));
    }

    #[test]
    fn refresh_is_value_preserving() {
        let mut cache = Cache::new();
        cache.insert(7, "x");
        cache.apply(&ChangeSet::from(vec![Change::refresh(7, "y")]));
        assert_eq!(cache.lookup(&7), Some(&"x"));
    }
}
