//! A cache that records its own mutations as a pending change set.

use fnv::FnvHashMap;

use crate::changes::{Change, ChangeReason, ChangeSet};
use crate::{Data, Key};

/// A [`Cache`](super::Cache) whose mutations accumulate into a pending buffer.
///
/// Every mutation appends a corresponding [`Change`];
/// [`capture_changes`](Self::capture_changes) drains the buffer as one batch.
/// Applying that batch to any cache holding the pre-state yields the
/// post-state. Consecutive mutations of one key coalesce where the rules
/// permit:
///
/// - an `Add` cancelled by a `Remove` disappears entirely;
/// - an `Add` followed by another write stays one `Add`, carrying the newest
///   value;
/// - an `Update` followed by another write stays one `Update`, keeping the
///   original `previous`;
/// - a `Refresh` of a key with a pending `Add` or `Update` is dropped (the
///   pending write subsumes it);
///
/// and everything else is preserved in mutation order.
///
/// The buffer is private to the owning operator; it must not be consulted
/// while a capture is being assembled elsewhere.
#[derive(Debug)]
pub struct ChangeAwareCache<V, K> {
    data: FnvHashMap<K, V>,
    // Coalescing tombstones slots rather than shifting the tail.
    pending: Vec<Option<Change<V, K>>>,
    pending_live: usize,
    // Key -> the latest live pending slot for that key.
    slots: FnvHashMap<K, usize>,
}

impl<V: Data, K: Key> ChangeAwareCache<V, K> {
    /// An empty cache with an empty pending buffer.
    pub fn new() -> Self {
        Self {
            data: FnvHashMap::default(),
            pending: Vec::new(),
            pending_live: 0,
            slots: FnvHashMap::default(),
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

    /// Iterates the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter()
    }

    /// Iterates the keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// True when at least one change is pending.
    pub fn has_pending(&self) -> bool {
        self.pending_live > 0
    }

    fn live_slot(&self, key: &K) -> Option<(usize, ChangeReason)> {
        let slot = *self.slots.get(key)?;
        let reason = self.pending.get(slot)?.as_ref()?.reason;
        Some((slot, reason))
    }

    fn append(&mut self, change: Change<V, K>) {
        let key = change.key.clone();
        self.pending.push(Some(change));
        self.pending_live += 1;
        self.slots.insert(key, self.pending.len() - 1);
    }

    /// Writes `value` under `key`, recording an `Add` or `Update`.
    pub fn add_or_update(&mut self, key: K, value: V) {
        let previous = self.data.insert(key.clone(), value.clone());
        match self.live_slot(&key) {
            Some((slot, ChangeReason::Add)) => {
                self.pending[slot] = Some(Change::add(key, value));
            }
            Some((slot, ChangeReason::Update)) => {
                let original = self.pending[slot]
                    .take()
                    .and_then(|change| change.previous)
                    .expect("pending update carries its previous value");
                self.pending[slot] = Some(Change::update(key, value, original));
            }
            _ => match previous {
                Some(previous) => self.append(Change::update(key, value, previous)),
                None => self.append(Change::add(key, value)),
            },
        }
    }

    /// Deletes `key`, recording a `Remove`. A pending `Add` for the key is
    /// cancelled instead, leaving no trace of either mutation. Unknown keys
    /// are ignored.
    pub fn remove(&mut self, key: &K) {
        let Some(previous) = self.data.remove(key) else {
            return;
        };
        match self.live_slot(key) {
            Some((slot, ChangeReason::Add)) => {
                self.pending[slot] = None;
                self.pending_live -= 1;
                self.slots.remove(key);
            }
            _ => self.append(Change::remove(key.clone(), previous)),
        }
    }

    /// Records a `Refresh` for `key`, unless a pending write already subsumes
    /// it. Unknown keys are ignored.
    pub fn refresh(&mut self, key: &K) {
        let Some(current) = self.data.get(key).cloned() else {
            return;
        };
        match self.live_slot(key) {
            Some((_, ChangeReason::Add)) | Some((_, ChangeReason::Update)) => {}
            _ => self.append(Change::refresh(key.clone(), current)),
        }
    }

    /// Mutates the value held for `key` in place and records a `Refresh` for
    /// it, returning whether the key was present.
    ///
    /// The mapping identity is unchanged, so downstream caches treat the
    /// change as a re-evaluation signal rather than a replacement. Intended
    /// for destinations with interior mutability, where every clone shares the
    /// mutated state.
    pub fn mutate(&mut self, key: &K, mutation: impl FnOnce(&mut V)) -> bool {
        let Some(value) = self.data.get_mut(key) else {
            return false;
        };
        mutation(&mut *value);
        let current = value.clone();
        match self.live_slot(key) {
            // A pending write re-captures the mutated value.
            Some((slot, ChangeReason::Add)) | Some((slot, ChangeReason::Update)) => {
                if let Some(pending) = self.pending[slot].as_mut() {
                    pending.current = current;
                }
            }
            _ => self.append(Change::refresh(key.clone(), current)),
        }
        true
    }

    /// Records a `Refresh` for every key.
    pub fn refresh_all(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in keys {
            self.refresh(&key);
        }
    }

    /// Deletes every key, recording the `Remove`s.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Applies one upstream batch, recording the corresponding changes:
    /// `Add`/`Update` write, `Remove` deletes, `Refresh` re-signals, `Moved`
    /// is skipped.
    pub fn apply(&mut self, changes: &ChangeSet<V, K>) {
        for change in changes.iter() {
            match change.reason {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(change.key.clone(), change.current.clone());
                }
                ChangeReason::Remove => self.remove(&change.key),
                ChangeReason::Refresh => self.refresh(&change.key),
                ChangeReason::Moved => {}
            }
        }
    }

    /// Returns the pending changes as one batch and clears the buffer.
    pub fn capture_changes(&mut self) -> ChangeSet<V, K> {
        self.slots.clear();
        self.pending_live = 0;
        let changes: Vec<Change<V, K>> = self.pending.drain(..).flatten().collect();
        ChangeSet::from(changes)
    }
}

impl<V: Data, K: Key> Default for ChangeAwareCache<V, K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    fn reasons(set: &ChangeSet<i32, &'static str>) -> Vec<ChangeReason> {
        set.iter().map(|c| c.reason).collect()
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("k", 1);
        cache.remove(&"k");
        assert!(cache.capture_changes().is_empty());
    }

    #[test]
    fn add_then_update_collapses_to_add() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("k", 1);
        cache.add_or_update("k", 2);
        let set = cache.capture_changes();
        assert_eq!(reasons(&set), vec![ChangeReason::Add]);
        assert_eq!(set[0].current, 2);
    }

    #[test]
    fn update_then_update_keeps_original_previous() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("k", 1);
        cache.capture_changes();

        cache.add_or_update("k", 2);
        cache.add_or_update("k", 3);
        let set = cache.capture_changes();
        assert_eq!(reasons(&set), vec![ChangeReason::Update]);
        assert_eq!(set[0].current, 3);
        assert_eq!(set[0].previous, Some(1));
    }

    #[test]
    fn refresh_subsumed_by_pending_write() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("k", 1);
        cache.refresh(&"k");
        let set = cache.capture_changes();
        assert_eq!(reasons(&set), vec![ChangeReason::Add]);
    }

    #[test]
    fn unrelated_mutations_preserve_order() {
        let mut cache = ChangeAwareCache::new();
        cache.add_or_update("a", 1);
        cache.capture_changes();

        cache.remove(&"a");
        cache.add_or_update("a", 2);
        let set = cache.capture_changes();
        assert_eq!(reasons(&set), vec![ChangeReason::Remove, ChangeReason::Add]);
    }

    #[test]
    fn captured_batch_replays_pre_to_post_state() {
        let test_cases: Vec<Vec<(&'static str, Option<i32>)>> = vec![
            vec![("a", Some(1)), ("a", Some(2)), ("b", Some(3))],
            vec![("a", Some(1)), ("a", None)],
            vec![("a", Some(1)), ("b", Some(2)), ("a", None), ("a", Some(3))],
        ];

        for edits in test_cases {
            let mut recorder = ChangeAwareCache::new();
            let mut replica = Cache::new();
            for (key, value) in edits {
                match value {
                    Some(value) => recorder.add_or_update(key, value),
                    None => recorder.remove(&key),
                }
            }
            replica.apply(&recorder.capture_changes());
            let mut expected: Vec<(&str, i32)> =
                recorder.iter().map(|(k, v)| (*k, *v)).collect();
            let mut actual: Vec<(&str, i32)> = replica.iter().map(|(k, v)| (*k, *v)).collect();
            expected.sort_unstable();
            actual.sort_unstable();
            assert_eq!(actual, expected);
        }
    }
}
