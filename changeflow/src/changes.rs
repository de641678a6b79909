//! The change-set data model: keyed mutation records and atomic batches.
//!
//! A [`Change`] describes one mutation of a keyed collection, tagged with a
//! [`ChangeReason`]. A [`ChangeSet`] is an ordered batch of such changes,
//! applied atomically: replaying a stream of change sets into an empty
//! [`Cache`](crate::cache::Cache) reconstructs the collection they describe,
//! which is the contract every operator in this crate preserves.
//!
//! Order within a batch is meaningful and preserved; a single key may appear
//! multiple times in one batch, and consumers must process each occurrence.

use serde::{Deserialize, Serialize};

/// The kind of mutation a [`Change`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeReason {
    /// The key was introduced with a new value.
    Add,
    /// The key's value was replaced; the change carries both values.
    Update,
    /// The key was removed.
    Remove,
    /// The item identified by the key should be re-evaluated. The carried
    /// value is the present one; this is not a value change, and applying it
    /// to a cache is a no-op.
    Refresh,
    /// The item changed position in a sorted projection. Produced only by the
    /// sorting operators; all other operators treat it as a no-op.
    Moved,
}

/// One keyed mutation.
///
/// `Update` carries both `current` and `previous`; `Moved` carries both
/// indices; `Add`, `Remove` and `Refresh` carry only `current`. Indices are
/// populated only on streams that have passed through a sorting operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<V, K> {
    /// Why the change happened.
    pub reason: ChangeReason,
    /// The key the change applies to.
    pub key: K,
    /// The value after the change.
    pub current: V,
    /// The value before the change, present for `Update`.
    pub previous: Option<V>,
    /// Position after the change, on sorted streams.
    pub current_index: Option<usize>,
    /// Position before the change, for `Moved` (and sorted `Update`).
    pub previous_index: Option<usize>,
}

impl<V, K> Change<V, K> {
    /// An addition of `value` under `key`.
    pub fn add(key: K, value: V) -> Self {
        Self::new(ChangeReason::Add, key, value, None)
    }

    /// A replacement of `previous` by `current` under `key`.
    pub fn update(key: K, current: V, previous: V) -> Self {
        Self::new(ChangeReason::Update, key, current, Some(previous))
    }

    /// A removal of `value` under `key`.
    pub fn remove(key: K, value: V) -> Self {
        Self::new(ChangeReason::Remove, key, value, None)
    }

    /// A re-evaluation signal for `key`, whose present value is `value`.
    pub fn refresh(key: K, value: V) -> Self {
        Self::new(ChangeReason::Refresh, key, value, None)
    }

    /// A positional move of `key` from `previous_index` to `current_index`.
    pub fn moved(key: K, value: V, current_index: usize, previous_index: usize) -> Self {
        Self {
            reason: ChangeReason::Moved,
            key,
            current: value,
            previous: None,
            current_index: Some(current_index),
            previous_index: Some(previous_index),
        }
    }

    fn new(reason: ChangeReason, key: K, current: V, previous: Option<V>) -> Self {
        Self {
            reason,
            key,
            current,
            previous,
            current_index: None,
            previous_index: None,
        }
    }

    /// The same change annotated with positions, as sorted operators emit it.
    pub fn at(mut self, current_index: Option<usize>, previous_index: Option<usize>) -> Self {
        self.current_index = current_index;
        self.previous_index = previous_index;
        self
    }
}

/// An ordered, atomic batch of [`Change`]s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet<V, K> {
    changes: Vec<Change<V, K>>,
}

impl<V, K> ChangeSet<V, K> {
    /// An empty batch.
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// An empty batch with room for `capacity` changes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: Vec::with_capacity(capacity),
        }
    }

    /// Appends a change to the batch.
    pub fn push(&mut self, change: Change<V, K>) {
        self.changes.push(change);
    }

    /// The number of changes in the batch.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True when the batch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates the changes in batch order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change<V, K>> {
        self.changes.iter()
    }

    /// Counts the changes carrying the given reason.
    pub fn count_of(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason == reason).count()
    }
}

impl<V, K> Default for ChangeSet<V, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, K> std::ops::Deref for ChangeSet<V, K> {
    type Target = [Change<V, K>];

    fn deref(&self) -> &Self::Target {
        &self.changes
    }
}

impl<V, K> From<Vec<Change<V, K>>> for ChangeSet<V, K> {
    fn from(changes: Vec<Change<V, K>>) -> Self {
        Self { changes }
    }
}

impl<V, K> FromIterator<Change<V, K>> for ChangeSet<V, K> {
    fn from_iter<I: IntoIterator<Item = Change<V, K>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<V, K> Extend<Change<V, K>> for ChangeSet<V, K> {
    fn extend<I: IntoIterator<Item = Change<V, K>>>(&mut self, iter: I) {
        self.changes.extend(iter);
    }
}

impl<V, K> IntoIterator for ChangeSet<V, K> {
    type Item = Change<V, K>;
    type IntoIter = std::vec::IntoIter<Change<V, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, V, K> IntoIterator for &'a ChangeSet<V, K> {
    type Item = &'a Change<V, K>;
    type IntoIter = std::slice::Iter<'a, Change<V, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_carries_both_values() {
        let change = Change::update("k", 2, 1);
        assert_eq!(change.reason, ChangeReason::Update);
        assert_eq!(change.current, 2);
        assert_eq!(change.previous, Some(1));
    }

    #[test]
    fn batch_preserves_order_and_duplicates() {
        let mut set = ChangeSet::new();
        set.push(Change::add("k", 1));
        set.push(Change::remove("k", 1));
        set.push(Change::add("k", 2));

        let reasons: Vec<_> = set.iter().map(|c| c.reason).collect();
        assert_eq!(
            reasons,
            vec![ChangeReason::Add, ChangeReason::Remove, ChangeReason::Add]
        );
        assert_eq!(set.count_of(ChangeReason::Add), 2);
    }
}
