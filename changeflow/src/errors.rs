//! Error types crossing operator boundaries.
//!
//! The first error from any upstream or child stream is forwarded to the
//! downstream observer and tears the whole subscription down. Errors travel as
//! [`SharedError`] so that one failure can be multicast to any number of
//! observers. The only local recovery is the per-item escape hatch: operators
//! accepting an error callback wrap the failure into an [`ItemError`] carrying
//! the offending value and key, and skip the change.

use std::rc::Rc;

use thiserror::Error;

/// A cloneable, type-erased error as delivered to
/// [`Observer::on_error`](crate::stream::Observer::on_error).
pub type SharedError = Rc<dyn std::error::Error>;

/// Wraps any error into a [`SharedError`].
pub fn shared<E: std::error::Error + 'static>(error: E) -> SharedError {
    Rc::new(error)
}

/// A client-supplied selector, predicate or comparer failed.
#[derive(Debug, Error)]
#[error("selector failed: {message}")]
pub struct SelectorError {
    /// Description of the failing callback and cause.
    pub message: String,
}

impl SelectorError {
    /// A selector error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An operation required a key that the operator has no entry for.
///
/// Raised, for example, when an in-place transform receives an `Update` for a
/// key it never produced a destination for. Fatal for the subscription.
#[derive(Debug, Error)]
#[error("no entry for key: {key}")]
pub struct MissingKeyError {
    /// Debug rendering of the missing key.
    pub key: String,
}

impl MissingKeyError {
    /// A missing-key error for the given key.
    pub fn new(key: impl std::fmt::Debug) -> Self {
        Self {
            key: format!("{key:?}"),
        }
    }
}

/// A sorted operator could not locate an element at its expected position.
///
/// Indicates a comparer that is inconsistent between calls (or not total over
/// the observed values). Fatal for the subscription.
#[derive(Debug, Error)]
#[error("sorted element not found at its expected position: {detail}")]
pub struct SortError {
    /// What was being located when the position was missed.
    pub detail: String,
}

impl SortError {
    /// A sort error with the given detail.
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// A failure of client code for one item, as handed to an operator's error
/// callback together with the value and key the change carried.
#[derive(Debug, Clone)]
pub struct ItemError<V, K> {
    /// The underlying failure.
    pub error: SharedError,
    /// The value the failing change carried.
    pub value: V,
    /// The key the failing change applied to.
    pub key: K,
}

impl<V, K> ItemError<V, K> {
    /// Bundles an error with the value and key it applies to.
    pub fn new(error: SharedError, value: V, key: K) -> Self {
        Self { error, value, key }
    }
}
