//! Composite comparers built from key selectors.
//!
//! Sorting a collection of domain entities usually means "by this field,
//! then by that one". [`OrderedComparer`] chains key selectors into a
//! single comparison function that plugs into
//! [`TrackingCollection::set_comparer`](super::TrackingCollection::set_comparer).
//!
//! # Example
//!
//! ```ignore
//! use lively::collections::OrderedComparer;
//!
//! let cmp = OrderedComparer::order_by_desc(|issue: &Issue| issue.updated_at)
//!     .then_by(|issue: &Issue| issue.number);
//! let comparer = cmp.into_fn();
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

type KeyCompare<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// A chain of key comparisons applied in order until one decides.
pub struct OrderedComparer<T> {
    chain: Vec<KeyCompare<T>>,
}

impl<T> OrderedComparer<T> {
    /// Starts a chain ordering ascending by `selector`'s key.
    pub fn order_by<K, F>(selector: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            chain: vec![Arc::new(move |a, b| selector(a).cmp(&selector(b)))],
        }
    }

    /// Starts a chain ordering descending by `selector`'s key.
    pub fn order_by_desc<K, F>(selector: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            chain: vec![Arc::new(move |a, b| selector(b).cmp(&selector(a)))],
        }
    }

    /// Appends an ascending tie-break key.
    pub fn then_by<K, F>(mut self, selector: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.chain
            .push(Arc::new(move |a, b| selector(a).cmp(&selector(b))));
        self
    }

    /// Appends a descending tie-break key.
    pub fn then_by_desc<K, F>(mut self, selector: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.chain
            .push(Arc::new(move |a, b| selector(b).cmp(&selector(a))));
        self
    }

    /// Compares two values through the chain.
    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        for cmp in &self.chain {
            match cmp(a, b) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        Ordering::Equal
    }

    /// Converts the chain into a shareable comparison function.
    pub fn into_fn(self) -> Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>
    where
        T: 'static,
    {
        let chain = self.chain;
        Arc::new(move |a, b| {
            for cmp in &chain {
                match cmp(a, b) {
                    Ordering::Equal => continue,
                    decided => return decided,
                }
            }
            Ordering::Equal
        })
    }
}

impl<T> Clone for OrderedComparer<T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}
