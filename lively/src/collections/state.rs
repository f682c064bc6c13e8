//! Reconciliation engine for the tracking collection.
//!
//! Two parallel views are maintained: the fully sorted internal list of
//! every tracked item, and the live view: the subsequence of the internal
//! list currently passing the positional filter. The live view is always a
//! subsequence, in the same relative order, of the internal list.
//!
//! Every mutation is applied to the internal list first (classify by id,
//! binary-search the affected positions), then visibility is recomputed
//! over the full sorted snapshot; inserting or deleting shifts every
//! subsequent index, and a positional filter can flip the visibility of
//! items that did not themselves change, so no span short of the whole
//! list is safe for an arbitrary predicate. The live view is then
//! reconciled against the fresh projection, emitting the minimal
//! add/update/move/remove diff.

use std::cmp::Ordering;

use super::tracking::{Change, Comparer, Filter, Trackable};

pub(crate) struct CollectionState<T: Trackable> {
    /// Every item ever added, fully sorted (arrival order if no comparer).
    sorted: Vec<T>,

    /// The filtered live view, a subsequence of `sorted`.
    live: Vec<T>,

    comparer: Option<Comparer<T>>,
    filter: Option<Filter<T>>,
    newer: Option<Comparer<T>>,
}

impl<T: Trackable> CollectionState<T> {
    pub(crate) fn new(
        comparer: Option<Comparer<T>>,
        filter: Option<Filter<T>>,
        newer: Option<Comparer<T>>,
    ) -> Self {
        Self {
            sorted: Vec::new(),
            live: Vec::new(),
            comparer,
            filter,
            newer,
        }
    }

    pub(crate) fn live(&self) -> &[T] {
        &self.live
    }

    pub(crate) fn unfiltered_len(&self) -> usize {
        self.sorted.len()
    }

    /// Applies an incoming item: a new entry, or an update (possibly a
    /// move) of the existing entry with the same id.
    pub(crate) fn upsert(&mut self, item: T, changes: &mut Vec<Change<T>>) {
        let id = item.id();
        match self.position_of(&id) {
            Some(pos) => {
                if let Some(newer) = &self.newer {
                    // Stale delivery (e.g. cached data racing live data).
                    if newer(&item, &self.sorted[pos]) != Ordering::Less {
                        return;
                    }
                }

                let moved = match &self.comparer {
                    Some(cmp) => cmp(&item, &self.sorted[pos]) != Ordering::Equal,
                    None => false,
                };

                if moved {
                    self.sorted.remove(pos);
                    let new_pos = self.insertion_point(&item);
                    self.sorted.insert(new_pos, item.clone());
                } else {
                    self.sorted[pos] = item.clone();
                }

                let before = changes.len();
                self.reconcile_hinted(changes, Some(&id));

                // Content change that altered neither membership nor order
                // still has to reach observers.
                let touched = changes[before..].iter().any(|c| c.item().id() == id);
                if !touched {
                    if let Some(index) = self.live.iter().position(|x| x.id() == id) {
                        changes.push(Change::Updated { item, index });
                    }
                }
            }
            None => {
                let pos = self.insertion_point(&item);
                self.sorted.insert(pos, item);
                self.reconcile(changes);
            }
        }
    }

    /// Removes the entry with this item's id. Unknown ids are ignored.
    /// The entry leaves the internal list even when it is not currently
    /// visible, so later filter or comparer changes see correct state.
    pub(crate) fn remove(&mut self, item: &T, changes: &mut Vec<Change<T>>) {
        let id = item.id();
        let Some(pos) = self.position_of(&id) else {
            return;
        };
        self.sorted.remove(pos);
        self.reconcile(changes);
    }

    /// Swaps the comparer and re-sorts. The sort is stable, so equal items
    /// keep their arrival order.
    pub(crate) fn set_comparer(&mut self, comparer: Option<Comparer<T>>, changes: &mut Vec<Change<T>>) {
        self.comparer = comparer;
        if let Some(cmp) = self.comparer.clone() {
            self.sorted.sort_by(|a, b| cmp(a, b));
        }
        self.reconcile(changes);
    }

    /// Swaps the filter and recomputes visibility for every position.
    pub(crate) fn set_filter(&mut self, filter: Option<Filter<T>>, changes: &mut Vec<Change<T>>) {
        self.filter = filter;
        self.reconcile(changes);
    }

    fn position_of(&self, id: &T::Id) -> Option<usize> {
        self.sorted.iter().position(|x| x.id() == *id)
    }

    /// Insertion point keeping `sorted` ordered; ties insert after their
    /// equals so arrival order is preserved. Without a comparer items
    /// append.
    fn insertion_point(&self, item: &T) -> usize {
        match &self.comparer {
            Some(cmp) => self
                .sorted
                .partition_point(|probe| cmp(probe, item) != Ordering::Greater),
            None => self.sorted.len(),
        }
    }

    fn reconcile(&mut self, changes: &mut Vec<Change<T>>) {
        self.reconcile_hinted(changes, None)
    }

    /// Recomputes the filtered projection and drives `live` to it,
    /// emitting the minimal diff: departures right-to-left, then the
    /// repositioned item (when a single item is known to have moved), then
    /// one move or insert per remaining out-of-place target position.
    /// Items that keep their position have their contents refreshed
    /// silently. Indices are valid at each change's application time.
    fn reconcile_hinted(&mut self, changes: &mut Vec<Change<T>>, moved_hint: Option<&T::Id>) {
        let target: Vec<T> = match &self.filter {
            Some(filter) => {
                let snapshot = &self.sorted;
                snapshot
                    .iter()
                    .enumerate()
                    .filter(|&(i, item)| filter(item, i, snapshot))
                    .map(|(_, item)| item.clone())
                    .collect()
            }
            None => self.sorted.clone(),
        };

        // Departures first, highest index first.
        for i in (0..self.live.len()).rev() {
            let id = self.live[i].id();
            if !target.iter().any(|x| x.id() == id) {
                let item = self.live.remove(i);
                changes.push(Change::Removed { item, index: i });
            }
        }

        // A single repositioned item is re-seated up front; otherwise the
        // left-to-right walk below would express its displacement as a
        // cascade of moves of every item it jumped over.
        if let Some(id) = moved_hint {
            let from = self.live.iter().position(|x| x.id() == *id);
            let target_pos = target.iter().position(|x| x.id() == *id);
            if let (Some(from), Some(target_pos)) = (from, target_pos) {
                self.live.remove(from);
                let to = self
                    .live
                    .iter()
                    .filter(|x| {
                        let xid = x.id();
                        target
                            .iter()
                            .position(|y| y.id() == xid)
                            .map(|p| p < target_pos)
                            .unwrap_or(false)
                    })
                    .count();
                self.live.insert(to, target[target_pos].clone());
                if from != to {
                    changes.push(Change::Moved {
                        item: target[target_pos].clone(),
                        old_index: from,
                        new_index: to,
                    });
                }
            }
        }

        // Walk target positions left to right. Positions before `t` are
        // settled, so a present-but-misplaced item always sits at an index
        // greater than `t`.
        for t in 0..target.len() {
            let id = target[t].id();
            match self.live.iter().position(|x| x.id() == id) {
                Some(current) if current == t => {
                    self.live[t] = target[t].clone();
                }
                Some(current) => {
                    self.live.remove(current);
                    self.live.insert(t, target[t].clone());
                    changes.push(Change::Moved {
                        item: target[t].clone(),
                        old_index: current,
                        new_index: t,
                    });
                }
                None => {
                    self.live.insert(t, target[t].clone());
                    changes.push(Change::Added {
                        item: target[t].clone(),
                        index: t,
                    });
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
