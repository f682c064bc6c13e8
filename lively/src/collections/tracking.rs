//! The `TrackingCollection` public surface.
//!
//! The collection is a handle over a background processing loop (see
//! [`worker`](super::worker)): every mutation (source items, direct
//! adds/removes, comparer and filter swaps) is enqueued to the loop,
//! which owns the sorted internal list and the filtered live view.
//! Subscribers receive one [`ChangeBatch`] per processing tick; the
//! current view is always available synchronously through
//! [`TrackingCollection::snapshot`].

use std::cmp::Ordering;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::worker::{Command, SharedSnapshot, TrackingWorker};

/// Comparison function deciding the collection's total order.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Positional filter predicate: receives the item, its index in the fully
/// sorted internal list, and the sorted list itself. Position-dependence is
/// the point: "the five most recent" is expressible only because the
/// filter sees where the item landed.
pub type Filter<T> = Arc<dyn Fn(&T, usize, &[T]) -> bool + Send + Sync>;

/// Items a collection can track.
///
/// `id` is the logical identity: an incoming item whose id matches an
/// existing one is an update to that item (new field values), not a second
/// entry.
pub trait Trackable: Clone + Send + Sync + 'static {
    /// Logical identity type.
    type Id: Eq + Hash + Clone + Send + 'static;

    /// The item's logical identity.
    fn id(&self) -> Self::Id;
}

/// A single post-filter mutation of the observed view.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// An item entered the view at `index`.
    Added {
        /// The item as it appears in the view.
        item: T,
        /// Index at which it was inserted.
        index: usize,
    },

    /// An item already in the view changed contents without moving.
    Updated {
        /// The refreshed item.
        item: T,
        /// Its (unchanged) index.
        index: usize,
    },

    /// An item changed position within the view.
    Moved {
        /// The item, with any content changes applied.
        item: T,
        /// Index before the move.
        old_index: usize,
        /// Index after the move.
        new_index: usize,
    },

    /// An item left the view.
    Removed {
        /// The removed item.
        item: T,
        /// Index it occupied when removed.
        index: usize,
    },
}

impl<T> Change<T> {
    /// The item this change concerns.
    pub fn item(&self) -> &T {
        match self {
            Change::Added { item, .. }
            | Change::Updated { item, .. }
            | Change::Moved { item, .. }
            | Change::Removed { item, .. } => item,
        }
    }
}

/// One processing tick's worth of changes, in application order.
///
/// Indices are valid at the moment each change is applied in sequence.
/// `source_completed` is set on the batch published when the item source
/// finishes and the queue has drained.
#[derive(Debug, Clone)]
pub struct ChangeBatch<T> {
    /// Changes in application order.
    pub changes: Vec<Change<T>>,

    /// True once the source stream has completed.
    pub source_completed: bool,
}

/// Configuration for a [`TrackingCollection`].
#[derive(Clone)]
pub struct TrackingConfig<T> {
    /// Total order over items. `None` preserves arrival order.
    pub comparer: Option<Comparer<T>>,

    /// Positional filter deciding view membership. `None` shows everything.
    pub filter: Option<Filter<T>>,

    /// Staleness guard: given (incoming, existing) for two items with the
    /// same id, an incoming item that does not order `Less` is considered
    /// stale and dropped. `None` accepts every update. Useful when live
    /// data and cached data race on the same feed.
    pub newer: Option<Comparer<T>>,

    /// Batching interval for the processing loop. Zero applies each
    /// mutation immediately in its own batch.
    pub processing_delay: Duration,
}

impl<T> Default for TrackingConfig<T> {
    fn default() -> Self {
        Self {
            comparer: None,
            filter: None,
            newer: None,
            processing_delay: Duration::from_millis(10),
        }
    }
}

impl<T> TrackingConfig<T> {
    /// Configuration with no ordering, no filter, and default batching.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the comparer.
    pub fn with_comparer(mut self, comparer: Comparer<T>) -> Self {
        self.comparer = Some(comparer);
        self
    }

    /// Sets the positional filter.
    pub fn with_filter(mut self, filter: Filter<T>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the staleness guard.
    pub fn with_newer(mut self, newer: Comparer<T>) -> Self {
        self.newer = Some(newer);
        self
    }

    /// Sets the batching interval.
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }
}

/// Errors from misusing a collection. These indicate caller bugs and are
/// never absorbed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackingError {
    /// The collection has been disposed.
    #[error("The tracking collection has been disposed")]
    Disposed,

    /// No source has been wired; call `listen` first.
    #[error("No source has been set; call listen() before using the collection")]
    NotInitialized,

    /// `listen` was already called on this collection.
    #[error("A source is already being tracked")]
    AlreadyListening,
}

enum HandleState<T: Trackable> {
    Idle(Box<TrackingConfig<T>>),
    Listening(mpsc::UnboundedSender<Command<T>>),
    Disposed,
}

/// A live, sorted, optionally filtered projection of an asynchronous item
/// stream.
///
/// Construct with [`TrackingCollection::new`], wire a source with
/// [`listen`](Self::listen), then observe through
/// [`subscribe`](Self::subscribe) and [`snapshot`](Self::snapshot) while
/// mutating from any thread with [`add_item`](Self::add_item) /
/// [`remove_item`](Self::remove_item). The observed view is read-only by
/// construction; membership and order change only through the source, the
/// mutators, and comparer/filter swaps.
pub struct TrackingCollection<T: Trackable> {
    state: Mutex<HandleState<T>>,
    shutdown: CancellationToken,
    snapshot: Arc<SharedSnapshot<T>>,
}

impl<T: Trackable> TrackingCollection<T> {
    /// Creates a collection with the given configuration. No processing
    /// happens until [`listen`](Self::listen) wires a source.
    pub fn new(config: TrackingConfig<T>) -> Self {
        Self {
            state: Mutex::new(HandleState::Idle(Box::new(config))),
            shutdown: CancellationToken::new(),
            snapshot: Arc::new(SharedSnapshot::default()),
        }
    }

    /// Wires the asynchronous item source and starts the processing loop.
    ///
    /// Must be called from within a tokio runtime. The source may never
    /// complete (a live feed); items keep flowing until
    /// [`dispose`](Self::dispose).
    pub fn listen<S>(&self, source: S) -> Result<(), TrackingError>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let mut state = self.state.lock();
        let config = match &*state {
            HandleState::Idle(_) => match std::mem::replace(&mut *state, HandleState::Disposed) {
                HandleState::Idle(config) => *config,
                _ => unreachable!(),
            },
            HandleState::Listening(_) => return Err(TrackingError::AlreadyListening),
            HandleState::Disposed => return Err(TrackingError::Disposed),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = TrackingWorker::new(config, command_rx, Arc::clone(&self.snapshot));
        tokio::spawn(worker.run(source, self.shutdown.clone()));

        *state = HandleState::Listening(command_tx);
        Ok(())
    }

    /// Subscribes to change batches published by the processing loop.
    ///
    /// The receiver sees every batch from subscription onward; use
    /// [`snapshot`](Self::snapshot) to catch up on the current state. The
    /// channel closes when the collection is disposed.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChangeBatch<T>>, TrackingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe(tx))?;
        Ok(rx)
    }

    /// Injects an item: a brand-new entry, or an update to the existing
    /// entry with the same id. Safe to call from any thread, concurrently
    /// with the source.
    pub fn add_item(&self, item: T) -> Result<(), TrackingError> {
        self.send(Command::Upsert(item))
    }

    /// Removes the entry with this item's id, if present. Removing an
    /// unknown item is a no-op.
    pub fn remove_item(&self, item: T) -> Result<(), TrackingError> {
        self.send(Command::Remove(item))
    }

    /// Replaces the comparer, re-sorting the internal list and emitting
    /// the minimal diff to bring the view to the new order; observers
    /// never see a clear-and-rebuild.
    pub fn set_comparer(&self, comparer: Option<Comparer<T>>) -> Result<(), TrackingError> {
        self.send(Command::SetComparer(comparer))
    }

    /// Replaces the filter, recomputing visibility for every position and
    /// emitting the minimal diff, as with
    /// [`set_comparer`](Self::set_comparer).
    pub fn set_filter(&self, filter: Option<Filter<T>>) -> Result<(), TrackingError> {
        self.send(Command::SetFilter(filter))
    }

    /// The current filtered view.
    pub fn snapshot(&self) -> Vec<T> {
        self.snapshot.live()
    }

    /// Number of items in the internal list, regardless of filtering.
    pub fn unfiltered_count(&self) -> usize {
        self.snapshot.unfiltered_count()
    }

    /// Stops the processing loop and completes subscriber channels.
    /// Subsequent mutation calls fail with [`TrackingError::Disposed`].
    /// Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        *state = HandleState::Disposed;
        self.shutdown.cancel();
    }

    /// True once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Disposed)
    }

    fn send(&self, command: Command<T>) -> Result<(), TrackingError> {
        let state = self.state.lock();
        match &*state {
            HandleState::Idle(_) => Err(TrackingError::NotInitialized),
            HandleState::Disposed => Err(TrackingError::Disposed),
            HandleState::Listening(tx) => {
                tx.send(command).map_err(|_| TrackingError::Disposed)
            }
        }
    }
}

impl<T: Trackable> Drop for TrackingCollection<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T: Trackable> std::fmt::Debug for TrackingCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            HandleState::Idle(_) => "idle",
            HandleState::Listening(_) => "listening",
            HandleState::Disposed => "disposed",
        };
        f.debug_struct("TrackingCollection")
            .field("state", &state)
            .field("len", &self.snapshot.live_len())
            .finish()
    }
}
