//! The collection's processing loop.
//!
//! A single task owns all mutable state. Producers (the source stream,
//! `add_item`/`remove_item` callers, comparer/filter swaps) only enqueue;
//! the loop drains the queue in batches spaced by the configured
//! processing delay, applies each batch through the reconciliation engine,
//! refreshes the shared snapshot, and publishes one [`ChangeBatch`] per
//! tick to subscribers. With a zero delay every command is its own tick,
//! which tests rely on for deterministic ordering.
//!
//! Shutdown follows the cancellation-token idiom: the handle cancels, the
//! loop breaks out of its select, and dropping the subscriber senders
//! completes every change stream.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::state::CollectionState;
use super::tracking::{Change, ChangeBatch, Comparer, Filter, Trackable, TrackingConfig};

/// Commands accepted by the worker.
pub(crate) enum Command<T: Trackable> {
    Upsert(T),
    Remove(T),
    SetComparer(Option<Comparer<T>>),
    SetFilter(Option<Filter<T>>),
    Subscribe(mpsc::UnboundedSender<ChangeBatch<T>>),
}

/// Snapshot of the collection shared between the worker and the handle.
pub(crate) struct SharedSnapshot<T> {
    inner: RwLock<SnapshotInner<T>>,
}

struct SnapshotInner<T> {
    live: Vec<T>,
    unfiltered: usize,
}

impl<T> Default for SharedSnapshot<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(SnapshotInner {
                live: Vec::new(),
                unfiltered: 0,
            }),
        }
    }
}

impl<T: Clone> SharedSnapshot<T> {
    pub(crate) fn live(&self) -> Vec<T> {
        self.inner.read().live.clone()
    }

    pub(crate) fn live_len(&self) -> usize {
        self.inner.read().live.len()
    }

    pub(crate) fn unfiltered_count(&self) -> usize {
        self.inner.read().unfiltered
    }

    fn store(&self, live: Vec<T>, unfiltered: usize) {
        let mut inner = self.inner.write();
        inner.live = live;
        inner.unfiltered = unfiltered;
    }
}

pub(crate) struct TrackingWorker<T: Trackable> {
    state: CollectionState<T>,
    command_rx: mpsc::UnboundedReceiver<Command<T>>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeBatch<T>>>,
    snapshot: Arc<SharedSnapshot<T>>,
    processing_delay: Duration,
    /// Mutations enqueued before the first subscriber; processing starts
    /// on first subscription, so nothing is observable before anyone
    /// observes.
    pending: Vec<Command<T>>,
    started: bool,
    source_done: bool,
    completion_published: bool,
}

impl<T: Trackable> TrackingWorker<T> {
    pub(crate) fn new(
        config: TrackingConfig<T>,
        command_rx: mpsc::UnboundedReceiver<Command<T>>,
        snapshot: Arc<SharedSnapshot<T>>,
    ) -> Self {
        Self {
            state: CollectionState::new(config.comparer, config.filter, config.newer),
            command_rx,
            subscribers: Vec::new(),
            snapshot,
            processing_delay: config.processing_delay,
            pending: Vec::new(),
            started: false,
            source_done: false,
            completion_published: false,
        }
    }

    /// Runs until the shutdown token fires or every command sender is
    /// gone. The source stream is merged into the command flow here, so
    /// one loop serializes all mutations.
    ///
    /// The source is not polled until the first subscriber arrives;
    /// mutations enqueued before then are buffered and applied as the
    /// first batch.
    pub(crate) async fn run<S>(mut self, source: S, shutdown: CancellationToken)
    where
        S: Stream<Item = T> + Send,
    {
        debug!("Tracking worker starting");
        let mut source = std::pin::pin!(source.fuse());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Tracking worker shutting down");
                    break;
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Subscribe(tx)) => self.add_subscriber(tx),
                        Some(command) if !self.started => self.pending.push(command),
                        Some(command) => self.tick(command, &mut source, &shutdown).await,
                        // Handle gone and queue drained.
                        None => break,
                    }
                }

                item = source.next(), if self.started && !self.source_done => {
                    match item {
                        Some(item) => self.tick(Command::Upsert(item), &mut source, &shutdown).await,
                        None => {
                            self.source_done = true;
                            self.publish_completion_if_due();
                        }
                    }
                }
            }
        }

        // Dropping the senders completes subscriber streams.
        self.subscribers.clear();
        debug!("Tracking worker stopped");
    }

    fn add_subscriber(&mut self, tx: mpsc::UnboundedSender<ChangeBatch<T>>) {
        // A subscriber arriving after the source finished still learns
        // about completion; the snapshot carries the state itself.
        if self.completion_published {
            let _ = tx.send(ChangeBatch {
                changes: Vec::new(),
                source_completed: true,
            });
        }
        self.subscribers.push(tx);

        if !self.started {
            self.started = true;
            let pending = std::mem::take(&mut self.pending);
            if !pending.is_empty() {
                self.apply_and_publish(pending);
            }
        }
    }

    /// One processing tick: batch up work for the processing delay, apply
    /// it, refresh the snapshot, publish the diff.
    async fn tick<S>(
        &mut self,
        first: Command<T>,
        source: &mut std::pin::Pin<&mut futures::stream::Fuse<S>>,
        shutdown: &CancellationToken,
    ) where
        S: Stream<Item = T> + Send,
    {
        let mut batch = vec![first];

        if !self.processing_delay.is_zero() {
            let deadline = tokio::time::sleep(self.processing_delay);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    _ = &mut deadline => break,

                    command = self.command_rx.recv() => {
                        match command {
                            Some(command) => batch.push(command),
                            None => break,
                        }
                    }

                    item = source.next(), if !self.source_done => {
                        match item {
                            Some(item) => batch.push(Command::Upsert(item)),
                            None => self.source_done = true,
                        }
                    }
                }
            }
        }

        self.apply_and_publish(batch);
    }

    fn apply_and_publish(&mut self, batch: Vec<Command<T>>) {
        let mut changes = Vec::new();
        for command in batch {
            match command {
                Command::Upsert(item) => self.state.upsert(item, &mut changes),
                Command::Remove(item) => self.state.remove(&item, &mut changes),
                Command::SetComparer(comparer) => self.state.set_comparer(comparer, &mut changes),
                Command::SetFilter(filter) => self.state.set_filter(filter, &mut changes),
                Command::Subscribe(tx) => self.add_subscriber(tx),
            }
        }

        self.snapshot
            .store(self.state.live().to_vec(), self.state.unfiltered_len());

        if !changes.is_empty() {
            trace!(changes = changes.len(), "Publishing change batch");
            self.publish(changes, false);
        }
        self.publish_completion_if_due();
    }

    fn publish_completion_if_due(&mut self) {
        if self.source_done && !self.completion_published {
            self.completion_published = true;
            self.publish(Vec::new(), true);
        }
    }

    fn publish(&mut self, changes: Vec<Change<T>>, source_completed: bool) {
        self.subscribers.retain(|tx| {
            tx.send(ChangeBatch {
                changes: changes.clone(),
                source_completed,
            })
            .is_ok()
        });
    }
}
