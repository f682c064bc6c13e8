//! Live sorted/filtered collections fed by asynchronous item streams.
//!
//! A [`TrackingCollection`] consumes an unordered, non-deterministically
//! timed stream of entities and maintains a stably ordered, optionally
//! filtered projection of them. Mutations (source deliveries, direct
//! [`TrackingCollection::add_item`]/[`TrackingCollection::remove_item`]
//! calls, comparer and filter swaps) are applied in small batches by a
//! single processing loop, and subscribers receive the minimal
//! add/update/move/remove diff for each batch.
//!
//! # Architecture
//!
//! ```text
//!  source stream ──┐
//!  add_item ───────┼──► command channel ──► worker loop ──► subscribers
//!  remove_item ────┤                        (sorted list,
//!  set_comparer ───┤                         filtered view,
//!  set_filter ─────┘                         snapshot)
//! ```
//!
//! The worker owns all mutable state; producers only enqueue. Change
//! notifications are delivered from the worker's context; owners that
//! need them elsewhere (e.g. a UI thread) forward the channel themselves.

mod ordered;
mod state;
mod tracking;
mod worker;

pub use ordered::OrderedComparer;
pub use tracking::{
    Change, ChangeBatch, Comparer, Filter, Trackable, TrackingCollection, TrackingConfig,
    TrackingError,
};
