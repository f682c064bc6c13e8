//! End-to-end tests for the tracking collection: an async source feeding
//! the processing loop, concurrent direct mutation, and subscriber-visible
//! change batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use lively::collections::{
    ChangeBatch, Comparer, Filter, OrderedComparer, Trackable, TrackingCollection,
    TrackingConfig, TrackingError,
};

#[derive(Debug, Clone, PartialEq)]
struct Issue {
    number: u32,
    title: String,
    updated_at: DateTime<Utc>,
}

impl Trackable for Issue {
    type Id = u32;

    fn id(&self) -> u32 {
        self.number
    }
}

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

fn issue(number: u32, minutes: i64) -> Issue {
    Issue {
        number,
        title: format!("issue #{number}"),
        updated_at: at(minutes),
    }
}

fn by_updated_at() -> Comparer<Issue> {
    OrderedComparer::order_by(|i: &Issue| i.updated_at).into_fn()
}

fn by_updated_at_desc() -> Comparer<Issue> {
    OrderedComparer::order_by_desc(|i: &Issue| i.updated_at).into_fn()
}

fn numbers(items: &[Issue]) -> Vec<u32> {
    items.iter().map(|i| i.number).collect()
}

/// Receives the next batch or panics after a generous deadline.
async fn next_batch(rx: &mut UnboundedReceiver<ChangeBatch<Issue>>) -> ChangeBatch<Issue> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a change batch")
        .expect("change stream ended unexpectedly")
}

/// Receives batches until one carries the source-completed flag.
async fn drain_until_completed(rx: &mut UnboundedReceiver<ChangeBatch<Issue>>) {
    loop {
        if next_batch(rx).await.source_completed {
            return;
        }
    }
}

/// An immediate-mode collection (no batching delay) with no source items,
/// for tests that drive everything through `add_item`.
fn manual_collection(config: TrackingConfig<Issue>) -> TrackingCollection<Issue> {
    let col = TrackingCollection::new(config.with_processing_delay(Duration::ZERO));
    col.listen(stream::pending::<Issue>()).unwrap();
    col
}

#[tokio::test]
async fn source_items_arrive_sorted_ascending() {
    let col = TrackingCollection::new(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_processing_delay(Duration::ZERO),
    );

    let items = vec![issue(1, 30), issue(2, 10), issue(3, 50), issue(4, 20)];
    col.listen(stream::iter(items.clone())).unwrap();
    let mut rx = col.subscribe().unwrap();

    drain_until_completed(&mut rx).await;

    let mut expected = items;
    expected.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
    assert_eq!(col.snapshot(), expected);
}

#[tokio::test]
async fn source_items_arrive_sorted_descending() {
    let col = TrackingCollection::new(
        TrackingConfig::new()
            .with_comparer(by_updated_at_desc())
            .with_processing_delay(Duration::ZERO),
    );

    let items: Vec<_> = (0..8).map(|n| issue(n, (n as i64 * 7) % 11)).collect();
    col.listen(stream::iter(items.clone())).unwrap();
    let mut rx = col.subscribe().unwrap();

    drain_until_completed(&mut rx).await;

    let mut expected = items;
    expected.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    assert_eq!(col.snapshot(), expected);
}

#[tokio::test]
async fn positional_window_tracks_moving_items() {
    // visible = sorted positions 2..=4 of the descending-by-time order
    let window: Filter<Issue> = Arc::new(|_, index, _| (2..=4).contains(&index));
    let col = manual_collection(
        TrackingConfig::new()
            .with_comparer(by_updated_at_desc())
            .with_filter(window),
    );
    let _rx = col.subscribe().unwrap();

    for (n, minutes) in [(1, 60), (2, 50), (3, 40), (4, 30), (5, 20), (6, 10)] {
        col.add_item(issue(n, minutes)).unwrap();
    }
    settle(&col, 6).await;

    // sorted: [1,2,3,4,5,6]; window -> positions 2,3,4
    assert_eq!(numbers(&col.snapshot()), vec![3, 4, 5]);

    // a new newest item shifts every position down by one
    col.add_item(issue(7, 70)).unwrap();
    settle(&col, 7).await;
    assert_eq!(numbers(&col.snapshot()), vec![2, 3, 4]);
}

/// Polls until the internal list reaches the expected size.
async fn settle(col: &TrackingCollection<Issue>, unfiltered: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if col.unfiltered_count() == unfiltered {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("collection never settled")
}

#[tokio::test]
async fn filter_change_matches_fresh_computation() {
    let col = manual_collection(TrackingConfig::new().with_comparer(by_updated_at()));
    let mut rx = col.subscribe().unwrap();

    for n in 0..6 {
        col.add_item(issue(n, n as i64)).unwrap();
        next_batch(&mut rx).await;
    }

    let top_three: Filter<Issue> = Arc::new(|_, index, list| index >= list.len().saturating_sub(3));
    col.set_filter(Some(top_three)).unwrap();
    let batch = next_batch(&mut rx).await;

    assert_eq!(numbers(&col.snapshot()), vec![3, 4, 5]);
    // three departures, no clear-and-rebuild of the survivors
    assert_eq!(batch.changes.len(), 3);
    assert_eq!(col.unfiltered_count(), 6);

    col.set_filter(None).unwrap();
    next_batch(&mut rx).await;
    assert_eq!(numbers(&col.snapshot()), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn comparer_change_reorders_without_clear() {
    let col = manual_collection(TrackingConfig::new().with_comparer(by_updated_at()));
    let mut rx = col.subscribe().unwrap();

    for n in 0..5 {
        col.add_item(issue(n, n as i64)).unwrap();
        next_batch(&mut rx).await;
    }
    assert_eq!(numbers(&col.snapshot()), vec![0, 1, 2, 3, 4]);

    col.set_comparer(Some(by_updated_at_desc())).unwrap();
    let batch = next_batch(&mut rx).await;

    assert_eq!(numbers(&col.snapshot()), vec![4, 3, 2, 1, 0]);
    for change in &batch.changes {
        assert!(
            matches!(
                change,
                lively::collections::Change::Moved { .. }
                    | lively::collections::Change::Updated { .. }
            ),
            "observers must not see adds/removes on a pure reorder, got {change:?}"
        );
    }
}

#[tokio::test]
async fn update_crosses_time_window_filter() {
    // content filter: only issues updated within the last "hour" of t=60
    let recent: Filter<Issue> = Arc::new(|item, _, _| item.updated_at >= at(0));
    let col = manual_collection(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_filter(recent),
    );
    let mut rx = col.subscribe().unwrap();

    col.add_item(issue(1, -30)).unwrap(); // outside the window
    col.add_item(issue(2, 10)).unwrap();
    next_batch(&mut rx).await; // only issue 2 is visible
    assert_eq!(numbers(&col.snapshot()), vec![2]);
    assert_eq!(col.unfiltered_count(), 2);

    // issue 1 gets touched and crosses into the window at the right spot
    col.add_item(issue(1, 20)).unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(numbers(&col.snapshot()), vec![2, 1]);
    assert!(batch
        .changes
        .iter()
        .any(|c| matches!(c, lively::collections::Change::Added { item, .. } if item.number == 1)));

    // and back out again
    col.add_item(issue(1, -40)).unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(numbers(&col.snapshot()), vec![2]);
    assert!(batch
        .changes
        .iter()
        .any(|c| matches!(c, lively::collections::Change::Removed { item, .. } if item.number == 1)));
}

#[tokio::test]
async fn removing_invisible_item_emits_nothing() {
    let first_two: Filter<Issue> = Arc::new(|_, index, _| index < 2);
    let col = manual_collection(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_filter(first_two),
    );
    let mut rx = col.subscribe().unwrap();

    for n in 1..=3 {
        col.add_item(issue(n, n as i64)).unwrap();
    }
    next_batch(&mut rx).await;
    next_batch(&mut rx).await;
    assert_eq!(numbers(&col.snapshot()), vec![1, 2]);
    assert_eq!(col.unfiltered_count(), 3);

    // issue 3 is outside the filter; its removal must not reach observers
    // but must shrink the internal list
    col.remove_item(issue(3, 0)).unwrap();

    timeout(Duration::from_millis(200), async {
        loop {
            if col.unfiltered_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("internal list never shrank");

    assert_eq!(numbers(&col.snapshot()), vec![1, 2]);
    assert!(rx.try_recv().is_err(), "no batch should have been published");
}

#[tokio::test]
async fn thousand_items_under_batching_settle_sorted() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let col = Arc::new(TrackingCollection::new(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_processing_delay(Duration::from_millis(20)),
    ));

    // half the items from the source stream in random order, half
    // injected concurrently
    let mut from_source: Vec<_> = (0..500).map(|n| issue(n, n as i64)).collect();
    from_source.shuffle(&mut rand::rng());
    col.listen(stream::iter(from_source)).unwrap();
    let _rx = col.subscribe().unwrap();

    let injector = Arc::clone(&col);
    let handle = tokio::spawn(async move {
        for n in 500..1000u32 {
            injector.add_item(issue(n, n as i64)).unwrap();
            if n % 97 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });
    handle.await.unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            if col.snapshot().len() == 1000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("collection never reached 1000 items");

    let snapshot = col.snapshot();
    let expected: Vec<u32> = (0..1000).collect();
    assert_eq!(numbers(&snapshot), expected);
}

#[tokio::test]
async fn batching_coalesces_changes_into_one_tick() {
    let col = TrackingCollection::new(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_processing_delay(Duration::from_millis(100)),
    );
    col.listen(stream::pending::<Issue>()).unwrap();
    let mut rx = col.subscribe().unwrap();

    // enqueue a burst before the first tick's delay elapses
    for n in 0..5 {
        col.add_item(issue(n, n as i64)).unwrap();
    }

    let batch = next_batch(&mut rx).await;
    assert_eq!(batch.changes.len(), 5, "burst should land in a single batch");
}

#[tokio::test]
async fn source_completion_is_signalled_once_queue_drains() {
    let col = TrackingCollection::new(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_processing_delay(Duration::ZERO),
    );
    col.listen(stream::iter(vec![issue(1, 1), issue(2, 2)]))
        .unwrap();
    let mut rx = col.subscribe().unwrap();

    let mut items_seen = 0;
    loop {
        let batch = next_batch(&mut rx).await;
        items_seen += batch.changes.len();
        if batch.source_completed {
            break;
        }
    }
    assert_eq!(items_seen, 2);
    assert_eq!(col.snapshot().len(), 2);

    // direct injection still works after the source completes
    col.add_item(issue(3, 3)).unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(batch.changes.len(), 1);
    assert_eq!(col.snapshot().len(), 3);
}

#[tokio::test]
async fn using_collection_before_listen_is_an_error() {
    let col = TrackingCollection::new(TrackingConfig::<Issue>::new());

    assert_eq!(col.subscribe().err(), Some(TrackingError::NotInitialized));
    assert_eq!(
        col.add_item(issue(1, 1)).err(),
        Some(TrackingError::NotInitialized)
    );
    assert_eq!(
        col.remove_item(issue(1, 1)).err(),
        Some(TrackingError::NotInitialized)
    );
}

#[tokio::test]
async fn listen_twice_is_an_error() {
    let col = TrackingCollection::new(TrackingConfig::<Issue>::new());
    col.listen(stream::pending::<Issue>()).unwrap();

    let result = col.listen(stream::pending::<Issue>());
    assert_eq!(result.err(), Some(TrackingError::AlreadyListening));
}

#[tokio::test]
async fn dispose_poisons_mutators_and_completes_subscribers() {
    let col = manual_collection(TrackingConfig::new().with_comparer(by_updated_at()));
    let mut rx = col.subscribe().unwrap();

    col.add_item(issue(1, 1)).unwrap();
    next_batch(&mut rx).await;

    col.dispose();
    assert!(col.is_disposed());

    assert_eq!(col.add_item(issue(2, 2)).err(), Some(TrackingError::Disposed));
    assert_eq!(
        col.remove_item(issue(1, 1)).err(),
        Some(TrackingError::Disposed)
    );
    assert_eq!(col.set_comparer(None).err(), Some(TrackingError::Disposed));
    assert_eq!(col.set_filter(None).err(), Some(TrackingError::Disposed));
    assert_eq!(col.subscribe().err(), Some(TrackingError::Disposed));

    // the change stream completes
    let end = timeout(Duration::from_secs(5), async {
        loop {
            if rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(end.is_ok(), "subscriber stream never completed");

    // dispose is idempotent
    col.dispose();
}

#[tokio::test]
async fn stale_updates_are_ignored_with_newer_guard() {
    // an incoming item wins only if its timestamp is strictly newer
    let newer: Comparer<Issue> = Arc::new(|incoming: &Issue, existing: &Issue| {
        existing.updated_at.cmp(&incoming.updated_at)
    });
    let col = manual_collection(
        TrackingConfig::new()
            .with_comparer(by_updated_at())
            .with_newer(newer),
    );
    let mut rx = col.subscribe().unwrap();

    col.add_item(issue(1, 50)).unwrap();
    next_batch(&mut rx).await;

    // stale delivery (e.g. from a cache) must not clobber live data
    col.add_item(issue(1, 40)).unwrap();
    col.add_item(issue(2, 10)).unwrap();
    next_batch(&mut rx).await;

    let snapshot = col.snapshot();
    let one = snapshot.iter().find(|i| i.number == 1).unwrap();
    assert_eq!(one.updated_at, at(50));
}
