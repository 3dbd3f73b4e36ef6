use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use kafka_pipeline::kafka::test_utils::InMemoryBroker;
use kafka_pipeline::policy::{OffsetKind, OffsetPolicy, PolicySet};
use kafka_pipeline::{Subscription, SubscriptionManager, SubscriptionRequest};

mod common;
use common::*;

async fn subscribe_from(
    manager: &SubscriptionManager,
    offset: OffsetPolicy,
    seen: Seen,
) -> Subscription {
    let policies = PolicySet::builder().offset(offset).build().unwrap();
    manager
        .subscribe(SubscriptionRequest::new(
            "orders",
            policies,
            recording_messages(seen),
            utf8(),
        ))
        .await
        .unwrap()
        .unwrap()
}

fn offsets(seen: &Seen) -> Vec<i64> {
    seen.lock().unwrap().iter().map(|(_, offset)| *offset).collect()
}

fn produce_ten(broker: &InMemoryBroker) {
    produce_n(broker, "orders", 1, 10);
}

#[tokio::test]
async fn test_begin_with_positive_bias() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription =
        subscribe_from(&manager, OffsetPolicy::new(OffsetKind::Begin, 3), seen.clone()).await;

    assert!(wait_for(WAIT, || len(&seen) == 7).await);
    assert_eq!(offsets(&seen), (3..10).collect::<Vec<i64>>());
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_end_with_negative_bias() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription =
        subscribe_from(&manager, OffsetPolicy::new(OffsetKind::End, -2), seen.clone()).await;

    assert!(wait_for(WAIT, || len(&seen) == 2).await);
    assert_eq!(offsets(&seen), vec![8, 9]);
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_stored_with_large_negative_bias_lands_on_low_watermark() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);
    broker.set_committed("orders", 0, 6);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription = subscribe_from(
        &manager,
        OffsetPolicy::new(OffsetKind::Stored, -100),
        seen.clone(),
    )
    .await;

    assert!(wait_for(WAIT, || len(&seen) == 10).await);
    assert_eq!(offsets(&seen)[0], 0);
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_stored_bias_is_clamped_to_retained_range() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);
    broker.truncate("orders", 0, 2);
    broker.set_committed("orders", 0, 6);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription = subscribe_from(
        &manager,
        OffsetPolicy::new(OffsetKind::Stored, -100),
        seen.clone(),
    )
    .await;

    assert!(wait_for(WAIT, || len(&seen) == 8).await);
    assert_eq!(offsets(&seen), (2..10).collect::<Vec<i64>>());
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_stored_uses_committed_position() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);
    broker.set_committed("orders", 0, 6);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription =
        subscribe_from(&manager, OffsetPolicy::new(OffsetKind::Stored, 0), seen.clone()).await;

    assert!(wait_for(WAIT, || len(&seen) == 4).await);
    assert_eq!(offsets(&seen), vec![6, 7, 8, 9]);
    assert_eq!(subscription.committed_offsets(), vec![(0, Some(6))]);
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_stored_or_end_without_commit_starts_at_high_watermark() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription = subscribe_from(
        &manager,
        OffsetPolicy::new(OffsetKind::StoredOrEnd, 0),
        seen.clone(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(len(&seen), 0);

    broker.produce("orders", 0, None, "late");
    assert!(wait_for(WAIT, || len(&seen) == 1).await);
    assert_eq!(offsets(&seen), vec![10]);
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_as_of_date_starts_at_first_later_timestamp() {
    let (broker, manager) = setup("orders", 1);
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    for i in 0..10i64 {
        broker.produce_at(
            "orders",
            0,
            None,
            &format!("msg-{i}"),
            base.timestamp_millis() + i * 60_000,
        );
    }

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    // between the records at minute 4 and minute 5
    let as_of = base + chrono::Duration::seconds(4 * 60 + 30);
    let subscription = subscribe_from(&manager, OffsetPolicy::as_of(as_of), seen.clone()).await;

    assert!(wait_for(WAIT, || len(&seen) == 5).await);
    assert_eq!(offsets(&seen), (5..10).collect::<Vec<i64>>());
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_as_of_in_the_future_waits_for_new_records() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let as_of = Utc::now() + chrono::Duration::days(1);
    let subscription = subscribe_from(&manager, OffsetPolicy::as_of(as_of), seen.clone()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(len(&seen), 0);

    broker.produce("orders", 0, None, "late");
    assert!(wait_for(WAIT, || len(&seen) == 1).await);
    assert_eq!(offsets(&seen), vec![10]);
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_failed_offset_query_keeps_default_start() {
    let (broker, manager) = setup("orders", 1);
    produce_ten(&broker);
    broker.set_committed("orders", 0, 4);
    broker.fail_offset_queries(true);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription =
        subscribe_from(&manager, OffsetPolicy::new(OffsetKind::End, 0), seen.clone()).await;

    assert!(wait_for(WAIT, || len(&seen) == 6).await);
    assert_eq!(offsets(&seen), (4..10).collect::<Vec<i64>>());
    assert!(subscription.unsubscribe(WAIT).await);
}

#[tokio::test]
async fn test_each_partition_resolves_independently() {
    let (broker, manager) = setup("orders", 2);
    produce_n(&broker, "orders", 2, 20);
    broker.set_committed("orders", 0, 7);

    let seen: Seen = Arc::new(Mutex::new(vec![]));
    let subscription =
        subscribe_from(&manager, OffsetPolicy::new(OffsetKind::Stored, 1), seen.clone()).await;

    // partition 0 starts at 7 + 1, partition 1 has no commit: low + 1
    assert!(wait_for(WAIT, || len(&seen) == 2 + 9).await);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.iter().filter(|(p, _)| *p == 0).count(), 2);
    assert_eq!(seen.iter().filter(|(p, _)| *p == 1).count(), 9);
    assert!(seen.contains(&(0, 8)) && seen.contains(&(1, 1)));
    assert!(!seen.contains(&(1, 0)));
    assert!(subscription.unsubscribe(WAIT).await);
}
