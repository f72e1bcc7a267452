// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coordination tests for a channel group and its units.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::helpers::{drain_events, fast_unit, mock_group, wait_for_unit, wait_until, APP_SECRET};
use common::mocks::MockIngestion;
use serde_json::json;
use telemetry_channel::{
    ChannelEvent, ChannelUnitConfiguration, DiscardReason, EnqueueError, EventBus, EventSink,
    Ingestion, LogStore, Priority, SuspendReason, TransportError, UnitStatus,
};
use tempfile::TempDir;

#[tokio::test]
async fn credential_changes_apply_to_default_units_only() {
    let default_ingestion = MockIngestion::ok();
    let explicit_ingestion = MockIngestion::ok();
    let group = mock_group(
        LogStore::open_ephemeral().unwrap(),
        default_ingestion.clone(),
        EventSink::disabled(),
    );
    let analytics = group.add_channel_unit(fast_unit("analytics", 1), None).unwrap();
    let crashes = group
        .add_channel_unit(
            fast_unit("crashes", 1),
            Some(explicit_ingestion.clone() as Arc<dyn Ingestion>),
        )
        .unwrap();

    group.set_app_secret("rotated-secret");
    group.set_log_url("https://in.example.com").unwrap();
    // Both units have processed the change notification after a snapshot.
    analytics.snapshot().await.unwrap();
    crashes.snapshot().await.unwrap();

    group.enqueue(json!("a"), "analytics").await.unwrap();
    group.enqueue(json!("c"), "crashes").await.unwrap();
    wait_until("both logs are sent", || {
        default_ingestion.send_count() == 1 && explicit_ingestion.send_count() == 1
    })
    .await;

    let default_sent = &default_ingestion.sent()[0];
    assert_eq!(default_sent.app_secret, "rotated-secret");
    assert_eq!(default_sent.url, "https://in.example.com");

    let explicit_sent = &explicit_ingestion.sent()[0];
    assert_eq!(explicit_sent.app_secret, APP_SECRET);
    assert_eq!(explicit_sent.url, "https://in.appcenter.ms");
}

#[tokio::test]
async fn new_credentials_lift_an_invalid_credentials_suspension() {
    let ingestion = MockIngestion::scripted(vec![Err(TransportError::Unauthorized(401))]);
    let (mut bus, events) = EventBus::run();
    let store = LogStore::open_ephemeral().unwrap();
    let group = mock_group(store.clone(), ingestion.clone(), events);
    let unit = group.add_channel_unit(fast_unit("analytics", 1), None).unwrap();

    group.enqueue(json!("first"), "analytics").await.unwrap();
    wait_for_unit(&unit, |s| {
        s.status == UnitStatus::Suspended(SuspendReason::InvalidCredentials)
    })
    .await;

    // Setting the same secret again is not a change.
    group.set_app_secret(APP_SECRET);
    assert!(matches!(unit.snapshot().await.unwrap().status, UnitStatus::Suspended(_)));

    group.set_app_secret("fixed-secret");
    assert_eq!(unit.snapshot().await.unwrap().status, UnitStatus::Ready);

    group.enqueue(json!("second"), "analytics").await.unwrap();
    wait_until("the log is sent", || ingestion.send_count() == 2).await;
    assert_eq!(ingestion.sent()[1].app_secret, "fixed-secret");

    let events = drain_events(&mut bus);
    assert!(events.contains(&ChannelEvent::UnitSuspended {
        group: "analytics".to_string(),
        reason: SuspendReason::InvalidCredentials,
    }));
    assert!(events.contains(&ChannelEvent::UnitResumedFromSuspension {
        group: "analytics".to_string(),
    }));
}

#[tokio::test]
async fn quota_pressure_evicts_the_lowest_priority_group_first() {
    let ingestion = MockIngestion::ok();
    let (mut bus, events) = EventBus::run();
    let store = LogStore::open_ephemeral().unwrap();
    let group = mock_group(store.clone(), ingestion, events);
    assert!(group.set_max_storage_size_and_wait(20_480).await);

    let paused = |name: &str, priority: Priority| ChannelUnitConfiguration {
        priority,
        batch_interval: Duration::from_secs(3600),
        ..fast_unit(name, 1)
    };
    group.add_channel_unit(paused("backup", Priority::Backup), None).unwrap();
    group.add_channel_unit(paused("crashes", Priority::High), None).unwrap();
    group.pause();

    let big = || json!("x".repeat(6000));
    let backup = group.unit("backup").unwrap();
    let crashes = group.unit("crashes").unwrap();
    let oldest_backup = backup.enqueue(big()).await.unwrap().unwrap();
    backup.enqueue(big()).await.unwrap();
    crashes.enqueue(big()).await.unwrap();
    // Does not fit anymore: the oldest backup log makes room.
    crashes.enqueue(big()).await.unwrap();

    assert_eq!(store.count("backup"), 1);
    assert_eq!(store.count("crashes"), 2);
    assert!(store.usage() <= store.quota());

    let discarded: Vec<ChannelEvent> = drain_events(&mut bus)
        .into_iter()
        .filter(|event| matches!(event, ChannelEvent::LogsDiscarded { .. }))
        .collect();
    assert_eq!(
        discarded,
        vec![ChannelEvent::LogsDiscarded {
            group: "backup".to_string(),
            log_ids: vec![oldest_backup],
            reason: DiscardReason::Evicted,
        }]
    );
}

#[tokio::test]
async fn storage_full_is_reported_to_the_producer() {
    let group = mock_group(
        LogStore::open_ephemeral().unwrap(),
        MockIngestion::ok(),
        EventSink::disabled(),
    );
    assert!(group.set_max_storage_size_and_wait(20_480).await);
    group
        .add_channel_unit(
            ChannelUnitConfiguration {
                batch_interval: Duration::from_secs(3600),
                ..fast_unit("analytics", 10)
            },
            None,
        )
        .unwrap();

    assert!(matches!(
        group.enqueue(json!("x".repeat(30_000)), "analytics").await,
        Err(EnqueueError::StorageFull)
    ));
}

#[tokio::test]
async fn removing_a_unit_deletes_its_logs() {
    let (mut bus, events) = EventBus::run();
    let store = LogStore::open_ephemeral().unwrap();
    let group = mock_group(store.clone(), MockIngestion::ok(), events);
    let config = ChannelUnitConfiguration {
        batch_interval: Duration::from_secs(3600),
        ..fast_unit("analytics", 10)
    };
    group.add_channel_unit(config.clone(), None).unwrap();
    group.enqueue(json!(1), "analytics").await.unwrap();
    group.enqueue(json!(2), "analytics").await.unwrap();

    group.remove_channel_unit("analytics").await.unwrap();

    assert_eq!(store.count("analytics"), 0);
    assert!(group.groups().is_empty());
    assert!(matches!(
        group.enqueue(json!(3), "analytics").await,
        Err(EnqueueError::UnknownGroup(_))
    ));
    assert!(drain_events(&mut bus).iter().any(|event| matches!(
        event,
        ChannelEvent::LogsDiscarded { reason: DiscardReason::Removed, log_ids, .. } if log_ids.len() == 2
    )));

    // The name is free again.
    group.add_channel_unit(config, None).unwrap();
}

#[tokio::test]
async fn disabling_clears_logs_and_reenabling_starts_empty() {
    let ingestion = MockIngestion::ok();
    let store = LogStore::open_ephemeral().unwrap();
    let group = mock_group(store.clone(), ingestion.clone(), EventSink::disabled());
    let unit = group
        .add_channel_unit(
            ChannelUnitConfiguration {
                batch_interval: Duration::from_secs(3600),
                ..fast_unit("analytics", 10)
            },
            None,
        )
        .unwrap();
    group.enqueue(json!("stale"), "analytics").await.unwrap();

    group.set_enabled(false);
    assert_eq!(unit.snapshot().await.unwrap().status, UnitStatus::Disabled);
    assert_eq!(store.count("analytics"), 0);

    group.set_enabled(true);
    let snapshot = unit.snapshot().await.unwrap();
    assert_eq!(snapshot.status, UnitStatus::Ready);
    assert_eq!(snapshot.pending, 0);

    group.enqueue(json!("fresh"), "analytics").await.unwrap();
    group.flush();
    wait_until("the fresh log is sent", || ingestion.send_count() == 1).await;
    assert_eq!(ingestion.sent()[0].payloads, vec![json!("fresh")]);
}

#[tokio::test]
async fn shutdown_keeps_stored_logs_for_the_next_start() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("channel.db");
    {
        let store = LogStore::open(&path).unwrap();
        let group = mock_group(store, MockIngestion::ok(), EventSink::disabled());
        group.add_channel_unit(fast_unit("analytics", 10), None).unwrap();
        group.pause();
        for n in 0..3 {
            group.enqueue(json!(n), "analytics").await.unwrap();
        }
        group.shutdown().await;
        assert!(group.groups().is_empty());
    }

    let store = LogStore::open(&path).unwrap();
    assert_eq!(store.count("analytics"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_deliver_every_log_exactly_once() {
    let ingestion = MockIngestion::ok();
    let store = LogStore::open_ephemeral().unwrap();
    let group = Arc::new(mock_group(store.clone(), ingestion.clone(), EventSink::disabled()));
    group.add_channel_unit(fast_unit("analytics", 5), None).unwrap();
    group.add_channel_unit(fast_unit("crashes", 5), None).unwrap();

    let mut producers = Vec::new();
    for producer in 0..4 {
        let group = Arc::clone(&group);
        producers.push(tokio::spawn(async move {
            let target = if producer % 2 == 0 { "analytics" } else { "crashes" };
            for n in 0..25 {
                group
                    .enqueue(json!({ "producer": producer, "n": n }), target)
                    .await
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    wait_until("every log is sent", || {
        store.count("analytics") == 0 && store.count("crashes") == 0
    })
    .await;
    let mut sent = ingestion.sent_log_ids();
    assert_eq!(sent.len(), 100);
    sent.sort_unstable();
    sent.dedup();
    assert_eq!(sent.len(), 100);
}

#[tokio::test]
async fn quota_changes_report_completion_once() {
    let group = mock_group(
        LogStore::open_ephemeral().unwrap(),
        MockIngestion::ok(),
        EventSink::disabled(),
    );

    let (tx, rx) = tokio::sync::oneshot::channel();
    group.set_max_storage_size(20_479, move |accepted| {
        let _ = tx.send(accepted);
    });
    assert!(!rx.await.unwrap());
    assert_eq!(group.store().quota(), 10 * 1024 * 1024);

    assert!(group.set_max_storage_size_and_wait(20_480).await);
    assert_eq!(group.store().quota(), 20_480);
}

#[tokio::test]
async fn flush_and_wait_delivers_partial_batches_before_shutdown() {
    let ingestion = MockIngestion::slow(Duration::from_millis(30), Duration::from_secs(5));
    let store = LogStore::open_ephemeral().unwrap();
    let group = mock_group(store.clone(), ingestion.clone(), EventSink::disabled());
    group
        .add_channel_unit(
            ChannelUnitConfiguration {
                batch_interval: Duration::from_secs(3600),
                ..fast_unit("analytics", 50)
            },
            None,
        )
        .unwrap();
    let mut expected = Vec::new();
    for n in 0..3 {
        let id = group.unit("analytics").unwrap().enqueue(json!(n)).await.unwrap();
        expected.push(id.unwrap());
    }

    assert!(group.flush_and_wait(Duration::from_secs(5)).await);
    group.shutdown().await;

    assert_eq!(ingestion.sent_log_ids(), expected);
    assert_eq!(store.count("analytics"), 0);
}

#[tokio::test]
async fn flush_and_wait_skips_paused_units_and_honours_the_deadline() {
    let ingestion = MockIngestion::slow(Duration::from_millis(500), Duration::from_secs(5));
    let group = mock_group(
        LogStore::open_ephemeral().unwrap(),
        ingestion.clone(),
        EventSink::disabled(),
    );
    let config = |name: &str| ChannelUnitConfiguration {
        batch_interval: Duration::from_secs(3600),
        ..fast_unit(name, 50)
    };
    let paused = group.add_channel_unit(config("backup"), None).unwrap();
    paused.pause().unwrap();
    paused.enqueue(json!("held")).await.unwrap();

    assert!(group.flush_and_wait(Duration::from_secs(1)).await);
    assert_eq!(ingestion.send_count(), 0);

    group.add_channel_unit(config("analytics"), None).unwrap();
    group.enqueue(json!("slow"), "analytics").await.unwrap();

    assert!(!group.flush_and_wait(Duration::from_millis(50)).await);
    assert_eq!(ingestion.send_count(), 1);
}
