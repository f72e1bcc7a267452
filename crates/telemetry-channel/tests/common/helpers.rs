// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use telemetry_channel::{
    ChannelEvent, ChannelGroup, ChannelGroupConfig, ChannelUnitConfiguration, ChannelUnitHandle,
    EventBus, EventSink, Ingestion, LogStore, RetryPolicy, UnitSnapshot,
};
use tokio::time::sleep;
use uuid::Uuid;

pub const APP_SECRET: &str = "test-app-secret";

pub fn group_config() -> ChannelGroupConfig {
    ChannelGroupConfig {
        app_secret: APP_SECRET.to_string(),
        install_id: Some(Uuid::nil()),
        ..ChannelGroupConfig::default()
    }
}

/// Group using `ingestion` as its default transport.
pub fn mock_group(store: LogStore, ingestion: Arc<dyn Ingestion>, events: EventSink) -> ChannelGroup {
    ChannelGroup::with_default_ingestion(store, group_config(), events, ingestion)
}

/// Unit configuration with millisecond timers so tests stay fast.
pub fn fast_unit(group: &str, batch_size: usize) -> ChannelUnitConfiguration {
    ChannelUnitConfiguration {
        batch_size,
        batch_interval: Duration::from_millis(100),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: 3,
            jitter: 0.0,
            ..RetryPolicy::default()
        },
        ..ChannelUnitConfiguration::new(group)
    }
}

/// Polls the unit until `check` holds, failing the test after five seconds.
pub async fn wait_for_unit(
    handle: &ChannelUnitHandle,
    check: impl Fn(&UnitSnapshot) -> bool,
) -> UnitSnapshot {
    for _ in 0..500 {
        let snapshot = handle.snapshot().await.expect("unit is running");
        if check(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let snapshot = handle.snapshot().await.expect("unit is running");
    panic!("timed out waiting for unit, last snapshot: {snapshot:?}");
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {what}");
}

/// Everything published on the bus so far.
pub fn drain_events(bus: &mut EventBus) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Ok(event) = bus.rx.try_recv() {
        events.push(event);
    }
    events
}
