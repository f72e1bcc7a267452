// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use serde_json::{json, Value};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_channel::{
    ChannelEnv, ChannelEvent, ChannelGroup, ChannelUnitConfiguration, EventBus, LogStore,
};

#[tokio::main]
pub async fn main() {
    let env = match ChannelEnv::from_os_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Invalid telemetry configuration: {e}");
            return;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,{}",
        env.log_level.to_lowercase()
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if env.app_secret.is_none() {
        error!("TELEMETRY_APP_SECRET is not set. Shutting down telemetry channel agent.");
        return;
    }

    let store = match &env.storage_path {
        Some(path) => LogStore::open(path),
        None => LogStore::open_ephemeral(),
    };
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open the log store: {e}");
            return;
        }
    };

    let (bus, events) = EventBus::run();
    let group = ChannelGroup::new(store, env.to_group_config(), events);
    if !group.set_max_storage_size_and_wait(env.max_storage_size).await {
        warn!(
            "Ignoring maximum storage size of {} bytes, keeping {} bytes",
            env.max_storage_size,
            group.store().quota()
        );
    }
    if let Err(e) = group.add_channel_unit(ChannelUnitConfiguration::new(env.group.clone()), None) {
        error!("Failed to create channel unit {}: {e}", env.group);
        return;
    }
    if !env.enabled {
        info!("Telemetry is disabled, stored logs of {} are discarded", env.group);
        group.set_enabled(false);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(report_events(bus, cancel.clone()));

    info!(
        "Forwarding stdin to {} under group {}",
        env.log_url, env.group
    );
    forward_stdin(&group, &env.group, &cancel).await;

    // Give pending logs one send timeout to go out; whatever is left stays
    // in the store.
    if !group.flush_and_wait(env.http_timeout).await {
        warn!("Stopping with unsent logs");
    }
    group.shutdown().await;
    cancel.cancel();
    info!("Telemetry channel agent stopped");
}

/// Enqueues every stdin line until EOF or Ctrl-C.
async fn forward_stdin(group: &ChannelGroup, group_name: &str, cancel: &CancellationToken) {
    let mut lines = BufReader::new(stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            () = cancel.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Reached end of input");
                break;
            }
            Err(e) => {
                error!("Failed to read from stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = group.enqueue(to_payload(&line), group_name).await {
            warn!("Dropped log: {e}");
        }
    }
}

/// Lines that are not JSON are wrapped as `{"message": line}`.
fn to_payload(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| json!({ "message": line }))
}

async fn report_events(mut bus: EventBus, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            event = bus.rx.recv() => event,
            () = cancel.cancelled() => break,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            ChannelEvent::BatchSent { group, log_ids, .. } => {
                debug!("Sent {} logs of group {}", log_ids.len(), group);
            }
            ChannelEvent::LogsDiscarded {
                group,
                log_ids,
                reason,
            } => {
                warn!(
                    "Discarded {} logs of group {}: {:?}",
                    log_ids.len(),
                    group,
                    reason
                );
            }
            ChannelEvent::UnitSuspended { group, reason } => {
                error!("Channel unit {} suspended: {:?}", group, reason);
            }
            ChannelEvent::UnitResumedFromSuspension { group } => {
                info!("Channel unit {} resumed", group);
            }
            other => debug!("Channel event: {:?}", other),
        }
    }
}
