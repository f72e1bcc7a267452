// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostic event bus for the channel subsystem.
//!
//! Channel units never report send failures to producers. Instead they
//! publish [`ChannelEvent`]s here so monitoring collaborators can observe
//! discarded logs, retries, and suspensions.
//!
//! ```text
//! ChannelUnit (many)        EventSink            EventBus (one)
//!     ├─ BatchSent ─────────>│                      │
//!     ├─ LogsDiscarded ─────>│ ──> bounded MPSC ──> rx
//!     └─ UnitSuspended ─────>│                      │
//! ```
//!
//! Publishing is best-effort: when the bus is full the event is dropped with
//! a debug log so that a slow consumer can never stall a unit.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::constants::MAX_EVENTS;
use crate::log::LogId;
use crate::store::BatchId;

/// Why logs left the store without being acknowledged by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Evicted to make room under the storage quota.
    Evicted,
    /// The backend rejected the batch with a terminal error.
    Rejected,
    /// The retry budget was exhausted.
    Abandoned,
    /// The unit was disabled.
    Disabled,
    /// The stored bytes could not be decoded.
    Corrupt,
    /// The unit was removed from its group.
    Removed,
}

/// Why a unit stopped accepting and sending logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// The backend rejected the credentials or the endpoint.
    InvalidCredentials,
    /// A batch failed more times than the retry policy allows.
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    LogEnqueued {
        group: String,
        log_id: LogId,
    },
    /// A delegate filtered the log out before it reached the store.
    LogFiltered {
        group: String,
    },
    BatchSending {
        group: String,
        batch_id: BatchId,
        log_ids: Vec<LogId>,
    },
    BatchSent {
        group: String,
        batch_id: BatchId,
        log_ids: Vec<LogId>,
    },
    BatchFailed {
        group: String,
        batch_id: BatchId,
        attempt: u32,
        retry_in: Duration,
    },
    LogsDiscarded {
        group: String,
        log_ids: Vec<LogId>,
        reason: DiscardReason,
    },
    UnitSuspended {
        group: String,
        reason: SuspendReason,
    },
    UnitResumedFromSuspension {
        group: String,
    },
}

/// Cloneable publishing side of the event bus.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ChannelEvent>>,
}

impl EventSink {
    /// A sink that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ChannelEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("CHANNEL | Event bus full, dropping event: {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Receiving side of the event bus.
#[derive(Debug)]
pub struct EventBus {
    pub rx: mpsc::Receiver<ChannelEvent>,
}

impl EventBus {
    #[must_use]
    pub fn run() -> (EventBus, EventSink) {
        Self::with_capacity(MAX_EVENTS)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> (EventBus, EventSink) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventBus { rx }, EventSink { tx: Some(tx) })
    }
}
