// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel units: one actor per log group.
//!
//! Each unit runs as a [`service::ChannelUnitService`] task that owns the
//! unit's state and serializes every transition (enqueue, batch selection,
//! send completion, timers). A cloneable [`ChannelUnitHandle`] sends it
//! commands. Transport calls run on separate tasks and post their result back
//! to the actor, tagged with the epoch they started in so that completions
//! from before a disable are ignored.

pub mod config;
pub(crate) mod service;

pub use config::ChannelUnitConfiguration;

use tokio::sync::{mpsc, oneshot};

use crate::errors::EnqueueError;
use crate::events::SuspendReason;
use crate::ingestion::{Ack, TransportError};
use crate::log::LogId;
use crate::store::BatchId;

/// Externally visible state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    /// Enabled with nothing in flight.
    Ready,
    /// Enabled with at least one batch in flight.
    Sending,
    /// Accepting logs without sending them.
    Paused,
    /// Neither accepting nor sending until re-enabled or reconfigured.
    Suspended(SuspendReason),
    Disabled,
}

/// Point-in-time view of a unit for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub group: String,
    pub status: UnitStatus,
    /// Stored logs not part of an in-flight batch.
    pub pending: usize,
    /// Batches currently being sent.
    pub in_flight: usize,
}

pub(crate) type EnqueueResponse = Result<Option<LogId>, EnqueueError>;

#[derive(Debug)]
pub enum UnitCommand {
    Enqueue {
        payload: serde_json::Value,
        response_tx: oneshot::Sender<EnqueueResponse>,
    },
    SetEnabled(bool),
    Pause,
    Resume,
    Flush,
    /// The shared log URL or app secret changed.
    EndpointChanged,
    Snapshot(oneshot::Sender<UnitSnapshot>),
    SendCompleted {
        epoch: u64,
        batch_id: BatchId,
        result: Result<Ack, TransportError>,
    },
    BatchTimerFired {
        epoch: u64,
    },
    RetryTimerFired {
        epoch: u64,
    },
    Shutdown {
        /// Delete the unit's stored logs instead of keeping them for the
        /// next start.
        purge: bool,
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running channel unit.
#[derive(Debug, Clone)]
pub struct ChannelUnitHandle {
    group: String,
    tx: mpsc::UnboundedSender<UnitCommand>,
}

impl ChannelUnitHandle {
    pub(crate) fn new(group: String, tx: mpsc::UnboundedSender<UnitCommand>) -> Self {
        Self { group, tx }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Persists a log for this unit's group.
    ///
    /// Returns the store id of the log, or `None` when a delegate filtered it
    /// out. Transport failures are never reported here.
    pub async fn enqueue(&self, payload: serde_json::Value) -> EnqueueResponse {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(UnitCommand::Enqueue {
                payload,
                response_tx,
            })
            .map_err(|_| EnqueueError::UnitStopped(self.group.clone()))?;
        response_rx
            .await
            .map_err(|_| EnqueueError::UnitStopped(self.group.clone()))?
    }

    /// Same as [`Self::enqueue`] for producers running outside the async
    /// runtime. Must not be called from within an async context.
    pub fn enqueue_blocking(&self, payload: serde_json::Value) -> EnqueueResponse {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(UnitCommand::Enqueue {
                payload,
                response_tx,
            })
            .map_err(|_| EnqueueError::UnitStopped(self.group.clone()))?;
        response_rx
            .blocking_recv()
            .map_err(|_| EnqueueError::UnitStopped(self.group.clone()))?
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), mpsc::error::SendError<UnitCommand>> {
        self.tx.send(UnitCommand::SetEnabled(enabled))
    }

    pub fn pause(&self) -> Result<(), mpsc::error::SendError<UnitCommand>> {
        self.tx.send(UnitCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), mpsc::error::SendError<UnitCommand>> {
        self.tx.send(UnitCommand::Resume)
    }

    /// Sends pending logs now instead of waiting for a full batch or the
    /// batch interval.
    pub fn flush(&self) -> Result<(), mpsc::error::SendError<UnitCommand>> {
        self.tx.send(UnitCommand::Flush)
    }

    pub(crate) fn endpoint_changed(&self) -> Result<(), mpsc::error::SendError<UnitCommand>> {
        self.tx.send(UnitCommand::EndpointChanged)
    }

    /// Returns the unit's state once every previously sent command has been
    /// processed.
    pub async fn snapshot(&self) -> Result<UnitSnapshot, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(UnitCommand::Snapshot(response_tx))
            .map_err(|e| format!("Failed to send snapshot command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive snapshot response: {}", e))
    }

    /// Stops the unit and waits for it to release its in-flight batches.
    pub(crate) async fn shutdown(&self, purge: bool) {
        let (done, done_rx) = oneshot::channel();
        if self.tx.send(UnitCommand::Shutdown { purge, done }).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}
