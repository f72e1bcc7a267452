// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::delegate::Delegates;
use crate::errors::EnqueueError;
use crate::events::{ChannelEvent, DiscardReason, EventSink, SuspendReason};
use crate::ingestion::{Ack, Ingestion, SharedEndpoint, TransportError};
use crate::log::{LogEntry, LogId};
use crate::retry::RetryDecision;
use crate::store::{Batch, BatchId, DiscardSink, LogStore};
use crate::unit::{
    ChannelUnitConfiguration, ChannelUnitHandle, EnqueueResponse, UnitCommand, UnitSnapshot,
    UnitStatus,
};

struct InFlight {
    log_ids: Vec<LogId>,
    attempt: u32,
}

/// Collaborators shared by every unit of a group.
#[derive(Clone)]
pub(crate) struct UnitContext {
    pub(crate) store: LogStore,
    pub(crate) endpoint: SharedEndpoint,
    pub(crate) delegates: Delegates,
    pub(crate) events: EventSink,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct ChannelUnitService {
    config: ChannelUnitConfiguration,
    store: LogStore,
    ingestion: Arc<dyn Ingestion>,
    endpoint: SharedEndpoint,
    delegates: Delegates,
    events: EventSink,
    tx: mpsc::UnboundedSender<UnitCommand>,
    rx: mpsc::UnboundedReceiver<UnitCommand>,
    enabled: bool,
    paused: bool,
    suspended: Option<SuspendReason>,
    /// Bumped whenever outstanding sends and timers must be ignored.
    epoch: u64,
    in_flight: HashMap<BatchId, InFlight>,
    batch_timer_armed: bool,
    retry_timer_armed: bool,
    retry_not_before: Option<Instant>,
    shutdown: CancellationToken,
    in_flight_cancel: CancellationToken,
}

impl ChannelUnitService {
    pub(crate) fn new(
        config: ChannelUnitConfiguration,
        ingestion: Arc<dyn Ingestion>,
        context: UnitContext,
    ) -> (Self, ChannelUnitHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let sink_events = context.events.clone();
        let sink: DiscardSink = Arc::new(move |discarded| {
            debug!(
                "CHANNEL | Discarded {} logs of group {} ({:?})",
                discarded.log_ids.len(),
                discarded.group,
                discarded.reason
            );
            sink_events.emit(ChannelEvent::LogsDiscarded {
                group: discarded.group,
                log_ids: discarded.log_ids,
                reason: discarded.reason,
            });
        });
        context.store.register_group(config.registration(), Some(sink));

        let in_flight_cancel = context.shutdown.child_token();
        let handle = ChannelUnitHandle::new(config.group.clone(), tx.clone());
        let service = Self {
            config,
            store: context.store,
            ingestion,
            endpoint: context.endpoint,
            delegates: context.delegates,
            events: context.events,
            tx,
            rx,
            enabled: true,
            paused: false,
            suspended: None,
            epoch: 0,
            in_flight: HashMap::new(),
            batch_timer_armed: false,
            retry_timer_armed: false,
            retry_not_before: None,
            shutdown: context.shutdown,
            in_flight_cancel,
        };
        (service, handle)
    }

    pub(crate) async fn run(mut self) {
        debug!(
            "CHANNEL | Channel unit {} started with {} stored logs",
            self.config.group,
            self.pending()
        );
        // Logs left over from a previous run are sent like fresh ones.
        self.check_pending_logs();

        loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                () = self.shutdown.cancelled() => None,
            };
            let Some(command) = command else {
                self.stop(false);
                break;
            };
            match command {
                UnitCommand::Enqueue {
                    payload,
                    response_tx,
                } => {
                    let response = self.enqueue(payload);
                    if response_tx.send(response).is_err() {
                        debug!(
                            "CHANNEL | Enqueue caller of group {} went away before the response",
                            self.config.group
                        );
                    }
                }
                UnitCommand::SetEnabled(enabled) => self.set_enabled(enabled),
                UnitCommand::Pause => self.pause(),
                UnitCommand::Resume => self.resume(),
                UnitCommand::Flush => self.send_batches(true),
                UnitCommand::EndpointChanged => self.endpoint_changed(),
                UnitCommand::Snapshot(response_tx) => {
                    if response_tx.send(self.snapshot()).is_err() {
                        error!("CHANNEL | Failed to send snapshot response - receiver dropped");
                    }
                }
                UnitCommand::SendCompleted {
                    epoch,
                    batch_id,
                    result,
                } => self.send_completed(epoch, batch_id, result),
                UnitCommand::BatchTimerFired { epoch } => {
                    if epoch == self.epoch {
                        self.batch_timer_armed = false;
                        self.send_batches(true);
                    }
                }
                UnitCommand::RetryTimerFired { epoch } => {
                    if epoch == self.epoch {
                        self.retry_timer_armed = false;
                        self.send_batches(true);
                    }
                }
                UnitCommand::Shutdown { purge, done } => {
                    self.stop(purge);
                    let _ = done.send(());
                    break;
                }
            }
        }

        debug!("CHANNEL | Channel unit {} stopped", self.config.group);
    }

    fn status(&self) -> UnitStatus {
        if !self.enabled {
            UnitStatus::Disabled
        } else if let Some(reason) = self.suspended {
            UnitStatus::Suspended(reason)
        } else if self.paused {
            UnitStatus::Paused
        } else if self.in_flight.is_empty() {
            UnitStatus::Ready
        } else {
            UnitStatus::Sending
        }
    }

    fn snapshot(&self) -> UnitSnapshot {
        UnitSnapshot {
            group: self.config.group.clone(),
            status: self.status(),
            pending: self.pending(),
            in_flight: self.in_flight.len(),
        }
    }

    fn can_send(&self) -> bool {
        self.enabled && !self.paused && self.suspended.is_none()
    }

    /// Stored logs of the group that are not part of an in-flight batch.
    fn pending(&self) -> usize {
        let in_flight: usize = self.in_flight.values().map(|batch| batch.log_ids.len()).sum();
        self.store
            .count(&self.config.group)
            .saturating_sub(in_flight)
    }

    fn enqueue(&mut self, payload: serde_json::Value) -> EnqueueResponse {
        if !self.enabled {
            return Err(EnqueueError::UnitDisabled);
        }
        if self.suspended.is_some() {
            return Err(EnqueueError::UnitSuspended);
        }

        let entry = LogEntry::new(self.config.group.clone(), payload);
        if self.delegates.should_filter(&entry) {
            debug!(
                "CHANNEL | Log {} of group {} filtered by a delegate",
                entry.id, self.config.group
            );
            self.events.emit(ChannelEvent::LogFiltered {
                group: self.config.group.clone(),
            });
            return Ok(None);
        }

        let log_id = self.store.append(&self.config.group, &entry)?;
        self.events.emit(ChannelEvent::LogEnqueued {
            group: self.config.group.clone(),
            log_id,
        });
        self.check_pending_logs();
        Ok(Some(log_id))
    }

    /// Sends full batches right away and leaves a partial one to the batch
    /// timer.
    fn check_pending_logs(&mut self) {
        if !self.can_send() {
            return;
        }
        let pending = self.pending();
        if pending >= self.config.batch_size() {
            self.send_batches(false);
        } else if pending > 0 {
            self.arm_batch_timer();
        }
    }

    /// Cuts and dispatches batches up to the parallelism cap. Without `drain`
    /// only full batches are sent.
    fn send_batches(&mut self, drain: bool) {
        if !self.can_send() {
            return;
        }
        if let Some(not_before) = self.retry_not_before {
            let now = Instant::now();
            if now < not_before {
                self.arm_retry_timer(not_before - now);
                return;
            }
            self.retry_not_before = None;
        }

        let batch_size = self.config.batch_size();
        while self.in_flight.len() < self.config.max_parallel_batches() {
            let pending = self.pending();
            if pending == 0 || (!drain && pending < batch_size) {
                break;
            }
            match self.store.next_batch(&self.config.group, batch_size) {
                Ok(Some(batch)) => self.dispatch(batch),
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "CHANNEL | Failed to read a batch for group {}: {}",
                        self.config.group, e
                    );
                    break;
                }
            }
        }

        if !drain && self.pending() > 0 && self.pending() < batch_size {
            self.arm_batch_timer();
        }
    }

    fn dispatch(&mut self, batch: Batch) {
        let log_ids = batch.log_ids();
        debug!(
            "CHANNEL | Sending batch {} of group {} with {} logs (attempt {})",
            batch.id,
            batch.group,
            log_ids.len(),
            batch.attempt + 1
        );
        self.events.emit(ChannelEvent::BatchSending {
            group: self.config.group.clone(),
            batch_id: batch.id,
            log_ids: log_ids.clone(),
        });
        self.in_flight.insert(
            batch.id,
            InFlight {
                log_ids,
                attempt: batch.attempt,
            },
        );

        let endpoint = self.endpoint.snapshot();
        let ingestion = Arc::clone(&self.ingestion);
        let cancel = self.in_flight_cancel.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let timeout = ingestion.timeout();
            let send = ingestion.send(&batch, &endpoint.credentials, &endpoint.url);
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, send) => {
                    result.unwrap_or(Err(TransportError::Timeout))
                }
            };
            // The unit may already be gone, in which case nobody cares.
            let _ = tx.send(UnitCommand::SendCompleted {
                epoch,
                batch_id: batch.id,
                result,
            });
        });
    }

    fn send_completed(&mut self, epoch: u64, batch_id: BatchId, result: Result<Ack, TransportError>) {
        if epoch != self.epoch {
            debug!(
                "CHANNEL | Ignoring completion of batch {} from a previous epoch",
                batch_id
            );
            return;
        }
        let Some(batch) = self.in_flight.remove(&batch_id) else {
            return;
        };

        match result {
            Ok(ack) => {
                debug!(
                    "CHANNEL | Batch {} of group {} acknowledged with status {}",
                    batch_id, self.config.group, ack.status
                );
                self.remove_batch(batch_id);
                self.events.emit(ChannelEvent::BatchSent {
                    group: self.config.group.clone(),
                    batch_id,
                    log_ids: batch.log_ids,
                });
                self.check_pending_logs();
            }
            Err(e) if e.is_retryable() => {
                let failures = batch.attempt.saturating_add(1);
                match self.config.retry.decide(failures) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            "CHANNEL | Batch {} of group {} failed ({}), retrying in {:?}",
                            batch_id, self.config.group, e, delay
                        );
                        self.store.release(batch_id);
                        self.events.emit(ChannelEvent::BatchFailed {
                            group: self.config.group.clone(),
                            batch_id,
                            attempt: failures,
                            retry_in: delay,
                        });
                        self.back_off(delay);
                    }
                    RetryDecision::Abandon => {
                        error!(
                            "CHANNEL | Batch {} of group {} failed {} times ({}), giving up",
                            batch_id, self.config.group, failures, e
                        );
                        self.remove_batch(batch_id);
                        self.events.emit(ChannelEvent::LogsDiscarded {
                            group: self.config.group.clone(),
                            log_ids: batch.log_ids,
                            reason: DiscardReason::Abandoned,
                        });
                        self.suspend(SuspendReason::RetriesExhausted);
                    }
                }
            }
            Err(e) => {
                error!(
                    "CHANNEL | Batch {} of group {} rejected ({}), dropping {} logs",
                    batch_id,
                    self.config.group,
                    e,
                    batch.log_ids.len()
                );
                self.remove_batch(batch_id);
                self.events.emit(ChannelEvent::LogsDiscarded {
                    group: self.config.group.clone(),
                    log_ids: batch.log_ids,
                    reason: DiscardReason::Rejected,
                });
                if e.invalidates_unit() {
                    self.suspend(SuspendReason::InvalidCredentials);
                } else {
                    self.check_pending_logs();
                }
            }
        }
    }

    fn remove_batch(&self, batch_id: BatchId) {
        if let Err(e) = self.store.remove(batch_id) {
            error!(
                "CHANNEL | Failed to remove batch {} of group {}: {}",
                batch_id, self.config.group, e
            );
        }
    }

    fn back_off(&mut self, delay: Duration) {
        let not_before = Instant::now() + delay;
        self.retry_not_before = Some(
            self.retry_not_before
                .map_or(not_before, |current| current.max(not_before)),
        );
        self.arm_retry_timer(delay);
    }

    fn arm_batch_timer(&mut self) {
        if self.batch_timer_armed {
            return;
        }
        self.batch_timer_armed = true;
        let command = UnitCommand::BatchTimerFired { epoch: self.epoch };
        self.schedule(self.config.batch_interval, command);
    }

    fn arm_retry_timer(&mut self, delay: Duration) {
        if self.retry_timer_armed {
            return;
        }
        self.retry_timer_armed = true;
        let command = UnitCommand::RetryTimerFired { epoch: self.epoch };
        self.schedule(delay, command);
    }

    fn schedule(&self, delay: Duration, command: UnitCommand) {
        let tx = self.tx.clone();
        let cancel = self.in_flight_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(command);
                }
            }
        });
    }

    fn suspend(&mut self, reason: SuspendReason) {
        if self.suspended.is_some() {
            return;
        }
        warn!(
            "CHANNEL | Channel unit {} suspended: {:?}",
            self.config.group, reason
        );
        self.suspended = Some(reason);
        self.events.emit(ChannelEvent::UnitSuspended {
            group: self.config.group.clone(),
            reason,
        });
    }

    fn lift_suspension(&mut self) {
        if self.suspended.take().is_none() {
            return;
        }
        debug!(
            "CHANNEL | Channel unit {} resumed from suspension",
            self.config.group
        );
        self.retry_not_before = None;
        self.events.emit(ChannelEvent::UnitResumedFromSuspension {
            group: self.config.group.clone(),
        });
    }

    /// Drops outstanding sends and timers. Their completions, if any still
    /// arrive, carry a stale epoch.
    fn cancel_in_flight(&mut self) -> Vec<BatchId> {
        self.epoch = self.epoch.wrapping_add(1);
        self.in_flight_cancel.cancel();
        self.in_flight_cancel = self.shutdown.child_token();
        self.batch_timer_armed = false;
        self.retry_timer_armed = false;
        self.retry_not_before = None;
        self.in_flight.drain().map(|(batch_id, _)| batch_id).collect()
    }

    fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            if !self.enabled {
                debug!("CHANNEL | Channel unit {} enabled", self.config.group);
                self.enabled = true;
            }
            self.lift_suspension();
            self.check_pending_logs();
            return;
        }
        if !self.enabled {
            return;
        }

        debug!("CHANNEL | Channel unit {} disabled", self.config.group);
        self.enabled = false;
        self.suspended = None;
        self.cancel_in_flight();
        match self.store.delete_group(&self.config.group) {
            Ok(log_ids) if !log_ids.is_empty() => {
                self.events.emit(ChannelEvent::LogsDiscarded {
                    group: self.config.group.clone(),
                    log_ids,
                    reason: DiscardReason::Disabled,
                });
            }
            Ok(_) => {}
            Err(e) => error!(
                "CHANNEL | Failed to delete logs of disabled group {}: {}",
                self.config.group, e
            ),
        }
    }

    fn pause(&mut self) {
        if !self.paused {
            debug!("CHANNEL | Channel unit {} paused", self.config.group);
            self.paused = true;
        }
    }

    fn resume(&mut self) {
        if self.paused {
            debug!("CHANNEL | Channel unit {} resumed", self.config.group);
            self.paused = false;
        }
        self.check_pending_logs();
    }

    fn endpoint_changed(&mut self) {
        if self.suspended == Some(SuspendReason::InvalidCredentials) {
            self.lift_suspension();
            self.check_pending_logs();
        }
    }

    fn stop(&mut self, purge: bool) {
        for batch_id in self.cancel_in_flight() {
            self.store.unmark(batch_id);
        }
        if !purge {
            self.store.detach_group(&self.config.group);
            return;
        }
        match self.store.unregister_group(&self.config.group) {
            Ok(log_ids) if !log_ids.is_empty() => {
                self.events.emit(ChannelEvent::LogsDiscarded {
                    group: self.config.group.clone(),
                    log_ids,
                    reason: DiscardReason::Removed,
                });
            }
            Ok(_) => {}
            Err(e) => error!(
                "CHANNEL | Failed to delete logs of removed group {}: {}",
                self.config.group, e
            ),
        }
    }
}
