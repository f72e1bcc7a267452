// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::constants::{DEFAULT_BATCH_INTERVAL, DEFAULT_BATCH_SIZE, DEFAULT_MAX_PARALLEL_BATCHES};
use crate::retry::RetryPolicy;
use crate::store::{GroupRegistration, Priority};

/// Buffering and delivery policy of one channel unit.
///
/// A unit never changes its configuration; remove it and add a new one to
/// apply different settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUnitConfiguration {
    /// Name of the log category routed to this unit.
    pub group: String,
    /// Eviction order under storage pressure.
    pub priority: Priority,
    /// `false` keeps logs in memory only; they are lost on restart.
    pub persistent: bool,
    /// Logs per batch, and the pending count that triggers a send.
    pub batch_size: usize,
    /// How long a partial batch waits before it is sent anyway.
    pub batch_interval: Duration,
    pub max_parallel_batches: usize,
    pub retry: RetryPolicy,
}

impl ChannelUnitConfiguration {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            priority: Priority::Default,
            persistent: true,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_parallel_batches: DEFAULT_MAX_PARALLEL_BATCHES,
            retry: RetryPolicy::default(),
        }
    }

    pub(crate) fn registration(&self) -> GroupRegistration {
        GroupRegistration {
            group: self.group.clone(),
            priority: self.priority,
            persistent: self.persistent,
            eviction_batch_size: self.batch_size(),
        }
    }

    /// Batch size with a floor of one log.
    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub(crate) fn max_parallel_batches(&self) -> usize {
        self.max_parallel_batches.max(1)
    }
}
