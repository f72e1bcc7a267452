// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel subsystem of the on-device telemetry pipeline.
//!
//! Producers hand structured log events to a [`group::ChannelGroup`], which
//! routes them to the [`unit::ChannelUnitHandle`] registered for their group
//! name. Each unit persists logs in the shared [`store::LogStore`], cuts them
//! into batches, and ships the batches through an [`ingestion::Ingestion`]
//! transport, retrying or suspending itself when the backend misbehaves.
//!
//! ```text
//!   producers ──enqueue──> ChannelGroup ──route──> ChannelUnit (actor)
//!                                                   │        │
//!                                        append/next_batch   send
//!                                                   v        v
//!                                               LogStore  Ingestion
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod delegate;
pub mod errors;
pub mod events;
pub mod group;
pub mod ingestion;
pub mod log;
pub mod retry;
pub mod store;
pub mod unit;

pub use config::ChannelEnv;
pub use delegate::ChannelDelegate;
pub use errors::{ConfigError, EnqueueError, GroupError, StorageError};
pub use events::{ChannelEvent, DiscardReason, EventBus, EventSink, SuspendReason};
pub use group::{ChannelGroup, ChannelGroupConfig};
pub use ingestion::{
    http::HttpIngestion, Ack, Credentials, Endpoint, Ingestion, LogUrl, TransportError,
};
pub use log::{LogEntry, LogId, StoredLog};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{Batch, BatchId, LogStore, Priority};
pub use unit::{ChannelUnitConfiguration, ChannelUnitHandle, UnitSnapshot, UnitStatus};
