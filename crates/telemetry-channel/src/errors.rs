// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the channel subsystem.
//!
//! Producers only ever see [`EnqueueError`]: transport failures are handled
//! inside the channel units and surface as diagnostic events instead.

use thiserror::Error;

/// Local admission failure returned to producers by `enqueue`.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("channel unit is disabled")]
    UnitDisabled,
    #[error("channel unit is suspended")]
    UnitSuspended,
    #[error("no channel unit registered for group {0}")]
    UnknownGroup(String),
    #[error("log storage is full")]
    StorageFull,
    #[error("log storage failure: {0}")]
    Storage(StorageError),
    #[error("channel unit {0} is no longer running")]
    UnitStopped(String),
}

impl From<StorageError> for EnqueueError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Full => EnqueueError::StorageFull,
            other => EnqueueError::Storage(other),
        }
    }
}

/// Errors emitted by the [`crate::store::LogStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The quota is reached and eviction could not free enough space.
    #[error("storage quota exceeded")]
    Full,
    /// A stored entry could not be decoded.
    #[error("corrupt log entry {0}")]
    Corrupt(u64),
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid log url {url}: {reason}")]
    InvalidLogUrl { url: String, reason: &'static str },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Failures of channel group registry operations.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("a channel unit is already registered for group {0}")]
    DuplicateGroup(String),
    #[error("no channel unit registered for group {0}")]
    UnknownGroup(String),
}
