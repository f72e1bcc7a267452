// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Store-assigned sequence id of a persisted log. Unique across groups and
/// monotonically increasing in enqueue order.
pub type LogId = u64;

/// A structured log event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub group: String,
    pub payload: serde_json::Value,
}

impl LogEntry {
    pub fn new(group: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            group: group.into(),
            payload,
        }
    }
}

/// A log read back from the store together with its sequence id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLog {
    pub id: LogId,
    pub entry: LogEntry,
}
