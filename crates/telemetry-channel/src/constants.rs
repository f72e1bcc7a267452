// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default storage quota: 10 MiB.
pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Smallest quota accepted by `set_quota`: 20 KiB.
pub const MIN_STORAGE_SIZE: u64 = 20 * 1024;

/// Quotas are rounded up to a multiple of this block size.
pub const STORAGE_PAGE_SIZE: u64 = 4096;

/// Bytes used by the big-endian sequence key of every stored log.
pub const LOG_KEY_SIZE: u64 = 8;

pub const DEFAULT_BATCH_SIZE: usize = 50;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(3);

pub const DEFAULT_MAX_PARALLEL_BATCHES: usize = 3;

/// Scheme + authority of the default ingestion backend.
pub const DEFAULT_LOG_URL: &str = "https://in.appcenter.ms";

/// Path and query appended to the log URL by the HTTP transport.
pub const LOGS_PATH: &str = "/logs?api-version=1.0.0";

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// How often `flush_and_wait` re-checks the units.
pub const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the diagnostic event bus.
pub const MAX_EVENTS: usize = 1024;
