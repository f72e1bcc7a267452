// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, PoisonError, RwLock};

use crate::log::LogEntry;

/// Hook consulted by every channel unit before a log is persisted.
pub trait ChannelDelegate: Send + Sync {
    /// Returning `true` drops the log. The producer still sees a successful
    /// enqueue.
    fn should_filter(&self, _entry: &LogEntry) -> bool {
        false
    }
}

/// Delegate list shared between a group and its units.
#[derive(Clone, Default)]
pub(crate) struct Delegates {
    inner: Arc<RwLock<Vec<Arc<dyn ChannelDelegate>>>>,
}

impl Delegates {
    pub(crate) fn add(&self, delegate: Arc<dyn ChannelDelegate>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delegate);
    }

    pub(crate) fn remove(&self, delegate: &Arc<dyn ChannelDelegate>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|registered| !Arc::ptr_eq(registered, delegate));
    }

    pub(crate) fn should_filter(&self, entry: &LogEntry) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|delegate| delegate.should_filter(entry))
    }
}

impl std::fmt::Debug for Delegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delegates")
    }
}
