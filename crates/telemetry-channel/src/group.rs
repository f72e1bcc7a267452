// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of channel units sharing one log store and one default transport.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_SEND_TIMEOUT, FLUSH_POLL_INTERVAL};
use crate::delegate::{ChannelDelegate, Delegates};
use crate::errors::{ConfigError, EnqueueError, GroupError};
use crate::events::EventSink;
use crate::ingestion::http::HttpIngestion;
use crate::ingestion::{Credentials, Endpoint, Ingestion, LogUrl, SharedEndpoint};
use crate::store::LogStore;
use crate::unit::service::{ChannelUnitService, UnitContext};
use crate::unit::{ChannelUnitConfiguration, ChannelUnitHandle, UnitSnapshot, UnitStatus};

/// Settings of the group's default transport.
#[derive(Debug, Clone)]
pub struct ChannelGroupConfig {
    pub log_url: LogUrl,
    pub app_secret: String,
    /// Generated when absent.
    pub install_id: Option<Uuid>,
    pub http_timeout: Duration,
    /// zstd level for request bodies; `None` sends them uncompressed.
    pub compression_level: Option<i32>,
}

impl Default for ChannelGroupConfig {
    fn default() -> Self {
        Self {
            log_url: LogUrl::default(),
            app_secret: String::new(),
            install_id: None,
            http_timeout: DEFAULT_SEND_TIMEOUT,
            compression_level: None,
        }
    }
}

struct RegisteredUnit {
    handle: ChannelUnitHandle,
    uses_default_ingestion: bool,
    task: JoinHandle<()>,
}

/// Owns the channel units and routes logs to them by group name.
///
/// Must be created and used from within a Tokio runtime.
pub struct ChannelGroup {
    store: LogStore,
    endpoint: SharedEndpoint,
    default_ingestion: Arc<dyn Ingestion>,
    units: RwLock<HashMap<String, RegisteredUnit>>,
    delegates: Delegates,
    events: EventSink,
    quota_gate: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl ChannelGroup {
    /// Creates a group whose default transport is [`HttpIngestion`].
    #[must_use]
    pub fn new(store: LogStore, config: ChannelGroupConfig, events: EventSink) -> Self {
        let ingestion = HttpIngestion::new(config.http_timeout, config.compression_level);
        Self::with_default_ingestion(store, config, events, Arc::new(ingestion))
    }

    #[must_use]
    pub fn with_default_ingestion(
        store: LogStore,
        config: ChannelGroupConfig,
        events: EventSink,
        default_ingestion: Arc<dyn Ingestion>,
    ) -> Self {
        let install_id = config.install_id.unwrap_or_else(Uuid::new_v4);
        debug!("CHANNEL | Channel group created with install id {}", install_id);
        let endpoint = SharedEndpoint::new(Endpoint {
            url: config.log_url,
            credentials: Credentials {
                app_secret: config.app_secret,
                install_id,
            },
        });
        Self {
            store,
            endpoint,
            default_ingestion,
            units: RwLock::new(HashMap::new()),
            delegates: Delegates::default(),
            events,
            quota_gate: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates and starts a unit for `config.group`. Without an explicit
    /// transport the unit uses the group's default one and follows later
    /// log URL and app secret changes. An explicit transport keeps the
    /// endpoint that was current when the unit was added.
    pub fn add_channel_unit(
        &self,
        config: ChannelUnitConfiguration,
        ingestion: Option<Arc<dyn Ingestion>>,
    ) -> Result<ChannelUnitHandle, GroupError> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.contains_key(&config.group) {
            return Err(GroupError::DuplicateGroup(config.group));
        }

        let uses_default_ingestion = ingestion.is_none();
        let (ingestion, endpoint) = match ingestion {
            Some(ingestion) => (ingestion, SharedEndpoint::new(self.endpoint.snapshot())),
            None => (Arc::clone(&self.default_ingestion), self.endpoint.clone()),
        };
        let context = UnitContext {
            store: self.store.clone(),
            endpoint,
            delegates: self.delegates.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.child_token(),
        };
        let group = config.group.clone();
        let (service, handle) = ChannelUnitService::new(config, ingestion, context);
        let task = tokio::spawn(service.run());
        debug!("CHANNEL | Added channel unit {}", group);
        units.insert(
            group,
            RegisteredUnit {
                handle: handle.clone(),
                uses_default_ingestion,
                task,
            },
        );
        Ok(handle)
    }

    /// Stops a unit, cancels its in-flight sends, and deletes its stored logs.
    pub async fn remove_channel_unit(&self, group: &str) -> Result<(), GroupError> {
        let registered = self
            .units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(group)
            .ok_or_else(|| GroupError::UnknownGroup(group.to_string()))?;
        registered.handle.shutdown(true).await;
        if let Err(e) = registered.task.await {
            error!("CHANNEL | Channel unit {} task failed: {}", group, e);
        }
        debug!("CHANNEL | Removed channel unit {}", group);
        Ok(())
    }

    #[must_use]
    pub fn unit(&self, group: &str) -> Option<ChannelUnitHandle> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .map(|registered| registered.handle.clone())
    }

    /// Names of the registered groups, sorted.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        groups.sort();
        groups
    }

    fn handles(&self) -> Vec<ChannelUnitHandle> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|registered| registered.handle.clone())
            .collect()
    }

    fn route(&self, group: &str) -> Result<ChannelUnitHandle, EnqueueError> {
        self.unit(group)
            .ok_or_else(|| EnqueueError::UnknownGroup(group.to_string()))
    }

    /// Hands a log payload to the unit registered for `group`.
    pub async fn enqueue(&self, payload: serde_json::Value, group: &str) -> Result<(), EnqueueError> {
        self.route(group)?.enqueue(payload).await.map(|_| ())
    }

    /// Same as [`Self::enqueue`] for producers on plain OS threads.
    pub fn enqueue_blocking(&self, payload: serde_json::Value, group: &str) -> Result<(), EnqueueError> {
        self.route(group)?.enqueue_blocking(payload).map(|_| ())
    }

    /// Changes the log URL used by the default transport, effective with the
    /// next send of every unit using it.
    pub fn set_log_url(&self, url: &str) -> Result<(), ConfigError> {
        let url = LogUrl::parse(url)?;
        debug!("CHANNEL | Log url set to {}", url);
        if self.endpoint.set_url(url) {
            self.notify_endpoint_changed();
        }
        Ok(())
    }

    /// Changes the app secret used by the default transport, effective with
    /// the next send of every unit using it.
    pub fn set_app_secret(&self, app_secret: impl Into<String>) {
        if self.endpoint.set_app_secret(app_secret.into()) {
            debug!("CHANNEL | App secret updated");
            self.notify_endpoint_changed();
        }
    }

    fn notify_endpoint_changed(&self) {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        for registered in units.values().filter(|registered| registered.uses_default_ingestion) {
            if registered.handle.endpoint_changed().is_err() {
                warn!(
                    "CHANNEL | Channel unit {} is not running",
                    registered.handle.group()
                );
            }
        }
    }

    /// Changes the storage quota in the background and reports whether the
    /// size was accepted. `completion` runs exactly once, after any eviction
    /// caused by the change.
    pub fn set_max_storage_size<F>(&self, bytes: u64, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let store = self.store.clone();
        let gate = Arc::clone(&self.quota_gate);
        tokio::spawn(async move {
            let accepted = apply_quota(store, gate, bytes).await;
            completion(accepted);
        });
    }

    /// Awaitable form of [`Self::set_max_storage_size`].
    pub async fn set_max_storage_size_and_wait(&self, bytes: u64) -> bool {
        apply_quota(self.store.clone(), Arc::clone(&self.quota_gate), bytes).await
    }

    pub fn set_enabled(&self, enabled: bool) {
        for handle in self.handles() {
            if handle.set_enabled(enabled).is_err() {
                warn!("CHANNEL | Channel unit {} is not running", handle.group());
            }
        }
    }

    pub fn pause(&self) {
        for handle in self.handles() {
            if handle.pause().is_err() {
                warn!("CHANNEL | Channel unit {} is not running", handle.group());
            }
        }
    }

    pub fn resume(&self) {
        for handle in self.handles() {
            if handle.resume().is_err() {
                warn!("CHANNEL | Channel unit {} is not running", handle.group());
            }
        }
    }

    /// Asks every unit to send its pending logs now.
    pub fn flush(&self) {
        for handle in self.handles() {
            if handle.flush().is_err() {
                warn!("CHANNEL | Channel unit {} is not running", handle.group());
            }
        }
    }

    /// Flushes every unit and waits until none has logs left to send, or
    /// until `deadline` elapses. Suspended and disabled units count as
    /// drained, paused ones once their in-flight sends complete. Returns
    /// `false` on timeout.
    pub async fn flush_and_wait(&self, deadline: Duration) -> bool {
        let handles = self.handles();
        let drained = async {
            for handle in &handles {
                loop {
                    if handle.flush().is_err() {
                        break;
                    }
                    match handle.snapshot().await {
                        Ok(snapshot) if is_drained(&snapshot) => break,
                        Ok(_) => tokio::time::sleep(FLUSH_POLL_INTERVAL).await,
                        Err(_) => break,
                    }
                }
            }
        };
        match tokio::time::timeout(deadline, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "CHANNEL | Channel units still had logs to send after {:?}",
                    deadline
                );
                false
            }
        }
    }

    /// Registers a delegate consulted by every unit before storing a log.
    pub fn add_delegate(&self, delegate: Arc<dyn ChannelDelegate>) {
        self.delegates.add(delegate);
    }

    pub fn remove_delegate(&self, delegate: &Arc<dyn ChannelDelegate>) {
        self.delegates.remove(delegate);
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Stops every unit and flushes the store. Stored logs, including those
    /// of cancelled in-flight batches, are kept for the next start.
    pub async fn shutdown(&self) {
        let units: Vec<(String, RegisteredUnit)> = self
            .units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (group, registered) in units {
            registered.handle.shutdown(false).await;
            if let Err(e) = registered.task.await {
                error!("CHANNEL | Channel unit {} task failed: {}", group, e);
            }
        }
        self.shutdown.cancel();
        if let Err(e) = self.store.flush() {
            error!("CHANNEL | Failed to flush the log store: {}", e);
        }
        debug!("CHANNEL | Channel group shut down");
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn is_drained(snapshot: &UnitSnapshot) -> bool {
    match snapshot.status {
        UnitStatus::Suspended(_) | UnitStatus::Disabled => true,
        UnitStatus::Paused => snapshot.in_flight == 0,
        UnitStatus::Ready | UnitStatus::Sending => {
            snapshot.pending == 0 && snapshot.in_flight == 0
        }
    }
}

/// Quota changes run one at a time, off the async workers since eviction
/// touches the disk.
async fn apply_quota(store: LogStore, gate: Arc<Mutex<()>>, bytes: u64) -> bool {
    let _guard = gate.lock().await;
    match tokio::task::spawn_blocking(move || store.set_quota(bytes)).await {
        Ok(accepted) => accepted,
        Err(e) => {
            error!("CHANNEL | Failed to apply maximum storage size: {}", e);
            false
        }
    }
}
