// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed, size-bounded log storage shared by every channel unit.
//!
//! Logs live in one sled tree per group (`logs/<group>`) keyed by a
//! big-endian sequence id, so iteration order is enqueue order and the
//! persisted layout is `(group, sequence)`. An in-memory index mirrors the
//! trees and tracks which entries are part of an in-flight batch; it is
//! rebuilt from disk on open, which makes every unacknowledged log eligible
//! for a fresh batch after a restart.
//!
//! Groups whose unit disables persistence write to a temporary sled database
//! instead. Both databases count against the same quota.
//!
//! When the quota is exceeded, whole batches of the oldest unbatched entries
//! are evicted, lowest priority group first. Ties between groups of equal
//! priority go to the group holding the oldest entry. Evicted entries are
//! reported to the owning unit through its [`DiscardSink`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sled::{Config as SledConfig, Db, Tree};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_STORAGE_SIZE, LOG_KEY_SIZE, MIN_STORAGE_SIZE,
    STORAGE_PAGE_SIZE,
};
use crate::errors::StorageError;
use crate::events::DiscardReason;
use crate::log::{LogEntry, LogId, StoredLog};

/// Prefix of the sled trees holding logs.
const LOG_TREE_PREFIX: &str = "logs/";

/// Eviction order: lower priorities are evicted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Backup,
    #[default]
    Default,
    High,
}

/// Identifier of an in-flight batch, unique for the lifetime of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logs selected for one send attempt, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub group: String,
    /// Number of failed send attempts already recorded for these logs.
    pub attempt: u32,
    pub logs: Vec<StoredLog>,
}

impl Batch {
    #[must_use]
    pub fn log_ids(&self) -> Vec<LogId> {
        self.logs.iter().map(|log| log.id).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter().map(|log| &log.entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// Logs that left the store without being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discarded {
    pub group: String,
    pub log_ids: Vec<LogId>,
    pub reason: DiscardReason,
}

/// Callback receiving evicted and corrupt logs for a group.
pub type DiscardSink = Arc<dyn Fn(Discarded) + Send + Sync>;

/// Storage policy of a group, provided by the unit that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRegistration {
    pub group: String,
    pub priority: Priority,
    /// `false` keeps the group's new logs in memory only.
    pub persistent: bool,
    /// Number of entries evicted at once when the group is chosen for eviction.
    pub eviction_batch_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct IndexedLog {
    size: u64,
    volatile: bool,
    batch: Option<BatchId>,
    attempts: u32,
}

#[derive(Default)]
struct GroupIndex {
    registration: Option<GroupRegistration>,
    sink: Option<DiscardSink>,
    entries: BTreeMap<LogId, IndexedLog>,
}

impl GroupIndex {
    fn priority(&self) -> Priority {
        self.registration
            .as_ref()
            .map_or(Priority::Default, |registration| registration.priority)
    }

    fn persistent(&self) -> bool {
        self.registration
            .as_ref()
            .map_or(true, |registration| registration.persistent)
    }

    fn eviction_batch_size(&self) -> usize {
        self.registration
            .as_ref()
            .map_or(DEFAULT_BATCH_SIZE, |registration| {
                registration.eviction_batch_size.max(1)
            })
    }

    fn unbatched(&self) -> impl Iterator<Item = (&LogId, &IndexedLog)> {
        self.entries.iter().filter(|(_, log)| log.batch.is_none())
    }
}

#[derive(Debug)]
struct BatchMarker {
    group: String,
    log_ids: Vec<LogId>,
}

type Notification = (Option<DiscardSink>, Discarded);

struct StoreInner {
    durable: Db,
    volatile: Db,
    quota: u64,
    usage: u64,
    next_log_id: LogId,
    next_batch_id: u64,
    groups: HashMap<String, GroupIndex>,
    batches: HashMap<BatchId, BatchMarker>,
    corrupt_dropped: u64,
}

/// Handle to the shared log store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<StoreInner>>,
    path: PathBuf,
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStore").field("path", &self.path).finish()
    }
}

impl LogStore {
    /// Opens (or creates) a store at the provided path and indexes every log
    /// left over from previous runs.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let durable = sled_config(&path).open()?;
        Self::load(durable, path)
    }

    /// Opens a store that keeps everything in memory.
    pub fn open_ephemeral() -> Result<Self, StorageError> {
        let durable = SledConfig::new().temporary(true).open()?;
        Self::load(durable, PathBuf::new())
    }

    fn load(durable: Db, path: PathBuf) -> Result<Self, StorageError> {
        let volatile = SledConfig::new().temporary(true).open()?;
        let mut inner = StoreInner {
            durable,
            volatile,
            quota: DEFAULT_MAX_STORAGE_SIZE,
            usage: 0,
            next_log_id: 0,
            next_batch_id: 0,
            groups: HashMap::new(),
            batches: HashMap::new(),
            corrupt_dropped: 0,
        };
        inner.rebuild_index()?;
        debug!(
            "CHANNEL | Log store opened with {} bytes in {} groups",
            inner.usage,
            inner.groups.len()
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            path,
        })
    }

    /// Returns the filesystem path backing the store (empty when ephemeral).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares the storage policy of a group and where its discarded logs
    /// are reported. Entries already stored for the group are kept.
    pub fn register_group(&self, registration: GroupRegistration, sink: Option<DiscardSink>) {
        let mut inner = self.lock();
        let index = inner
            .groups
            .entry(registration.group.clone())
            .or_default();
        index.registration = Some(registration);
        index.sink = sink;
    }

    /// Forgets the policy and sink of a group while keeping its logs.
    pub fn detach_group(&self, group: &str) {
        let mut inner = self.lock();
        let is_empty = match inner.groups.get_mut(group) {
            Some(index) => {
                index.registration = None;
                index.sink = None;
                index.entries.is_empty()
            }
            None => return,
        };
        if is_empty {
            inner.groups.remove(group);
        }
    }

    /// Deletes the logs of a group and forgets it.
    pub fn unregister_group(&self, group: &str) -> Result<Vec<LogId>, StorageError> {
        let mut inner = self.lock();
        let removed = inner.delete_group(group)?;
        inner.groups.remove(group);
        Ok(removed)
    }

    /// Persists a log, evicting older logs of groups with the same or a lower
    /// priority when the quota would be exceeded.
    pub fn append(&self, group: &str, entry: &LogEntry) -> Result<LogId, StorageError> {
        let value = serde_json::to_vec(entry)?;
        let size = entry_size(value.len());
        let (result, notifications) = {
            let mut inner = self.lock();
            let mut notifications = Vec::new();
            let result = inner.append(group, &value, size, &mut notifications);
            (result, notifications)
        };
        notify(notifications);
        result
    }

    /// Selects up to `max_count` of the oldest unbatched logs of a group and
    /// marks them as part of a new batch.
    pub fn next_batch(&self, group: &str, max_count: usize) -> Result<Option<Batch>, StorageError> {
        let (result, notifications) = {
            let mut inner = self.lock();
            let mut notifications = Vec::new();
            let result = inner.next_batch(group, max_count, &mut notifications);
            (result, notifications)
        };
        notify(notifications);
        result
    }

    /// Deletes the logs of a batch. Unknown batch ids are ignored.
    pub fn remove(&self, batch_id: BatchId) -> Result<usize, StorageError> {
        let mut inner = self.lock();
        let Some(marker) = inner.batches.remove(&batch_id) else {
            return Ok(0);
        };
        let ids = inner.marked_entries(&marker, batch_id);
        inner.delete_entries(&marker.group, &ids)?;
        Ok(ids.len())
    }

    /// Makes the logs of a failed batch selectable again and counts the
    /// failure against them. Their relative order is unchanged.
    pub fn release(&self, batch_id: BatchId) -> usize {
        self.lock().unmark(batch_id, true)
    }

    /// Makes the logs of a cancelled batch selectable again without counting
    /// a failed attempt.
    pub fn unmark(&self, batch_id: BatchId) -> usize {
        self.lock().unmark(batch_id, false)
    }

    /// Removes every log and batch marker of a group, returning the removed
    /// log ids.
    pub fn delete_group(&self, group: &str) -> Result<Vec<LogId>, StorageError> {
        self.lock().delete_group(group)
    }

    /// Changes the quota. The size is rounded up to a multiple of
    /// [`STORAGE_PAGE_SIZE`]; sizes below [`MIN_STORAGE_SIZE`] are rejected and
    /// leave the current quota untouched. Usage above the new quota is
    /// evicted across all groups.
    pub fn set_quota(&self, bytes: u64) -> bool {
        if bytes < MIN_STORAGE_SIZE {
            warn!(
                "CHANNEL | Maximum storage size {} is below the minimum of {} bytes, ignoring",
                bytes, MIN_STORAGE_SIZE
            );
            return false;
        }
        let quota = round_up_to_page(bytes);
        let notifications = {
            let mut inner = self.lock();
            inner.quota = quota;
            let mut notifications = Vec::new();
            if let Err(e) = inner.evict_until(quota, None, &mut notifications) {
                warn!("CHANNEL | Failed to evict logs after quota change: {}", e);
            }
            if inner.usage > quota {
                warn!(
                    "CHANNEL | Storage usage {} still exceeds the new quota {} (in-flight logs)",
                    inner.usage, quota
                );
            }
            notifications
        };
        notify(notifications);
        debug!("CHANNEL | Maximum storage size set to {} bytes", quota);
        true
    }

    pub fn quota(&self) -> u64 {
        self.lock().quota
    }

    /// Bytes currently accounted against the quota.
    pub fn usage(&self) -> u64 {
        self.lock().usage
    }

    /// Number of stored logs of a group, in-flight ones included.
    pub fn count(&self, group: &str) -> usize {
        self.lock()
            .groups
            .get(group)
            .map_or(0, |index| index.entries.len())
    }

    /// Number of entries dropped because they could not be read back.
    pub fn corrupt_dropped(&self) -> u64 {
        self.lock().corrupt_dropped
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        let durable = self.lock().durable.clone();
        durable.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn durable_tree(&self, group: &str) -> Tree {
        self.lock()
            .durable
            .open_tree(tree_name(group))
            .expect("open tree")
    }
}

impl StoreInner {
    fn rebuild_index(&mut self) -> Result<(), StorageError> {
        for name in self.durable.tree_names() {
            let Some(group) = name[..].strip_prefix(LOG_TREE_PREFIX.as_bytes()) else {
                continue;
            };
            let group = String::from_utf8_lossy(group).into_owned();
            let tree = self.durable.open_tree(&name)?;
            let mut malformed = Vec::new();
            let index = self.groups.entry(group.clone()).or_default();
            for item in tree.iter() {
                let (key, value) = item?;
                let Ok(raw) = <[u8; 8]>::try_from(key.as_ref()) else {
                    malformed.push(key);
                    continue;
                };
                let id = u64::from_be_bytes(raw);
                let size = entry_size(value.len());
                index.entries.insert(
                    id,
                    IndexedLog {
                        size,
                        volatile: false,
                        batch: None,
                        attempts: 0,
                    },
                );
                self.usage += size;
                self.next_log_id = self.next_log_id.max(id + 1);
            }
            if index.entries.is_empty() {
                self.groups.remove(&group);
            }
            for key in malformed {
                warn!("CHANNEL | Dropping malformed log key in group {}", group);
                tree.remove(key)?;
                self.corrupt_dropped += 1;
            }
        }
        Ok(())
    }

    fn tree(&self, group: &str, volatile: bool) -> Result<Tree, StorageError> {
        let db = if volatile {
            &self.volatile
        } else {
            &self.durable
        };
        Ok(db.open_tree(tree_name(group))?)
    }

    fn discarded(&self, group: &str, log_ids: Vec<LogId>, reason: DiscardReason) -> Notification {
        let sink = self
            .groups
            .get(group)
            .and_then(|index| index.sink.clone());
        (
            sink,
            Discarded {
                group: group.to_owned(),
                log_ids,
                reason,
            },
        )
    }

    fn append(
        &mut self,
        group: &str,
        value: &[u8],
        size: u64,
        notifications: &mut Vec<Notification>,
    ) -> Result<LogId, StorageError> {
        if size > self.quota {
            warn!(
                "CHANNEL | Log of {} bytes for group {} exceeds the storage quota of {} bytes",
                size, group, self.quota
            );
            return Err(StorageError::Full);
        }
        if self.usage + size > self.quota {
            let ceiling = self
                .groups
                .get(group)
                .map_or(Priority::Default, GroupIndex::priority);
            let target = self.quota - size;
            self.evict_until(target, Some(ceiling), notifications)?;
            if self.usage + size > self.quota {
                warn!(
                    "CHANNEL | Storage is full, rejecting log for group {} ({} of {} bytes used)",
                    group, self.usage, self.quota
                );
                return Err(StorageError::Full);
            }
        }

        let volatile = !self.groups.get(group).map_or(true, GroupIndex::persistent);
        let id = self.next_log_id;
        let tree = self.tree(group, volatile)?;
        tree.insert(log_key(id), value)?;
        if !volatile {
            tree.flush()?;
        }
        self.next_log_id += 1;
        self.usage += size;
        self.groups.entry(group.to_owned()).or_default().entries.insert(
            id,
            IndexedLog {
                size,
                volatile,
                batch: None,
                attempts: 0,
            },
        );
        Ok(id)
    }

    fn next_batch(
        &mut self,
        group: &str,
        max_count: usize,
        notifications: &mut Vec<Notification>,
    ) -> Result<Option<Batch>, StorageError> {
        let max_count = max_count.max(1);
        loop {
            let Some(index) = self.groups.get(group) else {
                return Ok(None);
            };
            let mut unbatched = index.unbatched().peekable();
            let attempt = unbatched.peek().map_or(0, |(_, log)| log.attempts);
            // Logs that already failed are resent on their own, never mixed
            // with logs on a different attempt count.
            let candidates: Vec<(LogId, bool)> = unbatched
                .take_while(|(_, log)| log.attempts == attempt)
                .take(max_count)
                .map(|(id, log)| (*id, log.volatile))
                .collect();
            if candidates.is_empty() {
                return Ok(None);
            }

            let durable_tree = self.tree(group, false)?;
            let volatile_tree = self.tree(group, true)?;
            let mut logs = Vec::with_capacity(candidates.len());
            let mut corrupt = Vec::new();
            for (id, volatile) in candidates {
                let tree = if volatile {
                    &volatile_tree
                } else {
                    &durable_tree
                };
                let Some(bytes) = tree.get(log_key(id))? else {
                    corrupt.push(id);
                    continue;
                };
                match decode_entry(id, &bytes) {
                    Ok(entry) => logs.push(StoredLog { id, entry }),
                    Err(e) => {
                        warn!("CHANNEL | Dropping log of group {}: {}", group, e);
                        corrupt.push(id);
                    }
                }
            }

            if !corrupt.is_empty() {
                self.delete_entries(group, &corrupt)?;
                self.corrupt_dropped += corrupt.len() as u64;
                notifications.push(self.discarded(group, corrupt, DiscardReason::Corrupt));
            }
            if logs.is_empty() {
                continue;
            }

            let batch_id = BatchId(self.next_batch_id);
            self.next_batch_id += 1;
            if let Some(index) = self.groups.get_mut(group) {
                for log in &logs {
                    if let Some(indexed) = index.entries.get_mut(&log.id) {
                        indexed.batch = Some(batch_id);
                    }
                }
            }
            self.batches.insert(
                batch_id,
                BatchMarker {
                    group: group.to_owned(),
                    log_ids: logs.iter().map(|log| log.id).collect(),
                },
            );
            return Ok(Some(Batch {
                id: batch_id,
                group: group.to_owned(),
                attempt,
                logs,
            }));
        }
    }

    /// Ids of a marker's logs that are still stored and still in its batch.
    fn marked_entries(&self, marker: &BatchMarker, batch_id: BatchId) -> Vec<LogId> {
        let Some(index) = self.groups.get(&marker.group) else {
            return Vec::new();
        };
        marker
            .log_ids
            .iter()
            .copied()
            .filter(|id| {
                index
                    .entries
                    .get(id)
                    .is_some_and(|log| log.batch == Some(batch_id))
            })
            .collect()
    }

    fn unmark(&mut self, batch_id: BatchId, count_attempt: bool) -> usize {
        let Some(marker) = self.batches.remove(&batch_id) else {
            return 0;
        };
        let ids = self.marked_entries(&marker, batch_id);
        if let Some(index) = self.groups.get_mut(&marker.group) {
            for id in &ids {
                if let Some(log) = index.entries.get_mut(id) {
                    log.batch = None;
                    if count_attempt {
                        log.attempts = log.attempts.saturating_add(1);
                    }
                }
            }
        }
        ids.len()
    }

    fn delete_entries(&mut self, group: &str, ids: &[LogId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let durable_tree = self.tree(group, false)?;
        let volatile_tree = self.tree(group, true)?;
        let Some(index) = self.groups.get_mut(group) else {
            return Ok(());
        };
        for id in ids {
            let Some(log) = index.entries.remove(id) else {
                continue;
            };
            let tree = if log.volatile {
                &volatile_tree
            } else {
                &durable_tree
            };
            tree.remove(log_key(*id))?;
            self.usage = self.usage.saturating_sub(log.size);
        }
        Ok(())
    }

    fn delete_group(&mut self, group: &str) -> Result<Vec<LogId>, StorageError> {
        self.batches.retain(|_, marker| marker.group != group);
        let Some(index) = self.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let entries = std::mem::take(&mut index.entries);
        let freed: u64 = entries.values().map(|log| log.size).sum();
        self.usage = self.usage.saturating_sub(freed);
        for db in [&self.durable, &self.volatile] {
            match db.drop_tree(tree_name(group)) {
                Ok(_) => {}
                // The tree may not exist yet, which is harmless.
                Err(sled::Error::CollectionNotFound(_)) => {}
                Err(err) => return Err(StorageError::Db(err)),
            }
        }
        Ok(entries.into_keys().collect())
    }

    /// Evicts whole batches of the oldest unbatched logs until usage fits in
    /// `target`. Only groups at or below `ceiling` are considered.
    fn evict_until(
        &mut self,
        target: u64,
        ceiling: Option<Priority>,
        notifications: &mut Vec<Notification>,
    ) -> Result<(), StorageError> {
        let mut evicted: BTreeMap<String, Vec<LogId>> = BTreeMap::new();
        while self.usage > target {
            let candidate = self
                .groups
                .iter()
                .filter(|(_, index)| ceiling.map_or(true, |ceiling| index.priority() <= ceiling))
                .filter_map(|(group, index)| {
                    index
                        .unbatched()
                        .next()
                        .map(|(oldest, _)| (index.priority(), *oldest, group.clone()))
                })
                .min();
            let Some((_, _, group)) = candidate else {
                break;
            };
            let ids: Vec<LogId> = match self.groups.get(&group) {
                Some(index) => index
                    .unbatched()
                    .take(index.eviction_batch_size())
                    .map(|(id, _)| *id)
                    .collect(),
                None => break,
            };
            debug!(
                "CHANNEL | Evicting {} logs of group {} to fit the storage quota",
                ids.len(),
                group
            );
            self.delete_entries(&group, &ids)?;
            evicted.entry(group).or_default().extend(ids);
        }
        for (group, log_ids) in evicted {
            notifications.push(self.discarded(&group, log_ids, DiscardReason::Evicted));
        }
        Ok(())
    }
}

fn notify(notifications: Vec<Notification>) {
    for (sink, discarded) in notifications {
        match sink {
            Some(sink) => sink(discarded),
            None => warn!(
                "CHANNEL | Discarded {} logs of unregistered group {} ({:?})",
                discarded.log_ids.len(),
                discarded.group,
                discarded.reason
            ),
        }
    }
}

/// Rounds a quota up to the next multiple of [`STORAGE_PAGE_SIZE`].
#[must_use]
pub fn round_up_to_page(bytes: u64) -> u64 {
    bytes
        .div_ceil(STORAGE_PAGE_SIZE)
        .saturating_mul(STORAGE_PAGE_SIZE)
}

fn entry_size(value_len: usize) -> u64 {
    LOG_KEY_SIZE + value_len as u64
}

fn tree_name(group: &str) -> String {
    format!("{LOG_TREE_PREFIX}{group}")
}

fn decode_entry(id: LogId, bytes: &[u8]) -> Result<LogEntry, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| {
        debug!("CHANNEL | Failed to decode log {}: {}", id, e);
        StorageError::Corrupt(id)
    })
}

fn log_key(id: LogId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Builds a sled configuration using the provided filesystem path.
fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new().path(path).cache_capacity(16 * 1024 * 1024)
}
