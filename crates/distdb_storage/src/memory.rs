//! In-memory sync store.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use distdb_codec::{
    DataItem, LOCAL_FLAG, MAX_BATCH_SIZE, MAX_DEVICE_ID_LEN, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::{ConflictResolvePolicy, StoreConfig, StoreProperties};
use crate::conflict::{resolve, ConflictResolution};
use crate::device::{hash_device_id, short_device_id};
use crate::error::{StorageError, StorageResult};
use crate::interface::{
    estimated_item_size, DataSizeSpec, StoreEvent, SyncBatch, SyncStorage, APPEND_LEN,
};
use crate::security::SecurityOption;
use crate::token::{ContinueToken, TokenRegistry};

/// Device name used when a sender does not identify itself.
pub const UNKNOWN_DEVICE: &str = "Unknown";

/// Storage generation the engine currently serves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    /// Normal operation.
    #[default]
    MainDb,
    /// Writes are held in the cache generation; reads are revoked.
    CacheDb,
    /// Cached writes are being replayed into the main generation.
    Migrating,
    /// The main generation is being attached.
    Attaching,
    /// The engine is occupied by a maintenance task.
    EngineBusy,
}

impl EngineState {
    fn restriction(self) -> Option<StorageError> {
        match self {
            Self::MainDb => None,
            Self::CacheDb => Some(StorageError::KeyRevoked),
            other => Some(StorageError::busy(other.to_string())),
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MainDb => "main",
            Self::CacheDb => "cache",
            Self::Migrating => "migrating",
            Self::Attaching => "attaching",
            Self::EngineBusy => "busy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    item: DataItem,
    // hashed id of the delivering device; empty for local writes
    source: String,
}

impl StoredRecord {
    fn sync_copy(&self) -> DataItem {
        let mut item = self.item.clone();
        item.flag &= !LOCAL_FLAG;
        item
    }
}

#[derive(Debug, Default)]
struct Records {
    by_key: HashMap<Vec<u8>, StoredRecord>,
    by_time: BTreeSet<(u64, Vec<u8>)>,
}

impl Records {
    fn get(&self, key: &[u8]) -> Option<&StoredRecord> {
        self.by_key.get(key)
    }

    fn insert(&mut self, record: StoredRecord) {
        let key = record.item.key.clone();
        let timestamp = record.item.timestamp;
        if let Some(old) = self.by_key.insert(key.clone(), record) {
            self.by_time.remove(&(old.item.timestamp, key.clone()));
        }
        self.by_time.insert((timestamp, key));
    }

    fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&StoredRecord) -> bool,
    {
        let doomed: Vec<Vec<u8>> = self
            .by_key
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(record) = self.by_key.remove(key) {
                self.by_time.remove(&(record.item.timestamp, key.clone()));
            }
        }
        doomed.len()
    }

    fn range(&self, begin: u64, end: u64) -> impl Iterator<Item = &StoredRecord> + '_ {
        self.by_time
            .range((begin, Vec::new())..(end, Vec::new()))
            .filter_map(|(_, key)| self.by_key.get(key))
    }
}

#[derive(Debug)]
enum CachedOp {
    Local(Vec<DataItem>),
    Sync { device: String, items: Vec<DataItem> },
    Remove { device: String, notify: bool },
}

#[derive(Debug)]
struct CachedBatch {
    record_version: u64,
    op: CachedOp,
}

fn check_entry(key: &[u8], value: &[u8]) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(StorageError::invalid_args(format!(
            "key length {} outside 1..={MAX_KEY_SIZE}",
            key.len()
        )));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(StorageError::invalid_args(format!(
            "value length {} exceeds {MAX_VALUE_SIZE}",
            value.len()
        )));
    }
    Ok(())
}

fn check_device(device: &str) -> StorageResult<()> {
    if device.len() > MAX_DEVICE_ID_LEN {
        return Err(StorageError::invalid_args(format!(
            "device id length {} exceeds {MAX_DEVICE_ID_LEN}",
            device.len()
        )));
    }
    Ok(())
}

fn check_batch_len(len: usize) -> StorageResult<()> {
    if len == 0 || len > MAX_BATCH_SIZE {
        return Err(StorageError::invalid_args(format!(
            "batch of {len} entries outside 1..={MAX_BATCH_SIZE}"
        )));
    }
    Ok(())
}

/// A sync store held entirely in memory.
///
/// Records are indexed by key and by `(timestamp, key)`, so range scans are
/// ordered by timestamp. Local-only data written with [`put_local`] lives in a
/// separate table and never takes part in sync.
///
/// [`put_local`]: MemorySyncStore::put_local
pub struct MemorySyncStore {
    config: StoreConfig,
    records: RwLock<Records>,
    local_data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    max_timestamp: Mutex<u64>,
    state: RwLock<EngineState>,
    cache: Mutex<Vec<CachedBatch>>,
    cache_record_version: AtomicU64,
    tokens: Arc<TokenRegistry>,
    events: Mutex<Option<UnboundedSender<StoreEvent>>>,
}

impl fmt::Debug for MemorySyncStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySyncStore")
            .field("store", &self.config.properties.store_id)
            .field("records", &self.records.read().by_key.len())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemorySyncStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            records: RwLock::new(Records::default()),
            local_data: RwLock::new(HashMap::new()),
            max_timestamp: Mutex::new(0),
            state: RwLock::new(EngineState::MainDb),
            cache: Mutex::new(Vec::new()),
            cache_record_version: AtomicU64::new(0),
            tokens: TokenRegistry::new(),
            events: Mutex::new(None),
        }
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Routes store events to the returned receiver, replacing any earlier one.
    pub fn subscribe(&self) -> UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Current engine state.
    pub fn engine_state(&self) -> EngineState {
        *self.state.read()
    }

    /// Switches the engine state.
    pub fn set_engine_state(&self, state: EngineState) {
        info!(store = %self.config.properties.store_id, %state, "engine state changed");
        *self.state.write() = state;
    }

    /// Record version the next cached batch will carry.
    pub fn cache_record_version(&self) -> u64 {
        self.cache_record_version.load(Ordering::SeqCst)
    }

    /// Number of batches waiting in the cache generation.
    pub fn cached_batch_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Number of unfinished scans.
    pub fn open_token_count(&self) -> usize {
        self.tokens.live_count()
    }

    fn check_readable(&self) -> StorageResult<()> {
        match self.engine_state().restriction() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_timestamp(&self) -> u64 {
        let mut max = self.max_timestamp.lock();
        *max += 1;
        *max
    }

    fn push_cache(&self, op: CachedOp) -> u64 {
        let record_version = self.cache_record_version.fetch_add(1, Ordering::SeqCst);
        self.cache.lock().push(CachedBatch { record_version, op });
        debug!(record_version, "batch cached");
        record_version
    }

    /// Writes `key` at the next local timestamp and returns that timestamp.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> StorageResult<u64> {
        let (key, value) = (key.into(), value.into());
        check_entry(&key, &value)?;
        let timestamp = self.next_timestamp();
        self.write_local(vec![DataItem::new(key, value, timestamp)])?;
        Ok(timestamp)
    }

    /// Writes `key` at an explicit timestamp.
    pub fn put_at(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp: u64,
    ) -> StorageResult<()> {
        let (key, value) = (key.into(), value.into());
        check_entry(&key, &value)?;
        self.set_max_timestamp(timestamp);
        self.write_local(vec![DataItem::new(key, value, timestamp)])
    }

    /// Writes up to [`MAX_BATCH_SIZE`] entries, each at its own timestamp.
    /// Returns the last timestamp used.
    pub fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> StorageResult<u64> {
        check_batch_len(entries.len())?;
        for (key, value) in &entries {
            check_entry(key, value)?;
        }
        let items: Vec<DataItem> = entries
            .into_iter()
            .map(|(key, value)| DataItem::new(key, value, self.next_timestamp()))
            .collect();
        let last = items.last().map_or_else(|| self.get_max_timestamp(), |item| item.timestamp);
        self.write_local(items)?;
        Ok(last)
    }

    /// Replaces `key` with a tombstone and returns its timestamp.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key has no live record.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> StorageResult<u64> {
        let key = key.into();
        check_entry(&key, &[])?;
        let live = self
            .records
            .read()
            .get(&key)
            .is_some_and(|record| !record.item.is_deleted());
        if !live {
            return Err(StorageError::NotFound);
        }
        let timestamp = self.next_timestamp();
        self.write_local(vec![DataItem::tombstone(key, timestamp)])?;
        Ok(timestamp)
    }

    /// Deletes up to [`MAX_BATCH_SIZE`] keys, each at its own timestamp.
    /// Returns the last timestamp used.
    pub fn delete_batch(&self, keys: Vec<Vec<u8>>) -> StorageResult<u64> {
        check_batch_len(keys.len())?;
        for key in &keys {
            check_entry(key, &[])?;
        }
        let items: Vec<DataItem> = keys
            .into_iter()
            .map(|key| DataItem::tombstone(key, self.next_timestamp()))
            .collect();
        let last = items.last().map_or_else(|| self.get_max_timestamp(), |item| item.timestamp);
        self.write_local(items)?;
        Ok(last)
    }

    fn write_local(&self, items: Vec<DataItem>) -> StorageResult<()> {
        match self.engine_state() {
            EngineState::MainDb => {
                self.apply_local(items);
                Ok(())
            }
            EngineState::CacheDb => {
                self.push_cache(CachedOp::Local(items));
                Ok(())
            }
            other => Err(StorageError::busy(other.to_string())),
        }
    }

    fn apply_local(&self, items: Vec<DataItem>) -> usize {
        let mut records = self.records.write();
        let count = items.len();
        for mut item in items {
            item.flag |= LOCAL_FLAG;
            records.insert(StoredRecord {
                item,
                source: String::new(),
            });
        }
        count
    }

    /// Reads the live value of `key`.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_readable()?;
        Ok(self
            .records
            .read()
            .get(key)
            .filter(|record| !record.item.is_deleted())
            .map(|record| record.item.value.clone()))
    }

    /// Full stored record for `key`, tombstones included.
    pub fn record(&self, key: &[u8]) -> Option<DataItem> {
        self.records.read().get(key).map(|record| record.item.clone())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .by_key
            .values()
            .filter(|record| !record.item.is_deleted())
            .count()
    }

    /// Returns true if no live record exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes device-local data that is never synced.
    pub fn put_local(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> StorageResult<()> {
        let (key, value) = (key.into(), value.into());
        check_entry(&key, &value)?;
        self.local_data.write().insert(key, value);
        Ok(())
    }

    /// Reads device-local data.
    pub fn get_local(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.local_data.read().get(key).cloned()
    }

    /// Replays cached batches in record-version order and returns to the main
    /// generation. Returns the number of replayed batches.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` unless the store is in cache mode.
    pub fn migrate_cache(&self) -> StorageResult<usize> {
        {
            let mut state = self.state.write();
            if *state != EngineState::CacheDb {
                return Err(StorageError::invalid_args(format!(
                    "cannot migrate from state {}",
                    *state
                )));
            }
            *state = EngineState::Migrating;
        }
        let mut batches = std::mem::take(&mut *self.cache.lock());
        batches.sort_by_key(|batch| batch.record_version);
        let count = batches.len();
        for batch in batches {
            match batch.op {
                CachedOp::Local(items) => {
                    self.apply_local(items);
                }
                CachedOp::Sync { device, items } => {
                    self.apply_sync_items(items, &device);
                }
                CachedOp::Remove { device, notify } => {
                    self.apply_remove(&device, notify);
                }
            }
        }
        *self.state.write() = EngineState::MainDb;
        info!(
            store = %self.config.properties.store_id,
            batches = count,
            "cache generation migrated"
        );
        Ok(count)
    }

    fn check_spec(&self, spec: DataSizeSpec) -> StorageResult<()> {
        if spec.block_size > self.config.max_sync_block_size {
            return Err(StorageError::invalid_args(format!(
                "block size {} exceeds {}",
                spec.block_size, self.config.max_sync_block_size
            )));
        }
        if spec.packet_size == 0 {
            return Err(StorageError::invalid_args("packet size must be positive"));
        }
        Ok(())
    }

    /// Returns the page and whether records remain past it.
    ///
    /// Scans resume one past the last returned timestamp, so a page never
    /// ends inside a run of equal timestamps. A run that does not fit the
    /// limits on its own is returned whole.
    fn read_page(&self, begin: u64, end: u64, spec: DataSizeSpec) -> (Vec<DataItem>, bool) {
        if begin >= end {
            return (Vec::new(), false);
        }
        let records = self.records.read();
        let mut scan = records.range(begin, end).peekable();
        let mut items: Vec<DataItem> = Vec::new();
        let mut total = 0usize;
        while let Some(record) = scan.next() {
            let item = record.sync_copy();
            total = total.saturating_add(estimated_item_size(&item, APPEND_LEN));
            if (total > spec.block_size && !items.is_empty()) || items.len() >= spec.packet_size {
                let boundary = item.timestamp;
                if let Some(index) = items.iter().rposition(|kept| kept.timestamp != boundary) {
                    items.truncate(index + 1);
                    return (items, true);
                }
                items.push(item);
                while let Some(next) = scan.next_if(|next| next.item.timestamp == boundary) {
                    items.push(next.sync_copy());
                }
                return (items, scan.peek().is_some());
            }
            items.push(item);
        }
        (items, false)
    }

    fn apply_sync_items(&self, items: Vec<DataItem>, device: &str) -> usize {
        let source = hash_device_id(device);
        let deny_local = self.config.conflict_policy == ConflictResolvePolicy::DenyOtherDevAmendCurDevData;
        let mut records = self.records.write();
        let mut staged: HashMap<Vec<u8>, StoredRecord> = HashMap::new();
        let mut max_timestamp = 0;
        let mut ignored = 0usize;

        for mut item in items {
            max_timestamp = max_timestamp.max(item.timestamp);
            item.flag &= !LOCAL_FLAG;
            let existing = staged.get(&item.key).or_else(|| records.get(&item.key));
            if deny_local
                && (item.orig_device.is_empty()
                    || existing.is_some_and(|record| record.item.orig_device.is_empty()))
            {
                ignored += 1;
                continue;
            }
            match existing {
                None if item.is_deleted() => continue,
                Some(current) if resolve(&current.item, &item) == ConflictResolution::KeepLocal => {
                    continue
                }
                _ => {}
            }
            staged.insert(
                item.key.clone(),
                StoredRecord {
                    item,
                    source: source.clone(),
                },
            );
        }

        let applied = staged.len();
        for record in staged.into_values() {
            records.insert(record);
        }
        drop(records);
        self.set_max_timestamp(max_timestamp);

        if ignored > 0 {
            warn!(device = %short_device_id(device), ignored, "received records ignored by policy");
        }
        debug!(device = %short_device_id(device), applied, max_timestamp, "sync data saved");
        self.emit(StoreEvent::SyncDataSaved {
            device: device.to_string(),
            applied,
        });
        applied
    }

    fn apply_remove(&self, device: &str, notify: bool) -> usize {
        let hashed = hash_device_id(device);
        let removed = self
            .records
            .write()
            .remove_where(|record| record.source == hashed || record.item.orig_device == hashed);
        info!(device = %short_device_id(device), removed, "device data removed");
        if notify {
            self.emit(StoreEvent::DeviceDataRemoved {
                device: device.to_string(),
                removed,
            });
        }
        removed
    }
}

impl SyncStorage for MemorySyncStore {
    fn get_sync_data(&self, begin: u64, end: u64, spec: DataSizeSpec) -> StorageResult<SyncBatch> {
        self.check_readable()?;
        if begin >= end {
            return Err(StorageError::invalid_args(format!(
                "begin {begin} is not below end {end}"
            )));
        }
        self.check_spec(spec)?;
        let (items, unfinished) = self.read_page(begin, end, spec);
        let token = if unfinished {
            let mut token = self.tokens.issue(begin, end);
            if let Some(last) = items.last() {
                token.advance_past(last.timestamp);
            }
            Some(token)
        } else {
            None
        };
        debug!(begin, end, count = items.len(), unfinished, "sync data read");
        Ok(SyncBatch { items, token })
    }

    fn get_sync_data_next(
        &self,
        token: ContinueToken,
        spec: DataSizeSpec,
    ) -> StorageResult<SyncBatch> {
        if !self.tokens.owns(&token) {
            return Err(StorageError::InvalidToken);
        }
        self.check_readable()?;
        self.check_spec(spec)?;
        let (items, unfinished) = self.read_page(token.begin(), token.end(), spec);
        if !unfinished {
            drop(token);
            return Ok(SyncBatch { items, token: None });
        }
        let Some(last) = items.last() else {
            return Err(StorageError::internal("unfinished scan produced an empty page"));
        };
        let mut token = token;
        token.advance_past(last.timestamp);
        debug!(next = token.begin(), count = items.len(), "sync data continued");
        Ok(SyncBatch {
            items,
            token: Some(token),
        })
    }

    fn put_sync_data(&self, items: Vec<DataItem>, device: &str) -> StorageResult<()> {
        let device = if device.is_empty() {
            UNKNOWN_DEVICE
        } else {
            device
        };
        check_device(device)?;
        for item in &items {
            check_entry(&item.key, &item.value)?;
        }
        match self.engine_state() {
            EngineState::MainDb => {
                self.apply_sync_items(items, device);
                Ok(())
            }
            EngineState::CacheDb => {
                let max = items.iter().map(|item| item.timestamp).max().unwrap_or(0);
                self.push_cache(CachedOp::Sync {
                    device: device.to_string(),
                    items,
                });
                self.set_max_timestamp(max);
                Ok(())
            }
            other => Err(StorageError::busy(other.to_string())),
        }
    }

    fn remove_device_data(&self, device: &str, notify: bool) -> StorageResult<()> {
        if device.is_empty() {
            return Err(StorageError::invalid_args("device id is empty"));
        }
        check_device(device)?;
        match self.engine_state() {
            EngineState::MainDb => {
                self.apply_remove(device, notify);
                Ok(())
            }
            EngineState::CacheDb => {
                self.push_cache(CachedOp::Remove {
                    device: device.to_string(),
                    notify,
                });
                Ok(())
            }
            other => Err(StorageError::busy(other.to_string())),
        }
    }

    fn get_max_timestamp(&self) -> u64 {
        *self.max_timestamp.lock()
    }

    fn set_max_timestamp(&self, timestamp: u64) {
        let mut max = self.max_timestamp.lock();
        if timestamp > *max {
            *max = timestamp;
        }
    }

    fn get_security_option(&self) -> StorageResult<SecurityOption> {
        self.config
            .security_option
            .ok_or_else(|| StorageError::not_support("security label"))
    }

    fn is_readable(&self) -> bool {
        self.engine_state() == EngineState::MainDb
    }

    fn properties(&self) -> StoreProperties {
        self.config.properties.clone()
    }

    fn notify_remote_push_finished(&self, device: &str) {
        debug!(device = %short_device_id(device), "remote push finished");
        self.emit(StoreEvent::RemotePushFinished {
            device: device.to_string(),
        });
    }
}
