use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::dependency_sort::sort_all_data;
use crate::persistent::{deserialize_item, serialize_item, PersistentDataStore};
use crate::store::{AllData, DataItem, DataKind, DataStore, StoreError};

// Negative initialized() probes are remembered this long at most, so a
// hammered uninitialized store does not hammer its backend.
const MAX_INITIALIZED_PROBE_TTL: Duration = Duration::from_secs(5);

/// How the wrapper caches reads from its persistent core.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CacheMode {
    /// No caching; every operation reaches the core.
    Off,
    /// Entries expire after the given duration and are re-read from the
    /// core on the next access.
    Ttl(Duration),
    /// Entries never expire. The in-memory view is authoritative once
    /// populated and survives backend outages: writes that fail in the core
    /// are still applied to the cache.
    Infinite,
}

impl CacheMode {
    fn is_enabled(&self) -> bool {
        !matches!(self, CacheMode::Off)
    }

    fn is_infinite(&self) -> bool {
        matches!(self, CacheMode::Infinite)
    }

    fn is_fresh(&self, fetched_at: Instant) -> bool {
        match self {
            CacheMode::Off => false,
            CacheMode::Ttl(ttl) => fetched_at.elapsed() < *ttl,
            CacheMode::Infinite => true,
        }
    }
}

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }
}

type ItemKey = (DataKind, String);

/// A [DataStore] over a persistent core, with an optional read-through /
/// write-through cache in front of it.
///
/// The evaluator and the data source speak live items to this wrapper; the
/// core only ever sees serialized bytes. Failures from the core always
/// propagate to the caller; whether the cache is updated despite a failure
/// depends on the [CacheMode].
pub struct CachingStoreWrapper {
    core: Box<dyn PersistentDataStore>,
    mode: CacheMode,

    items: Mutex<HashMap<ItemKey, CacheEntry<Option<DataItem>>>>,
    snapshots: Mutex<HashMap<DataKind, CacheEntry<HashMap<String, DataItem>>>>,

    // One guard per key so a burst of misses produces a single core fetch.
    item_guards: Mutex<HashMap<ItemKey, Arc<Mutex<()>>>>,
    snapshot_guards: Mutex<HashMap<DataKind, Arc<Mutex<()>>>>,

    initialized: AtomicBool,
    last_initialized_probe: Mutex<Option<Instant>>,
}

impl CachingStoreWrapper {
    pub fn new(core: Box<dyn PersistentDataStore>, mode: CacheMode) -> Self {
        Self {
            core,
            mode,
            items: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            item_guards: Mutex::new(HashMap::new()),
            snapshot_guards: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            last_initialized_probe: Mutex::new(None),
        }
    }

    fn item_guard(&self, kind: DataKind, key: &str) -> Arc<Mutex<()>> {
        self.item_guards
            .lock()
            .entry((kind, key.to_string()))
            .or_default()
            .clone()
    }

    fn snapshot_guard(&self, kind: DataKind) -> Arc<Mutex<()>> {
        self.snapshot_guards
            .lock()
            .entry(kind)
            .or_default()
            .clone()
    }

    // Outer None is a miss; inner None is a cached "does not exist".
    fn cached_item(&self, kind: DataKind, key: &str) -> Option<Option<DataItem>> {
        let mut items = self.items.lock();
        let entry_key = (kind, key.to_string());
        match items.get(&entry_key) {
            Some(entry) if self.mode.is_fresh(entry.fetched_at) => Some(entry.value.clone()),
            Some(_) => {
                items.remove(&entry_key);
                None
            }
            None => None,
        }
    }

    fn cache_item(&self, kind: DataKind, key: &str, value: Option<DataItem>) {
        self.items
            .lock()
            .insert((kind, key.to_string()), CacheEntry::new(value));
    }

    fn cached_snapshot(&self, kind: DataKind) -> Option<HashMap<String, DataItem>> {
        let mut snapshots = self.snapshots.lock();
        match snapshots.get(&kind) {
            Some(entry) if self.mode.is_fresh(entry.fetched_at) => Some(entry.value.clone()),
            Some(_) => {
                snapshots.remove(&kind);
                None
            }
            None => None,
        }
    }

    fn cache_snapshot(&self, kind: DataKind, value: HashMap<String, DataItem>) {
        self.snapshots.lock().insert(kind, CacheEntry::new(value));
    }

    fn invalidate_snapshot(&self, kind: DataKind) {
        self.snapshots.lock().remove(&kind);
    }

    // In infinite mode the cached snapshot is the source of truth, so an
    // upsert edits it in place instead of invalidating it.
    fn patch_snapshot(&self, kind: DataKind, key: &str, item: DataItem) {
        let mut snapshots = self.snapshots.lock();
        if let Some(entry) = snapshots.get_mut(&kind) {
            entry.value.insert(key.to_string(), item);
        }
    }

    fn cache_beaten_by(&self, kind: DataKind, key: &str, version: u64) -> bool {
        match self.cached_item(kind, key) {
            Some(Some(current)) => version > current.version(),
            // a cached miss or no entry at all: the new item wins
            _ => true,
        }
    }

    fn get_from_core(&self, kind: DataKind, key: &str) -> Result<Option<DataItem>, StoreError> {
        match self.core.get(kind, key)? {
            Some(descriptor) => Ok(Some(deserialize_item(kind, key, &descriptor)?)),
            None => Ok(None),
        }
    }

    fn get_all_from_core(&self, kind: DataKind) -> Result<HashMap<String, DataItem>, StoreError> {
        let mut result = HashMap::new();
        for (key, descriptor) in self.core.get_all(kind)? {
            let item = deserialize_item(kind, &key, &descriptor)?;
            result.insert(key, item);
        }
        Ok(result)
    }

    fn refill_cache(&self, sorted: &[(DataKind, Vec<(String, DataItem)>)]) {
        if !self.mode.is_enabled() {
            return;
        }
        let mut items = self.items.lock();
        let mut snapshots = self.snapshots.lock();
        items.clear();
        snapshots.clear();
        for (kind, kind_items) in sorted {
            let mut snapshot = HashMap::with_capacity(kind_items.len());
            for (key, item) in kind_items {
                items.insert((*kind, key.clone()), CacheEntry::new(Some(item.clone())));
                snapshot.insert(key.clone(), item.clone());
            }
            snapshots.insert(*kind, CacheEntry::new(snapshot));
        }
    }

    fn initialized_probe_ttl(&self) -> Duration {
        match self.mode {
            CacheMode::Ttl(ttl) => ttl.min(MAX_INITIALIZED_PROBE_TTL),
            _ => MAX_INITIALIZED_PROBE_TTL,
        }
    }
}

impl DataStore for CachingStoreWrapper {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let sorted = sort_all_data(data);

        let mut serialized = Vec::with_capacity(sorted.len());
        for (kind, kind_items) in &sorted {
            let mut serialized_items = Vec::with_capacity(kind_items.len());
            for (key, item) in kind_items {
                serialized_items.push((key.clone(), serialize_item(*kind, key, item)?));
            }
            serialized.push((*kind, serialized_items));
        }

        match self.core.init(serialized) {
            Ok(()) => {
                self.refill_cache(&sorted);
                self.initialized.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if self.mode.is_infinite() {
                    // serve the intended data from memory while the backend
                    // is down; the error still reaches the caller and the
                    // store does not count as initialized
                    self.refill_cache(&sorted);
                }
                Err(e)
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<DataItem>, StoreError> {
        if !self.mode.is_enabled() {
            return self.get_from_core(kind, key);
        }

        if let Some(hit) = self.cached_item(kind, key) {
            return Ok(hit);
        }

        let guard = self.item_guard(kind, key);
        let _loading = guard.lock();

        // another caller may have loaded it while we waited for the guard
        if let Some(hit) = self.cached_item(kind, key) {
            return Ok(hit);
        }

        let fetched = self.get_from_core(kind, key)?;
        self.cache_item(kind, key, fetched.clone());
        Ok(fetched)
    }

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, DataItem>, StoreError> {
        if !self.mode.is_enabled() {
            return self.get_all_from_core(kind);
        }

        if let Some(hit) = self.cached_snapshot(kind) {
            return Ok(hit);
        }

        let guard = self.snapshot_guard(kind);
        let _loading = guard.lock();

        if let Some(hit) = self.cached_snapshot(kind) {
            return Ok(hit);
        }

        let fetched = self.get_all_from_core(kind)?;
        self.cache_snapshot(kind, fetched.clone());
        Ok(fetched)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: DataItem) -> Result<bool, StoreError> {
        let serialized = serialize_item(kind, key, &item)?;

        let guard = self.item_guard(kind, key);
        let _loading = guard.lock();

        match self.core.upsert(kind, key, serialized) {
            Ok(applied) => {
                if self.mode.is_enabled() {
                    if applied {
                        self.cache_item(kind, key, Some(item.clone()));
                        if self.mode.is_infinite() {
                            self.patch_snapshot(kind, key, item);
                        }
                    }
                    if !self.mode.is_infinite() {
                        // even a version-gated rejection means the backend
                        // knows something this cache does not
                        self.invalidate_snapshot(kind);
                    }
                }
                Ok(applied)
            }
            Err(e) => {
                // with an infinite cache, the in-memory view still moves
                // forward so evaluation reflects the intended write
                if self.mode.is_infinite() && self.cache_beaten_by(kind, key, item.version()) {
                    self.cache_item(kind, key, Some(item.clone()));
                    self.patch_snapshot(kind, key, item);
                }
                Err(e)
            }
        }
    }

    fn initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }

        let mut last_probe = self.last_initialized_probe.lock();
        if let Some(at) = *last_probe {
            if at.elapsed() < self.initialized_probe_ttl() {
                return false;
            }
        }
        *last_probe = Some(Instant::now());

        match self.core.initialized() {
            Ok(true) => {
                self.initialized.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("initialized check against persistent store failed: {}", e);
                false
            }
        }
    }
}
