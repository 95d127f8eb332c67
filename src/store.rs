use std::collections::HashMap;

use log::warn;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::flag::Flag;
use crate::segment::Segment;

/// The categories of item a data store holds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DataKind {
    Flag,
    Segment,
}

/// One versioned entry in the data store.
///
/// A tombstone is the durable record of a deletion: it keeps the deletion's
/// version visible so an out-of-order update with a lower version cannot
/// resurrect the item.
#[derive(Clone, Debug, PartialEq)]
pub enum DataItem {
    Flag(Flag),
    Segment(Segment),
    Tombstone(u64),
}

impl DataItem {
    /// The version carried by the item, whether live or deleted.
    pub fn version(&self) -> u64 {
        match self {
            DataItem::Flag(f) => f.version,
            DataItem::Segment(s) => s.version,
            DataItem::Tombstone(version) => *version,
        }
    }
}

// Items arriving off the wire with `deleted: true` become tombstones at the
// moment of ingestion.
impl From<Flag> for DataItem {
    fn from(flag: Flag) -> Self {
        if flag.deleted {
            DataItem::Tombstone(flag.version)
        } else {
            DataItem::Flag(flag)
        }
    }
}

impl From<Segment> for DataItem {
    fn from(segment: Segment) -> Self {
        if segment.deleted {
            DataItem::Tombstone(segment.version)
        } else {
            DataItem::Segment(segment)
        }
    }
}

/// A complete ruleset, as delivered by the data source's `put` message.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

/// Failures raised by data stores and their backends.
///
/// The in-memory store never fails; these arise from persistent backends and
/// from decoding what they return.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend reported a failure.
    #[error("store backend error: {0}")]
    Backend(String),
    /// An item read back from storage could not be decoded.
    #[error("stored {kind:?} item {key} could not be decoded: {reason}")]
    Corrupt {
        kind: DataKind,
        key: String,
        reason: String,
    },
}

/// The versioned, queryable store of flags and segments.
///
/// Reads are concurrent; `init` and `upsert` serialize internally. All
/// implementations expose the same observable semantics, whether backed by
/// memory or by a persistent core behind a cache.
pub trait DataStore: Send + Sync {
    /// Atomically replaces the entire contents with the given ruleset.
    /// After the first successful init, [DataStore::initialized] reports
    /// true forever.
    fn init(&self, data: AllData) -> Result<(), StoreError>;

    /// Reads one entry, including tombstones.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<DataItem>, StoreError>;

    /// Snapshots every entry of the kind, including tombstones.
    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, DataItem>, StoreError>;

    /// Applies the item iff its version is strictly greater than the stored
    /// version; a missing entry always loses. Returns whether the write was
    /// applied.
    fn upsert(&self, kind: DataKind, key: &str, item: DataItem) -> Result<bool, StoreError>;

    /// Whether a full ruleset has ever been stored.
    fn initialized(&self) -> bool;
}

/// The read view the evaluator consumes: live flags and segments only, with
/// tombstones filtered out. Lookups are synchronous and must not block.
pub trait Store {
    fn flag(&self, flag_key: &str) -> Option<Flag>;

    fn segment(&self, segment_key: &str) -> Option<Segment>;
}

impl<T: DataStore + ?Sized> Store for T {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        match self.get(DataKind::Flag, flag_key) {
            Ok(Some(DataItem::Flag(flag))) => Some(flag),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to read flag {} during evaluation: {}", flag_key, e);
                None
            }
        }
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        match self.get(DataKind::Segment, segment_key) {
            Ok(Some(DataItem::Segment(segment))) => Some(segment),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "failed to read segment {} during evaluation: {}",
                    segment_key, e
                );
                None
            }
        }
    }
}

/// Borrowed [Store] view over a dynamically-typed data store, for handing a
/// `dyn DataStore` to the evaluator.
pub struct StoreView<'a>(pub &'a dyn DataStore);

impl Store for StoreView<'_> {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.0.flag(flag_key)
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.0.segment(segment_key)
    }
}

#[derive(Default)]
struct MemoryState {
    flags: HashMap<String, DataItem>,
    segments: HashMap<String, DataItem>,
    initialized: bool,
}

impl MemoryState {
    fn items(&self, kind: DataKind) -> &HashMap<String, DataItem> {
        match kind {
            DataKind::Flag => &self.flags,
            DataKind::Segment => &self.segments,
        }
    }

    fn items_mut(&mut self, kind: DataKind) -> &mut HashMap<String, DataItem> {
        match kind {
            DataKind::Flag => &mut self.flags,
            DataKind::Segment => &mut self.segments,
        }
    }
}

/// The default data store: everything in process memory under a
/// reader-writer lock.
#[derive(Default)]
pub struct InMemoryDataStore {
    state: RwLock<MemoryState>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.flags = data
            .flags
            .into_iter()
            .map(|(key, flag)| (key, DataItem::from(flag)))
            .collect();
        state.segments = data
            .segments
            .into_iter()
            .map(|(key, segment)| (key, DataItem::from(segment)))
            .collect();
        state.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<DataItem>, StoreError> {
        Ok(self.state.read().items(kind).get(key).cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, DataItem>, StoreError> {
        Ok(self.state.read().items(kind).clone())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: DataItem) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let items = state.items_mut(kind);
        match items.get(key) {
            Some(existing) if existing.version() >= item.version() => Ok(false),
            _ => {
                items.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    fn initialized(&self) -> bool {
        self.state.read().initialized
    }
}
