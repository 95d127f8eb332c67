use serde::Serialize;

use crate::store::{DataItem, DataKind, StoreError};

/// A store item in the form a persistent backend holds it: opaque bytes
/// plus enough metadata to apply version gating without decoding them.
///
/// Deleted items are stored as placeholders rather than removed, so that
/// version ordering survives across every replica reading the backend; the
/// `deleted` marker and version make a tombstone distinguishable without
/// parsing `serialized_item`.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedItemDescriptor {
    pub version: u64,
    pub deleted: bool,
    pub serialized_item: Vec<u8>,
}

/// A persistent backend for flag data, speaking serialized items.
///
/// Implementations may block on I/O; they are only ever called from the data
/// source's consumer task or from a cache miss. Version gating on `upsert`
/// is the backend's responsibility, typically via an atomic
/// compare-and-set on the stored version.
pub trait PersistentDataStore: Send + Sync {
    /// Overwrites all stored data. Items arrive ordered so that writing
    /// them one at a time never stores a dependent before its dependencies.
    fn init(
        &self,
        data: Vec<(DataKind, Vec<(String, SerializedItemDescriptor)>)>,
    ) -> Result<(), StoreError>;

    /// Reads one item, including tombstone placeholders.
    fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<SerializedItemDescriptor>, StoreError>;

    /// Reads every item of the kind, including tombstone placeholders.
    fn get_all(&self, kind: DataKind)
        -> Result<Vec<(String, SerializedItemDescriptor)>, StoreError>;

    /// Stores the item iff its version is strictly greater than the stored
    /// version. Returns whether the write was applied.
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItemDescriptor,
    ) -> Result<bool, StoreError>;

    /// Whether the backend has ever received a full data set, from this
    /// process or any other sharing it.
    fn initialized(&self) -> Result<bool, StoreError>;
}

#[derive(Serialize)]
struct TombstonePlaceholder<'a> {
    key: &'a str,
    version: u64,
    deleted: bool,
}

fn corrupt(kind: DataKind, key: &str, e: impl ToString) -> StoreError {
    StoreError::Corrupt {
        kind,
        key: key.to_string(),
        reason: e.to_string(),
    }
}

pub(crate) fn serialize_item(
    kind: DataKind,
    key: &str,
    item: &DataItem,
) -> Result<SerializedItemDescriptor, StoreError> {
    let (version, deleted, bytes) = match item {
        DataItem::Flag(flag) => (flag.version, false, serde_json::to_vec(flag)),
        DataItem::Segment(segment) => (segment.version, false, serde_json::to_vec(segment)),
        DataItem::Tombstone(version) => (
            *version,
            true,
            serde_json::to_vec(&TombstonePlaceholder {
                key,
                version: *version,
                deleted: true,
            }),
        ),
    };
    Ok(SerializedItemDescriptor {
        version,
        deleted,
        serialized_item: bytes.map_err(|e| corrupt(kind, key, e))?,
    })
}

pub(crate) fn deserialize_item(
    kind: DataKind,
    key: &str,
    descriptor: &SerializedItemDescriptor,
) -> Result<DataItem, StoreError> {
    if descriptor.deleted {
        return Ok(DataItem::Tombstone(descriptor.version));
    }
    let item = match kind {
        DataKind::Flag => serde_json::from_slice::<crate::Flag>(&descriptor.serialized_item)
            .map(DataItem::from)
            .map_err(|e| corrupt(kind, key, e))?,
        DataKind::Segment => serde_json::from_slice::<crate::Segment>(&descriptor.serialized_item)
            .map(DataItem::from)
            .map_err(|e| corrupt(kind, key, e))?,
    };
    Ok(item)
}
