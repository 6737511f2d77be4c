//! The key-value storage areas synchronized by the controllers.
//!
//! Each side owns one [`StorageArea`]. Its contents are a [`StorageSnapshot`], and every
//! mutation produces a [`StorageChangeSet`] on the change subscription.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StorageError;

pub mod memory;
pub mod stamped;

pub use self::memory::MemoryStorage;
pub use self::stamped::StampedStorage;

/// The reserved key recording when a storage area was last mutated.
pub const LAST_STORAGE_CHANGE_KEY: &str = "lastStorageChange";

/// The entire (or a selected part of the) contents of a storage area.
pub type StorageSnapshot = BTreeMap<String, Value>;

/// Changes of a single mutation, by key.
pub type StorageChangeSet = BTreeMap<String, StorageChange>;

/// The change of a single key.
///
/// A present `newValue` (even `null`) is an add or update, an absent one a deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageChange {
    #[serde(
        rename = "oldValue",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    /// The value before the change, if the key existed.
    pub old_value: Option<Value>,
    #[serde(
        rename = "newValue",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    /// The value after the change, `None` for a deletion.
    pub new_value: Option<Value>,
}

impl StorageChange {
    /// A change setting the key to `value`.
    pub fn set(value: impl Into<Value>) -> Self {
        Self {
            old_value: None,
            new_value: Some(value.into()),
        }
    }

    /// A change deleting the key.
    pub fn removed() -> Self {
        Self::default()
    }

    /// Whether this change deletes the key.
    pub fn is_removal(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Maps a present field to `Some`, including an explicit `null`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// A change set split into what has to be written and what has to be deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSummary {
    /// Keys added or updated, with their new values.
    pub keys_to_set: StorageSnapshot,
    /// Keys deleted.
    pub keys_to_remove: Vec<String>,
}

impl ChangeSummary {
    /// Splits a change set received from the peer.
    pub fn from_changes(changes: &StorageChangeSet) -> Self {
        let mut summary = Self::default();
        for (key, change) in changes {
            match &change.new_value {
                Some(value) => {
                    summary.keys_to_set.insert(key.clone(), value.clone());
                }
                None => summary.keys_to_remove.push(key.clone()),
            }
        }
        summary
    }

    /// The changes turning `current` into exactly `snapshot`.
    pub fn replacing(current: &StorageSnapshot, snapshot: StorageSnapshot) -> Self {
        let keys_to_remove = current
            .keys()
            .filter(|key| !snapshot.contains_key(*key))
            .cloned()
            .collect();
        Self {
            keys_to_set: snapshot,
            keys_to_remove,
        }
    }

    /// Whether anything has to be written.
    pub fn has_keys_to_set(&self) -> bool {
        !self.keys_to_set.is_empty()
    }

    /// Whether anything has to be deleted.
    pub fn has_keys_to_remove(&self) -> bool {
        !self.keys_to_remove.is_empty()
    }

    /// Whether applying the summary is a no-op.
    pub fn is_empty(&self) -> bool {
        !self.has_keys_to_set() && !self.has_keys_to_remove()
    }

    /// Applies the summary with at most one `remove` and at most one `set` call.
    pub async fn apply<S: StorageArea>(self, storage: &S) -> Result<(), StorageError> {
        let Self {
            keys_to_set,
            keys_to_remove,
        } = self;
        if !keys_to_remove.is_empty() {
            storage.remove(keys_to_remove).await?;
        }
        if !keys_to_set.is_empty() {
            storage.set(keys_to_set).await?;
        }
        Ok(())
    }
}

/// Selects which keys [`StorageArea::get`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    /// The whole storage area.
    All,
    /// A single key.
    One(String),
    /// Several keys.
    Many(Vec<String>),
}

impl Keys {
    /// Whether `key` is selected.
    pub fn contains(&self, key: &str) -> bool {
        match self {
            Keys::All => true,
            Keys::One(k) => k == key,
            Keys::Many(keys) => keys.iter().any(|k| k == key),
        }
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys::One(key.to_string())
    }
}

/// An asynchronous key-value store with change notifications.
///
/// Implementations must emit one [`StorageChangeSet`] per mutating call to all current
/// subscribers, in the order of the calls.
pub trait StorageArea: Clone + Send + Sync + 'static {
    /// Reads the selected keys. Missing keys are absent from the result.
    fn get(&self, keys: Keys)
    -> impl Future<Output = Result<StorageSnapshot, StorageError>> + Send;

    /// Writes all `items`.
    fn set(&self, items: StorageSnapshot) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Deletes all `keys`.
    fn remove(&self, keys: Vec<String>) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Subscribes to the changes of subsequent mutations.
    fn subscribe(&self) -> broadcast::Receiver<StorageChangeSet>;
}

/// Reads the cached `lastStorageChange` of `storage`.
///
/// A missing, non-string or empty value is treated as "no prior change".
pub async fn read_last_storage_change<S: StorageArea>(
    storage: &S,
) -> Result<Option<String>, StorageError> {
    let mut result = storage.get(LAST_STORAGE_CHANGE_KEY.into()).await?;
    Ok(match result.remove(LAST_STORAGE_CHANGE_KEY) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn change_descriptor_wire_format() {
        let changes: StorageChangeSet = serde_json::from_value(json!({
            "added": {"newValue": 1},
            "nulled": {"newValue": null, "oldValue": 3},
            "removed": {"oldValue": 2},
            "gone": {},
        }))
        .unwrap();
        assert_eq!(changes["added"], StorageChange::set(1));
        assert_eq!(changes["nulled"].new_value, Some(Value::Null));
        assert!(!changes["nulled"].is_removal());
        assert!(changes["removed"].is_removal());
        assert!(changes["gone"].is_removal());

        assert_eq!(
            serde_json::to_value(StorageChange::set("x")).unwrap(),
            json!({"newValue": "x"})
        );
        assert_eq!(serde_json::to_value(StorageChange::removed()).unwrap(), json!({}));
    }

    #[test]
    fn summary_splits_changes() {
        let changes = StorageChangeSet::from([
            ("foo".to_string(), StorageChange::removed()),
            ("baz".to_string(), StorageChange::set(json!(["foo"]))),
        ]);
        let summary = ChangeSummary::from_changes(&changes);
        assert_eq!(summary.keys_to_remove, vec!["foo".to_string()]);
        assert_eq!(
            summary.keys_to_set,
            StorageSnapshot::from([("baz".to_string(), json!(["foo"]))])
        );
        assert!(!summary.is_empty());
        assert!(ChangeSummary::from_changes(&StorageChangeSet::new()).is_empty());
    }

    #[test]
    fn replacing_removes_extra_keys() {
        let current = StorageSnapshot::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]);
        let snapshot = StorageSnapshot::from([("b".to_string(), json!(3))]);
        let summary = ChangeSummary::replacing(&current, snapshot.clone());
        assert_eq!(summary.keys_to_remove, vec!["a".to_string()]);
        assert_eq!(summary.keys_to_set, snapshot);
    }

    #[tokio::test]
    async fn apply_removes_then_sets_once() {
        let storage = MemoryStorage::new(StorageSnapshot::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]));
        let mut changes = storage.subscribe();
        let snapshot = StorageSnapshot::from([
            ("b".to_string(), json!(3)),
            ("c".to_string(), json!(4)),
        ]);
        let summary = ChangeSummary::replacing(&storage.snapshot(), snapshot.clone());
        summary.apply(&storage).await.unwrap();
        assert_eq!(storage.snapshot(), snapshot);

        let removed = changes.try_recv().unwrap();
        assert_eq!(removed.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(removed["a"].is_removal());
        let set = changes.try_recv().unwrap();
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(changes.try_recv().is_err());

        ChangeSummary::default().apply(&storage).await.unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_storage_change_of_storage() {
        let storage = MemoryStorage::default();
        assert_eq!(read_last_storage_change(&storage).await.unwrap(), None);
        storage
            .set(StorageSnapshot::from([(
                LAST_STORAGE_CHANGE_KEY.to_string(),
                json!(""),
            )]))
            .await
            .unwrap();
        assert_eq!(read_last_storage_change(&storage).await.unwrap(), None);
        storage
            .set(StorageSnapshot::from([(
                LAST_STORAGE_CHANGE_KEY.to_string(),
                json!("2010"),
            )]))
            .await
            .unwrap();
        assert_eq!(
            read_last_storage_change(&storage).await.unwrap(),
            Some("2010".to_string())
        );
    }
}
