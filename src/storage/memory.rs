//! An in-memory [`StorageArea`].

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use super::{Keys, StorageArea, StorageChange, StorageChangeSet, StorageSnapshot};
use crate::error::StorageError;

/// Capacity of the change event channel.
const CHANGES_CHANNEL_CAP: usize = 256;

/// A [`StorageArea`] kept in memory.
///
/// Every `set` emits a change for each key passed, whether or not the value differs.
/// Every `remove` emits a change for each key that existed; removing only missing keys
/// emits nothing.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    items: Mutex<StorageSnapshot>,
    changes: broadcast::Sender<StorageChangeSet>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(StorageSnapshot::new())
    }
}

impl MemoryStorage {
    /// Creates a storage area holding `items`.
    pub fn new(items: StorageSnapshot) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CHANNEL_CAP);
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(items),
                changes,
            }),
        }
    }

    /// Returns a copy of the full contents.
    pub fn snapshot(&self) -> StorageSnapshot {
        self.inner.items.lock().expect("poisoned").clone()
    }

    fn emit(&self, changes: StorageChangeSet) {
        if changes.is_empty() {
            return;
        }
        trace!(keys = changes.len(), "storage changed");
        // no subscribers is fine
        self.inner.changes.send(changes).ok();
    }
}

impl StorageArea for MemoryStorage {
    async fn get(&self, keys: Keys) -> Result<StorageSnapshot, StorageError> {
        let items = self.inner.items.lock().expect("poisoned");
        Ok(items
            .iter()
            .filter(|(key, _)| keys.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn set(&self, new_items: StorageSnapshot) -> Result<(), StorageError> {
        let changes = {
            let mut items = self.inner.items.lock().expect("poisoned");
            new_items
                .into_iter()
                .map(|(key, value)| {
                    let old_value = items.insert(key.clone(), value.clone());
                    let change = StorageChange {
                        old_value,
                        new_value: Some(value),
                    };
                    (key, change)
                })
                .collect()
        };
        self.emit(changes);
        Ok(())
    }

    async fn remove(&self, keys: Vec<String>) -> Result<(), StorageError> {
        let changes = {
            let mut items = self.inner.items.lock().expect("poisoned");
            keys.into_iter()
                .filter_map(|key| {
                    let old_value = items.remove(&key)?;
                    let change = StorageChange {
                        old_value: Some(old_value),
                        new_value: None,
                    };
                    Some((key, change))
                })
                .collect()
        };
        self.emit(changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChangeSet> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn get_selects_keys() {
        let storage = MemoryStorage::new(StorageSnapshot::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
            ("c".to_string(), json!(3)),
        ]));
        assert_eq!(storage.get(Keys::All).await.unwrap().len(), 3);
        assert_eq!(
            storage.get("b".into()).await.unwrap(),
            StorageSnapshot::from([("b".to_string(), json!(2))])
        );
        let many = storage
            .get(Keys::Many(vec!["a".into(), "c".into(), "missing".into()]))
            .await
            .unwrap();
        assert_eq!(many.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn mutations_emit_changes() {
        let storage = MemoryStorage::new(StorageSnapshot::from([("a".to_string(), json!(1))]));
        let mut changes = storage.subscribe();

        storage
            .set(StorageSnapshot::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ]))
            .await
            .unwrap();
        let set = changes.recv().await.unwrap();
        assert_eq!(set["a"].old_value, Some(json!(1)));
        assert_eq!(set["a"].new_value, Some(json!(1)));
        assert_eq!(set["b"], StorageChange::set(2));

        storage
            .remove(vec!["a".into(), "missing".into()])
            .await
            .unwrap();
        let removed = changes.recv().await.unwrap();
        assert_eq!(removed.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(removed["a"].is_removal());

        storage.remove(vec!["missing".into()]).await.unwrap();
        assert!(changes.try_recv().is_err());
        assert_eq!(
            storage.snapshot(),
            StorageSnapshot::from([("b".to_string(), json!(2))])
        );
    }
}
