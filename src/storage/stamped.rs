//! A [`StorageArea`] wrapper maintaining `lastStorageChange`.
//!
//! Application code writes settings through [`StampedStorage`], so every write also
//! records when it happened. The controllers compare these stamps to decide the sync
//! direction, and must be given the wrapped storage area to not stamp remote writes.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Keys, LAST_STORAGE_CHANGE_KEY, StorageArea, StorageChangeSet, StorageSnapshot};
use crate::{error::StorageError, protocol::now_timestamp};

/// Stamps `lastStorageChange` on every mutation of the wrapped storage area.
#[derive(Debug, Clone)]
pub struct StampedStorage<S> {
    inner: S,
}

impl<S: StorageArea> StampedStorage<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped storage area, which does not stamp.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: StorageArea> StorageArea for StampedStorage<S> {
    async fn get(&self, keys: Keys) -> Result<StorageSnapshot, StorageError> {
        self.inner.get(keys).await
    }

    /// Writes `items` together with a fresh `lastStorageChange`, unless `items` already
    /// carries one.
    async fn set(&self, mut items: StorageSnapshot) -> Result<(), StorageError> {
        if !items.contains_key(LAST_STORAGE_CHANGE_KEY) {
            let now = now_timestamp();
            debug!(%now, keys = items.len(), "stamping storage change");
            items.insert(LAST_STORAGE_CHANGE_KEY.to_string(), Value::String(now));
        }
        self.inner.set(items).await
    }

    /// Deletes `keys`, then stamps `lastStorageChange`.
    async fn remove(&self, keys: Vec<String>) -> Result<(), StorageError> {
        if keys.iter().any(|key| key == LAST_STORAGE_CHANGE_KEY) {
            return self.inner.remove(keys).await;
        }
        self.inner.remove(keys).await?;
        let stamp = StorageSnapshot::from([(
            LAST_STORAGE_CHANGE_KEY.to_string(),
            Value::String(now_timestamp()),
        )]);
        self.inner.set(stamp).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChangeSet> {
        self.inner.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        protocol::parse_timestamp,
        storage::{MemoryStorage, read_last_storage_change},
    };

    #[tokio::test]
    async fn set_and_remove_are_stamped() {
        let raw = MemoryStorage::default();
        let storage = StampedStorage::new(raw.clone());

        storage
            .set(StorageSnapshot::from([("foo".to_string(), json!("bar"))]))
            .await
            .unwrap();
        let first = read_last_storage_change(&raw).await.unwrap().unwrap();
        assert!(parse_timestamp(&first).is_some());
        assert_eq!(raw.snapshot()["foo"], json!("bar"));

        raw.set(StorageSnapshot::from([(
            LAST_STORAGE_CHANGE_KEY.to_string(),
            json!("2010"),
        )]))
        .await
        .unwrap();
        storage.remove(vec!["foo".into()]).await.unwrap();
        let second = read_last_storage_change(&raw).await.unwrap().unwrap();
        assert_ne!(second, "2010");
        assert!(!raw.snapshot().contains_key("foo"));
    }

    #[tokio::test]
    async fn explicit_stamp_is_kept() {
        let raw = MemoryStorage::default();
        let storage = StampedStorage::new(raw.clone());
        storage
            .set(StorageSnapshot::from([(
                LAST_STORAGE_CHANGE_KEY.to_string(),
                json!("2010"),
            )]))
            .await
            .unwrap();
        assert_eq!(storage.inner().snapshot()[LAST_STORAGE_CHANGE_KEY], json!("2010"));
    }
}
