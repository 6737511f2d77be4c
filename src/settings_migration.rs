//! Cleanup of settings written by older versions.
//!
//! Runs once the storage is ready for access, i.e. after the initial sync of the
//! [`SyncController`] if there is one.

use n0_future::task::{self, AbortOnDropHandle};
use serde_json::Value;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    SyncController,
    defer::Observer,
    error::{StorageError, SyncError},
    storage::{Keys, StorageArea, StorageSnapshot},
};

/// Keys which are no longer used.
pub const OBSOLETE_KEYS: &[&str] = &[
    // removed in 0.2.0
    "temporarilyAllowedOrigins",
    "temporarilyAllowedDestinations",
    "temporarilyAllowedOriginsToDestinations",
    // no restoring of browser settings on uninstall anymore
    "prefetch.dns.restoreDefaultOnUninstall",
    "prefetch.link.restoreDefaultOnUninstall",
    "prefetch.preconnections.restoreDefaultOnUninstall",
];

/// Per-kind prefetch settings, merged into [`NETWORK_PREDICTION_KEY`].
pub const OBSOLETE_PREFETCH_KEYS: &[&str] = &[
    "prefetch.link.disableOnStartup",
    "prefetch.dns.disableOnStartup",
    "prefetch.preconnections.disableOnStartup",
];

/// The browser setting replacing the prefetch settings.
pub const NETWORK_PREDICTION_KEY: &str = "browserSettings.disableNetworkPrediction";

/// Migrates the settings in a storage area.
#[derive(Debug, Clone)]
pub struct SettingsMigration<S> {
    storage: S,
    /// Storage readiness and the start of change relaying.
    controller: Option<(Observer<()>, Observer<()>)>,
}

impl<S: StorageArea> SettingsMigration<S> {
    /// Migrates `storage` right away.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            controller: None,
        }
    }

    /// Waits for `controller` to make the storage ready before migrating.
    ///
    /// The migration also waits until the controller relays local changes, so the
    /// peer receives the migrated settings.
    pub fn after(mut self, controller: &SyncController) -> Self {
        self.controller = Some((controller.storage_ready_for_access(), controller.started()));
        self
    }

    /// Runs the migration.
    ///
    /// Both migration steps run even if one fails, the first error is returned.
    pub async fn run(&self) -> Result<(), SyncError> {
        if let Some((storage_ready, started)) = &self.controller {
            storage_ready.wait().await?;
            started.wait().await?;
        }
        let merged = self.merge_prefetch_settings().await;
        if let Err(err) = &merged {
            warn!("failed to merge prefetch settings: {err:#}");
        }
        let removed = self.remove_obsolete_settings().await;
        if let Err(err) = &removed {
            warn!("failed to remove obsolete settings: {err:#}");
        }
        merged?;
        removed?;
        Ok(())
    }

    /// Runs the migration in a task, logging its failure.
    pub fn spawn(self) -> AbortOnDropHandle<()> {
        let task = async move {
            match self.run().await {
                Ok(()) => debug!("settings migrated"),
                Err(err) => warn!("settings migration failed: {err:#}"),
            }
        };
        AbortOnDropHandle::new(task::spawn(
            task.instrument(error_span!("settings-migration")),
        ))
    }

    /// Replaces the per-kind prefetch settings by the single network prediction one.
    ///
    /// Prediction is disabled if any kind was disabled on startup. An existing network
    /// prediction setting wins.
    async fn merge_prefetch_settings(&self) -> Result<(), StorageError> {
        let mut keys: Vec<String> = OBSOLETE_PREFETCH_KEYS
            .iter()
            .map(|k| k.to_string())
            .collect();
        keys.push(NETWORK_PREDICTION_KEY.to_string());
        let values = self.storage.get(Keys::Many(keys)).await?;

        let obsolete: Vec<&Value> = OBSOLETE_PREFETCH_KEYS
            .iter()
            .filter_map(|key| values.get(*key))
            .collect();
        if obsolete.is_empty() {
            return Ok(());
        }
        if !values.contains_key(NETWORK_PREDICTION_KEY) {
            let disable = obsolete.iter().any(|value| is_truthy(value));
            debug!(disable, "merging prefetch settings");
            self.storage
                .set(StorageSnapshot::from([(
                    NETWORK_PREDICTION_KEY.to_string(),
                    Value::Bool(disable),
                )]))
                .await?;
        }
        self.storage
            .remove(OBSOLETE_PREFETCH_KEYS.iter().map(|k| k.to_string()).collect())
            .await
    }

    async fn remove_obsolete_settings(&self) -> Result<(), StorageError> {
        self.storage
            .remove(OBSOLETE_KEYS.iter().map(|k| k.to_string()).collect())
            .await
    }
}

/// Whether a stored setting counts as enabled.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
