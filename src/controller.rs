//! The storage synchronization controller.
//!
//! A [`SyncController`] runs on each side of the connection. Both are the same type,
//! their [`Role`] decides who picks the direction of the initial transfer:
//!
//! - The [`Role::Decider`] waits for the peer's `startup`, compares the
//!   `lastStorageChange` stamps and then pulls or pushes the full storage.
//! - The [`Role::Responder`] announces itself until the decider hears it, and is done
//!   with its initial sync once it answered the decider's `request:full-storage` or
//!   applied its `full-storage`.
//!
//! After the initial sync both sides relay their local changes as `storage-changes`.
//! If relaying a change fails, the controller falls back to sending its full storage,
//! see [`SyncController::should_send_full_storage`].
//!
//! Each controller runs two tasks. The inbound task answers the peer's messages, the
//! sync actor sends ours. Keeping them apart lets both sides send at the same time
//! without waiting on each other's responses.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use n0_future::task::{self, AbortOnDropHandle};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span};

use crate::{
    config::{Role, SyncConfig},
    connection::Connection,
    defer::{Deferred, Observer},
    error::{SendError, StorageError},
    storage::{ChangeSummary, StorageArea, StorageChangeSet},
};

mod actor;
mod inbound;

/// Capacity of the channel from the inbound task to the sync actor.
const ACTOR_CHANNEL_CAP: usize = 16;

/// Progress of the initial full-storage transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum InitialSyncState {
    /// No `startup` was processed yet.
    #[strum(serialize = "not started")]
    NotStarted,
    /// The full-storage transfer is in flight.
    #[strum(serialize = "started")]
    Started,
    /// The transfer settled, successfully or not.
    #[strum(serialize = "done")]
    Done,
}

/// State shared by the handle and both tasks of a controller.
#[derive(Debug)]
struct Shared {
    config: SyncConfig,
    initial_sync: Mutex<InitialSyncState>,
    should_send_full_storage: AtomicBool,
    last_storage_change: Mutex<Option<String>>,
    /// Set once the sync actor subscribed to local changes.
    relaying: AtomicBool,
    /// Held while applying the peer's changes and while subscribing to local changes.
    remote_apply: tokio::sync::Mutex<()>,
    /// Changes we applied on behalf of the peer, which must not be relayed back.
    ///
    /// `None` is an expected removal.
    echoes: Mutex<HashMap<String, Option<Value>>>,
    waiting_for_peer: Deferred<()>,
    storage_ready: Deferred<()>,
    initial_sync_done: Deferred<()>,
    started: Deferred<()>,
}

impl Shared {
    fn new(config: SyncConfig) -> Self {
        Self {
            config,
            initial_sync: Mutex::new(InitialSyncState::NotStarted),
            should_send_full_storage: AtomicBool::new(true),
            last_storage_change: Mutex::new(None),
            relaying: AtomicBool::new(false),
            remote_apply: tokio::sync::Mutex::new(()),
            echoes: Mutex::new(HashMap::new()),
            waiting_for_peer: Deferred::new(),
            storage_ready: Deferred::new(),
            initial_sync_done: Deferred::new(),
            started: Deferred::new(),
        }
    }

    fn initial_sync_state(&self) -> InitialSyncState {
        *self.initial_sync.lock().expect("poisoned")
    }

    /// Moves from [`InitialSyncState::NotStarted`] to [`InitialSyncState::Started`].
    ///
    /// Returns `false` if the initial sync was started before.
    fn try_start_initial_sync(&self) -> bool {
        let mut state = self.initial_sync.lock().expect("poisoned");
        if *state != InitialSyncState::NotStarted {
            return false;
        }
        *state = InitialSyncState::Started;
        true
    }

    fn finish_initial_sync(&self) {
        *self.initial_sync.lock().expect("poisoned") = InitialSyncState::Done;
        self.initial_sync_done.resolve(());
    }

    fn should_send_full_storage(&self) -> bool {
        self.should_send_full_storage.load(Ordering::SeqCst)
    }

    fn set_should_send_full_storage(&self, value: bool) {
        self.should_send_full_storage.store(value, Ordering::SeqCst);
    }

    fn last_storage_change(&self) -> Option<String> {
        self.last_storage_change.lock().expect("poisoned").clone()
    }

    fn set_last_storage_change(&self, value: Option<String>) {
        *self.last_storage_change.lock().expect("poisoned") = value;
    }

    /// Subscribes to local changes and starts recording echoes.
    ///
    /// Never overlaps with [`Self::apply_remote`], so every change of a remote apply seen
    /// by the subscription has its echo recorded.
    async fn start_relaying<S: StorageArea>(
        &self,
        storage: &S,
    ) -> broadcast::Receiver<StorageChangeSet> {
        let _guard = self.remote_apply.lock().await;
        let changes = storage.subscribe();
        self.relaying.store(true, Ordering::SeqCst);
        changes
    }

    /// Applies changes on behalf of the peer.
    async fn apply_remote<S: StorageArea>(
        &self,
        storage: &S,
        summary: ChangeSummary,
    ) -> Result<(), StorageError> {
        let _guard = self.remote_apply.lock().await;
        self.expect_echoes(&summary);
        summary.apply(storage).await
    }

    /// Records the changes `summary` is about to cause, so they are not relayed back.
    fn expect_echoes(&self, summary: &ChangeSummary) {
        if !self.relaying.load(Ordering::SeqCst) {
            return;
        }
        let mut echoes = self.echoes.lock().expect("poisoned");
        for (key, value) in &summary.keys_to_set {
            echoes.insert(key.clone(), Some(value.clone()));
        }
        for key in &summary.keys_to_remove {
            echoes.insert(key.clone(), None);
        }
    }

    /// Drops the changes which only echo what the peer sent us.
    ///
    /// Each expected echo is consumed by the first change of its key.
    fn filter_echoes(&self, mut changes: StorageChangeSet) -> StorageChangeSet {
        let mut echoes = self.echoes.lock().expect("poisoned");
        if echoes.is_empty() {
            return changes;
        }
        changes.retain(|key, change| match echoes.remove(key) {
            Some(expected) => expected != change.new_value,
            None => true,
        });
        changes
    }
}

/// Handle to a running storage synchronization controller.
///
/// Cloning the handle is cheap. The controller stops when the last clone is dropped or
/// on [`SyncController::shutdown`].
#[derive(derive_more::Debug, Clone)]
pub struct SyncController {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    #[debug("AbortOnDropHandle")]
    _task: Arc<AbortOnDropHandle<()>>,
}

impl SyncController {
    /// Spawns a controller syncing `storage` over the eventual `connection`.
    ///
    /// Must be called from within a tokio runtime. `storage` must be the raw storage
    /// area, not a [`crate::storage::StampedStorage`] around it, or every applied remote
    /// change would be stamped as a local one.
    pub fn spawn<S, C, F>(config: SyncConfig, storage: S, connection: F) -> Self
    where
        S: StorageArea,
        C: Connection,
        F: Future<Output = Result<C, SendError>> + Send + 'static,
    {
        let shared = Arc::new(Shared::new(config));
        let cancel = CancellationToken::new();
        let span = error_span!(
            "storage-sync",
            me = %shared.config.me,
            role = %shared.config.role,
        );
        let task = task::spawn(
            actor::run(shared.clone(), storage, connection, cancel.clone()).instrument(span),
        );
        Self {
            shared,
            cancel,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        }
    }

    /// Spawns a controller over an already established `connection`.
    pub fn spawn_connected<S, C>(config: SyncConfig, storage: S, connection: C) -> Self
    where
        S: StorageArea,
        C: Connection,
    {
        Self::spawn(config, storage, async move { Ok(connection) })
    }

    /// Our identity on the connection.
    pub fn me(&self) -> &str {
        &self.shared.config.me
    }

    /// Our part in the protocol.
    pub fn role(&self) -> Role {
        self.shared.config.role
    }

    /// The configuration the controller was spawned with.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Fulfilled once our `startup` announcement was sent for the first time, whether
    /// the peer received it or not.
    pub fn waiting_for_peer(&self) -> Observer<()> {
        self.shared.waiting_for_peer.observer()
    }

    /// Fulfilled once the local storage holds the synchronized contents.
    ///
    /// Rejected if the initial pull from the peer failed.
    pub fn storage_ready_for_access(&self) -> Observer<()> {
        self.shared.storage_ready.observer()
    }

    /// Whether [`Self::storage_ready_for_access`] is fulfilled.
    pub fn is_storage_ready_for_access(&self) -> bool {
        self.shared.storage_ready.is_fulfilled()
    }

    /// Fulfilled once the initial transfer finished, successfully or not.
    pub fn initial_sync_done(&self) -> Observer<()> {
        self.shared.initial_sync_done.observer()
    }

    /// Fulfilled once local changes are being relayed to the peer.
    pub fn started(&self) -> Observer<()> {
        self.shared.started.observer()
    }

    /// Progress of the initial transfer.
    pub fn initial_sync_state(&self) -> InitialSyncState {
        self.shared.initial_sync_state()
    }

    /// Whether the next local change is sent as full storage instead of as a change.
    ///
    /// Set initially and after any failed transfer, cleared by every successful
    /// full-storage transfer.
    pub fn should_send_full_storage(&self) -> bool {
        self.shared.should_send_full_storage()
    }

    /// The `lastStorageChange` read from the local storage at startup.
    pub fn last_storage_change(&self) -> Option<String> {
        self.shared.last_storage_change()
    }

    /// Stops both tasks of the controller.
    ///
    /// Pending readiness signals stay pending.
    pub fn shutdown(&self) {
        debug!(me = %self.shared.config.me, "shutting down storage sync");
        self.cancel.cancel();
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
