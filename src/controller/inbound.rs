//! The inbound task: answers the messages the peer sends us.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{InitialSyncState, Shared, actor::ToSyncActor};
use crate::{
    config::Role,
    connection::InboundMessage,
    error::{StorageError, SyncError, UnexpectedTypeSnafu},
    protocol::{MessageType, StartupValue, SyncMessage, is_pull},
    storage::{ChangeSummary, Keys, StorageArea, StorageChangeSet, StorageSnapshot},
};

/// Overwrites `storage` with exactly `snapshot`.
///
/// Keys missing from `snapshot` are removed first.
pub(super) async fn replace_storage<S: StorageArea>(
    shared: &Shared,
    storage: &S,
    snapshot: StorageSnapshot,
) -> Result<(), StorageError> {
    let current = storage.get(Keys::All).await?;
    let summary = ChangeSummary::replacing(&current, snapshot);
    shared.apply_remote(storage, summary).await
}

pub(super) struct InboundHandler<S> {
    shared: Arc<Shared>,
    storage: S,
    inbound: mpsc::Receiver<InboundMessage>,
    to_actor: mpsc::Sender<ToSyncActor>,
}

impl<S: StorageArea> InboundHandler<S> {
    pub(super) fn new(
        shared: Arc<Shared>,
        storage: S,
        inbound: mpsc::Receiver<InboundMessage>,
        to_actor: mpsc::Sender<ToSyncActor>,
    ) -> Self {
        Self {
            shared,
            storage,
            inbound,
            to_actor,
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(inbound) = self.inbound.recv().await {
            if inbound.message.target != self.shared.config.me {
                inbound.ignore();
                continue;
            }
            let kind = inbound.message.kind;
            trace!(%kind, "received message");
            let result = self.handle(&inbound.message).await;
            if let Err(err) = &result {
                warn!(%kind, "failed to handle message: {err:#}");
            }
            let response = SyncMessage::response_to(
                &self.shared.config.peer,
                kind,
                result.map_err(|err| err.to_string()),
            );
            inbound.respond(response);
        }
        debug!("inbound channel closed");
    }

    async fn handle(&mut self, message: &SyncMessage) -> Result<Value, SyncError> {
        match message.kind {
            MessageType::Startup => self.on_startup(message).await,
            MessageType::RequestFullStorage => self.on_request_full_storage().await,
            MessageType::FullStorage => self.on_full_storage(message).await,
            MessageType::StorageChanges => self.on_storage_changes(message).await,
            kind => Err(UnexpectedTypeSnafu { kind }.build().into()),
        }
    }

    async fn on_startup(&mut self, message: &SyncMessage) -> Result<Value, SyncError> {
        let startup = StartupValue::from_message(message)?;
        match self.shared.config.role {
            Role::Decider => {
                if self.shared.try_start_initial_sync() {
                    let local = self.shared.last_storage_change();
                    let pull = is_pull(local.as_deref(), startup.last_storage_change.as_deref());
                    debug!(
                        ?local,
                        peer = ?startup.last_storage_change,
                        pull,
                        "peer is ready"
                    );
                    self.to_actor
                        .send(ToSyncActor::InitialSync { pull })
                        .await
                        .ok();
                } else {
                    debug!(
                        state = %self.shared.initial_sync_state(),
                        "ignoring repeated startup"
                    );
                }
            }
            Role::Responder => {
                if self.shared.initial_sync_state() == InitialSyncState::NotStarted {
                    self.to_actor.send(ToSyncActor::Announce).await.ok();
                }
            }
        }
        Ok(StartupValue::ready(None).into())
    }

    async fn on_request_full_storage(&mut self) -> Result<Value, SyncError> {
        let initial = self.begin_initial_transfer();
        let result = self.storage.get(Keys::All).await;
        if result.is_ok() {
            self.shared.set_should_send_full_storage(false);
        }
        if initial {
            self.end_initial_transfer(result.is_ok()).await;
        }
        let snapshot = result?;
        debug!(keys = snapshot.len(), "sending full storage on request");
        Ok(Value::Object(snapshot.into_iter().collect()))
    }

    async fn on_full_storage(&mut self, message: &SyncMessage) -> Result<Value, SyncError> {
        let snapshot: StorageSnapshot = message.parse_value()?;
        debug!(keys = snapshot.len(), "received full storage");
        let initial = self.begin_initial_transfer();
        let result = replace_storage(&self.shared, &self.storage, snapshot).await;
        if result.is_ok() {
            self.shared.set_should_send_full_storage(false);
        }
        if initial {
            self.end_initial_transfer(result.is_ok()).await;
        }
        result?;
        Ok(json!({ "success": true }))
    }

    async fn on_storage_changes(&mut self, message: &SyncMessage) -> Result<Value, SyncError> {
        let changes: StorageChangeSet = message.parse_value()?;
        if self.shared.initial_sync_state() == InitialSyncState::Started {
            debug!("waiting for the initial sync before applying changes");
            self.shared.initial_sync_done.wait().await.ok();
        }
        let summary = ChangeSummary::from_changes(&changes);
        trace!(
            set = summary.keys_to_set.len(),
            remove = summary.keys_to_remove.len(),
            "applying storage changes"
        );
        self.shared.apply_remote(&self.storage, summary).await?;
        Ok(json!({ "success": true }))
    }

    /// Starts the responder's initial sync, if this transfer is it.
    fn begin_initial_transfer(&self) -> bool {
        self.shared.config.role == Role::Responder && self.shared.try_start_initial_sync()
    }

    async fn end_initial_transfer(&self, storage_ready: bool) {
        if storage_ready {
            self.shared.storage_ready.resolve(());
        } else {
            self.shared
                .storage_ready
                .reject("initial full-storage transfer failed");
        }
        self.shared.finish_initial_sync();
        debug!("initial storage sync done");
        self.to_actor.send(ToSyncActor::InitialSyncDone).await.ok();
    }
}
