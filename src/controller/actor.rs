//! The sync actor: everything a controller sends to its peer.

use std::sync::Arc;

use n0_future::{
    task::{self, AbortOnDropHandle},
    time::{self, Instant},
};
use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace, warn};

use super::{
    ACTOR_CHANNEL_CAP, InitialSyncState, Shared,
    inbound::{InboundHandler, replace_storage},
};
use crate::{
    config::Role,
    connection::Connection,
    error::{SendError, SyncError, TimeoutSnafu},
    protocol::{MessageType, StartupValue, SyncMessage, check_response},
    storage::{Keys, StorageArea, StorageChangeSet, StorageSnapshot, read_last_storage_change},
};

/// Messages from the inbound task to the sync actor.
#[derive(Debug, strum::Display)]
pub(super) enum ToSyncActor {
    /// The decider heard the peer, perform the initial sync.
    InitialSync { pull: bool },
    /// The decider announced itself, announce ourselves in return.
    Announce,
    /// The responder finished its part of the initial sync.
    InitialSyncDone,
}

/// Runs a controller until the inbound channel or the change subscription closes.
pub(super) async fn run<S, C, F>(
    shared: Arc<Shared>,
    storage: S,
    connection: F,
    cancel: CancellationToken,
) where
    S: StorageArea,
    C: Connection,
    F: Future<Output = Result<C, SendError>> + Send + 'static,
{
    let last_storage_change = match read_last_storage_change(&storage).await {
        Ok(value) => value,
        Err(err) => {
            warn!("failed to read lastStorageChange, assuming none: {err:#}");
            None
        }
    };
    debug!(?last_storage_change, "read local storage state");
    shared.set_last_storage_change(last_storage_change);

    let connection = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("shutdown before connecting");
            return;
        }
        connection = connection => match connection {
            Ok(connection) => connection,
            Err(err) => {
                error!("failed to connect to the peer: {err:#}");
                return;
            }
        },
    };

    let (to_actor, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
    let inbound = InboundHandler::new(
        shared.clone(),
        storage.clone(),
        connection.subscribe(),
        to_actor,
    );
    let _inbound_task = AbortOnDropHandle::new(task::spawn(inbound.run().in_current_span()));

    let mut actor = SyncActor {
        shared,
        storage,
        connection,
        inbox,
        cancel,
    };
    actor.run().await;
}

struct SyncActor<S, C> {
    shared: Arc<Shared>,
    storage: S,
    connection: C,
    inbox: mpsc::Receiver<ToSyncActor>,
    cancel: CancellationToken,
}

impl<S: StorageArea, C: Connection> SyncActor<S, C> {
    async fn run(&mut self) {
        if !self.run_initial_sync().await {
            return;
        }
        self.relay_changes().await;
    }

    /// Announces ourselves and drives the initial sync.
    ///
    /// Returns `false` if the controller is shutting down.
    async fn run_initial_sync(&mut self) -> bool {
        let retry_interval = self.shared.config.startup_retry_interval;
        let mut announcements = 1;
        let mut next_announcement = None;
        let mut announcing = Some(self.spawn_announcement());
        self.shared.waiting_for_peer.resolve(());

        while self.shared.initial_sync_state() != InitialSyncState::Done {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("shutdown during initial sync");
                    return false;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbound task stopped, shutdown");
                        return false;
                    };
                    trace!(%msg, "tick: inbox");
                    match msg {
                        ToSyncActor::InitialSync { pull } => self.initial_sync(pull).await,
                        ToSyncActor::Announce => {
                            if self.shared.initial_sync_state() == InitialSyncState::NotStarted {
                                next_announcement = None;
                                announcing = Some(self.spawn_announcement());
                            }
                        }
                        ToSyncActor::InitialSyncDone => {}
                    }
                }
                acknowledged = announced(&mut announcing) => {
                    trace!(acknowledged, "tick: announcement");
                    announcing = None;
                    if !acknowledged
                        && self.shared.config.role == Role::Responder
                        && announcements < self.shared.config.retry.max_attempts
                    {
                        next_announcement = Some(Instant::now() + retry_interval);
                    }
                }
                _ = wait_for(next_announcement) => {
                    next_announcement = None;
                    if self.shared.initial_sync_state() != InitialSyncState::NotStarted {
                        continue;
                    }
                    announcements += 1;
                    announcing = Some(self.spawn_announcement());
                }
            }
        }
        true
    }

    /// Relays local changes until shutdown.
    async fn relay_changes(&mut self) {
        let mut changes = self.shared.start_relaying(&self.storage).await;
        self.shared.started.resolve(());
        debug!("relaying local storage changes");

        let mut inbox_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("shutdown");
                    break;
                }
                msg = self.inbox.recv(), if inbox_open => match msg {
                    Some(msg) => trace!(%msg, "ignoring message after initial sync"),
                    None => inbox_open = false,
                },
                event = changes.recv() => match event {
                    Ok(changes) => {
                        let changes = self.shared.filter_echoes(changes);
                        if changes.is_empty() {
                            trace!("suppressed echo of a remote change");
                            continue;
                        }
                        self.on_local_change(changes).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed local storage changes, sending full storage");
                        self.shared.set_should_send_full_storage(true);
                        self.push_full_storage_with_retry().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("storage change subscription closed, shutdown");
                        break;
                    }
                },
            }
        }
    }

    async fn on_local_change(&self, changes: StorageChangeSet) {
        if !self.shared.storage_ready.is_fulfilled() {
            warn!("storage changed while not ready for access");
        }
        if self.shared.should_send_full_storage() {
            self.push_full_storage_with_retry().await;
            return;
        }
        debug!(keys = ?changes.keys().collect::<Vec<_>>(), "sending storage changes");
        let value = serde_json::to_value(&changes).expect("change sets always serialize");
        match self.request(MessageType::StorageChanges, value).await {
            Ok(_) => trace!("storage changes sent"),
            Err(err) => {
                warn!("failed to send storage changes, falling back to full storage: {err:#}");
                self.shared.set_should_send_full_storage(true);
                self.push_full_storage_with_retry().await;
            }
        }
    }

    async fn initial_sync(&self, pull: bool) {
        let direction = if pull { "pull" } else { "push" };
        debug!(direction, "initial storage sync");
        if !pull {
            self.shared.storage_ready.resolve(());
        }
        let result = if pull {
            self.pull_full_storage().await
        } else {
            self.push_full_storage().await
        };
        match result {
            Ok(()) => {
                debug!(direction, "initial storage sync done");
                if pull {
                    self.shared.storage_ready.resolve(());
                }
            }
            Err(err) => {
                error!(direction, "initial storage sync failed: {err:#}");
                if pull {
                    self.shared
                        .storage_ready
                        .reject(format!("failed to pull the peer's storage: {err}"));
                }
            }
        }
        self.shared.finish_initial_sync();
    }

    /// Sends our `startup` from a separate task, so the inbox is served meanwhile.
    fn spawn_announcement(&self) -> AbortOnDropHandle<bool> {
        let shared = self.shared.clone();
        let connection = self.connection.clone();
        let task = task::spawn(
            async move { announce(&shared, &connection).await }.in_current_span(),
        );
        AbortOnDropHandle::new(task)
    }

    async fn pull_full_storage(&self) -> Result<(), SyncError> {
        let response = self
            .request(MessageType::RequestFullStorage, Value::Null)
            .await?;
        let snapshot: StorageSnapshot = response.parse_value()?;
        debug!(keys = snapshot.len(), "received full storage");
        replace_storage(&self.shared, &self.storage, snapshot).await?;
        self.shared.set_should_send_full_storage(false);
        Ok(())
    }

    async fn push_full_storage(&self) -> Result<(), SyncError> {
        let snapshot = self.storage.get(Keys::All).await?;
        debug!(keys = snapshot.len(), "sending full storage");
        self.request(
            MessageType::FullStorage,
            Value::Object(snapshot.into_iter().collect()),
        )
        .await?;
        self.shared.set_should_send_full_storage(false);
        Ok(())
    }

    /// Pushes the full storage, retrying with backoff.
    ///
    /// Leaves [`Shared::should_send_full_storage`] set if all attempts fail.
    async fn push_full_storage_with_retry(&self) {
        let mut backoff = self.shared.config.retry.backoff();
        loop {
            let err = match self.push_full_storage().await {
                Ok(()) => {
                    debug!("full storage sent");
                    return;
                }
                Err(err) => err,
            };
            let Some(delay) = backoff.next() else {
                error!("failed to send full storage, giving up until the next change: {err:#}");
                return;
            };
            warn!(?delay, "failed to send full storage, retrying: {err:#}");
            time::sleep(delay).await;
        }
    }

    async fn request(&self, kind: MessageType, value: Value) -> Result<SyncMessage, SyncError> {
        request(&self.shared, &self.connection, kind, value).await
    }
}

/// Sends a message to the peer and validates its response.
async fn request<C: Connection>(
    shared: &Shared,
    connection: &C,
    kind: MessageType,
    value: Value,
) -> Result<SyncMessage, SyncError> {
    let message = SyncMessage::new(&shared.config.peer, kind, value);
    let timeout = shared.config.request_timeout;
    let response = time::timeout(timeout, connection.send_message(message))
        .await
        .context(TimeoutSnafu { timeout })??;
    let response = check_response(response, &shared.config.me, kind)?;
    Ok(response)
}

/// Sends our `startup`. Returns whether the peer acknowledged it.
async fn announce<C: Connection>(shared: &Shared, connection: &C) -> bool {
    let value = StartupValue::ready(shared.last_storage_change());
    match request(shared, connection, MessageType::Startup, value.into()).await {
        Ok(_) => {
            debug!("peer acknowledged startup");
            true
        }
        Err(err) => {
            debug!("startup announcement failed: {err:#}");
            false
        }
    }
}

/// Resolves with the outcome of the announcement in flight, never if there is none.
async fn announced(announcing: &mut Option<AbortOnDropHandle<bool>>) -> bool {
    match announcing {
        Some(handle) => handle.await.unwrap_or(false),
        None => std::future::pending().await,
    }
}

/// Resolves at `deadline`, never if there is none.
async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
