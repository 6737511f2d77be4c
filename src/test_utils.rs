//! Utilities to support testing.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use n0_future::{
    task::{self, AbortOnDropHandle},
    time::{self, Duration, Instant},
};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::{
    connection::Connection,
    error::{IoSnafu, StorageError},
    protocol::{MessageType, StartupValue, SyncMessage},
    storage::{Keys, StorageArea, StorageChangeSet, StorageSnapshot},
};

/// How long [`wait_until`] waits before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `lastStorageChange` older than [`NEWER_STAMP`].
pub const OLDER_STAMP: &str = "2010-01-01T00:00:00.000Z";

/// A `lastStorageChange` newer than [`OLDER_STAMP`].
pub const NEWER_STAMP: &str = "2020-06-15T12:00:00.000Z";

/// A call made to a [`RecordingStorage`].
#[derive(Debug, Clone, PartialEq)]
pub enum StorageCall {
    /// [`StorageArea::get`] with the selected keys.
    Get(Keys),
    /// [`StorageArea::set`] with the written items.
    Set(StorageSnapshot),
    /// [`StorageArea::remove`] with the deleted keys.
    Remove(Vec<String>),
}

/// A [`StorageArea`] wrapper recording every call, which can be made to fail.
#[derive(Debug, Clone)]
pub struct RecordingStorage<S> {
    inner: S,
    calls: Arc<Mutex<Vec<StorageCall>>>,
    failing: Arc<AtomicBool>,
}

impl<S: StorageArea> RecordingStorage<S> {
    /// Wraps `inner`, initially not failing.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Default::default(),
            failing: Default::default(),
        }
    }

    /// The wrapped storage area.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// All calls so far, failed ones included.
    pub fn calls(&self) -> Vec<StorageCall> {
        self.calls.lock().expect("poisoned").clone()
    }

    /// The items of all `set` calls.
    pub fn sets(&self) -> Vec<StorageSnapshot> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StorageCall::Set(items) => Some(items),
                _ => None,
            })
            .collect()
    }

    /// The keys of all `remove` calls.
    pub fn removes(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StorageCall::Remove(keys) => Some(keys),
                _ => None,
            })
            .collect()
    }

    /// Number of `get` calls reading the whole storage area.
    pub fn full_reads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, StorageCall::Get(Keys::All)))
            .count()
    }

    /// Forgets the calls recorded so far.
    pub fn clear_calls(&self) {
        self.calls.lock().expect("poisoned").clear();
    }

    /// Makes all subsequent calls fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, call: StorageCall, operation: &'static str) -> Result<(), StorageError> {
        self.calls.lock().expect("poisoned").push(call);
        snafu::ensure!(
            !self.failing.load(Ordering::SeqCst),
            IoSnafu {
                operation,
                reason: "injected failure",
            }
        );
        Ok(())
    }
}

impl<S: StorageArea> StorageArea for RecordingStorage<S> {
    async fn get(&self, keys: Keys) -> Result<StorageSnapshot, StorageError> {
        self.record(StorageCall::Get(keys.clone()), "get")?;
        self.inner.get(keys).await
    }

    async fn set(&self, items: StorageSnapshot) -> Result<(), StorageError> {
        self.record(StorageCall::Set(items.clone()), "set")?;
        self.inner.set(items).await
    }

    async fn remove(&self, keys: Vec<String>) -> Result<(), StorageError> {
        self.record(StorageCall::Remove(keys.clone()), "remove")?;
        self.inner.remove(keys).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChangeSet> {
        self.inner.subscribe()
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// If `condition` does not hold within [`WAIT_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        time::sleep(Duration::from_millis(5)).await;
    }
}

/// Answers a message, `None` declines to answer.
pub type Reply = Option<Result<Value, String>>;

/// A fake peer answering the messages it receives according to a script.
#[derive(derive_more::Debug)]
pub struct ScriptedPeer {
    received: Arc<Mutex<Vec<SyncMessage>>>,
    #[debug("AbortOnDropHandle")]
    _task: AbortOnDropHandle<()>,
}

impl ScriptedPeer {
    /// Listens on `connection` for messages addressed to `me`.
    ///
    /// Responses are addressed to `peer`.
    pub fn spawn<C: Connection>(
        connection: &C,
        me: impl Into<String>,
        peer: impl Into<String>,
        script: impl FnMut(&SyncMessage) -> Reply + Send + 'static,
    ) -> Self {
        Self::spawn_holding(connection, me, peer, |_| false, script)
    }

    /// Like [`Self::spawn`], but never answers the messages `hold` selects.
    ///
    /// Their senders wait until they time out or the peer is dropped.
    pub fn spawn_holding<C: Connection>(
        connection: &C,
        me: impl Into<String>,
        peer: impl Into<String>,
        mut hold: impl FnMut(&SyncMessage) -> bool + Send + 'static,
        mut script: impl FnMut(&SyncMessage) -> Reply + Send + 'static,
    ) -> Self {
        let me = me.into();
        let peer = peer.into();
        let mut inbound = connection.subscribe();
        let received: Arc<Mutex<Vec<SyncMessage>>> = Default::default();
        let task = task::spawn({
            let received = received.clone();
            async move {
                let mut held = Vec::new();
                while let Some(inbound) = inbound.recv().await {
                    if inbound.message.target != me {
                        inbound.ignore();
                        continue;
                    }
                    received
                        .lock()
                        .expect("poisoned")
                        .push(inbound.message.clone());
                    if hold(&inbound.message) {
                        held.push(inbound);
                        continue;
                    }
                    let kind = inbound.message.kind;
                    match script(&inbound.message) {
                        Some(result) => {
                            inbound.respond(SyncMessage::response_to(&peer, kind, result))
                        }
                        None => inbound.ignore(),
                    }
                }
            }
        });
        Self {
            received,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// All messages received so far.
    pub fn received(&self) -> Vec<SyncMessage> {
        self.received.lock().expect("poisoned").clone()
    }

    /// The messages of type `kind` received so far.
    pub fn received_of(&self, kind: MessageType) -> Vec<SyncMessage> {
        self.received()
            .into_iter()
            .filter(|message| message.kind == kind)
            .collect()
    }

    /// Number of messages of type `kind` received so far.
    pub fn count(&self, kind: MessageType) -> usize {
        self.received_of(kind).len()
    }
}

/// A script acknowledging every message, serving `snapshot` on `request:full-storage`.
pub fn acknowledge(
    snapshot: StorageSnapshot,
) -> impl FnMut(&SyncMessage) -> Reply + Send + 'static {
    move |message| {
        Some(Ok(match message.kind {
            MessageType::Startup => StartupValue::ready(None).into(),
            MessageType::RequestFullStorage => {
                Value::Object(snapshot.clone().into_iter().collect())
            }
            _ => json!({ "success": true }),
        }))
    }
}
