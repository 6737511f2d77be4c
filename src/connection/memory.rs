//! An in-process [`Connection`] pair.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use n0_future::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::trace;

use super::{Connection, INBOUND_CHANNEL_CAP, InboundMessage};
use crate::{
    error::{DisconnectedSnafu, NoReceiverSnafu, ReplyDroppedSnafu, SendError},
    protocol::SyncMessage,
};

/// Creates two connected ends.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let a = Arc::new(Listeners::default());
    let b = Arc::new(Listeners::default());
    let link = Arc::new(AtomicBool::new(true));
    (
        MemoryConnection {
            local: a.clone(),
            remote: b.clone(),
            link: link.clone(),
        },
        MemoryConnection {
            local: b,
            remote: a,
            link,
        },
    )
}

#[derive(Debug, Default)]
struct Listeners {
    senders: Mutex<Vec<mpsc::Sender<InboundMessage>>>,
}

impl Listeners {
    fn current(&self) -> Vec<mpsc::Sender<InboundMessage>> {
        let mut senders = self.senders.lock().expect("poisoned");
        senders.retain(|sender| !sender.is_closed());
        senders.clone()
    }
}

/// One end of an in-process channel created with [`pair`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    local: Arc<Listeners>,
    remote: Arc<Listeners>,
    link: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Breaks the link, subsequent sends in both directions fail.
    pub fn disconnect(&self) {
        self.link.store(false, Ordering::SeqCst);
    }

    /// Restores the link.
    pub fn reconnect(&self) {
        self.link.store(true, Ordering::SeqCst);
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }

    /// Number of listeners registered on this end.
    pub fn listener_count(&self) -> usize {
        self.local.current().len()
    }
}

impl Connection for MemoryConnection {
    async fn send_message(&self, message: SyncMessage) -> Result<Option<SyncMessage>, SendError> {
        snafu::ensure!(self.is_connected(), DisconnectedSnafu);
        let listeners = self.remote.current();
        snafu::ensure!(!listeners.is_empty(), NoReceiverSnafu);

        trace!(to = %message.target, kind = %message.kind, "send");
        let mut pending = FuturesUnordered::new();
        for listener in listeners {
            let (inbound, reply) = InboundMessage::new(message.clone());
            if listener.send(inbound).await.is_ok() {
                pending.push(reply);
            }
        }
        snafu::ensure!(!pending.is_empty(), NoReceiverSnafu);

        let mut declined = false;
        while let Some(reply) = pending.next().await {
            match reply {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => declined = true,
                Err(_) => {}
            }
        }
        if declined {
            Ok(None)
        } else {
            Err(ReplyDroppedSnafu.build())
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAP);
        self.local.senders.lock().expect("poisoned").push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use n0_future::time::{self, Duration};
    use serde_json::json;

    use super::*;
    use crate::protocol::{LEGACY_SIDE_TARGET, MessageType, WEBEXT_SIDE_TARGET};

    fn ping() -> SyncMessage {
        SyncMessage::new(WEBEXT_SIDE_TARGET, MessageType::Startup, json!({"ready": true}))
    }

    #[tokio::test]
    async fn no_listener_fails() {
        let (a, _b) = pair();
        let err = a.send_message(ping()).await.unwrap_err();
        assert!(matches!(err, SendError::NoReceiver { .. }));
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let (a, b) = pair();
        let mut ignoring = b.subscribe();
        let mut answering = b.subscribe();
        assert_eq!(b.listener_count(), 2);
        tokio::spawn(async move {
            ignoring.recv().await.unwrap().ignore();
        });
        tokio::spawn(async move {
            let inbound = answering.recv().await.unwrap();
            let response = SyncMessage::response_to(
                LEGACY_SIDE_TARGET,
                inbound.message.kind,
                Ok(json!({"ready": true})),
            );
            inbound.respond(response);
        });
        let response = a.send_message(ping()).await.unwrap().unwrap();
        assert_eq!(response.kind, MessageType::StartupResponse);
        assert_eq!(response.target, LEGACY_SIDE_TARGET);
    }

    #[tokio::test]
    async fn silent_listener_does_not_hold_back_answer() {
        let (a, b) = pair();
        let mut silent = b.subscribe();
        let mut answering = b.subscribe();
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let inbound = silent.recv().await.unwrap();
            // keeps the message unanswered until the test ends
            held_tx.send(inbound).ok();
        });
        tokio::spawn(async move {
            let inbound = answering.recv().await.unwrap();
            let response =
                SyncMessage::response_to(LEGACY_SIDE_TARGET, inbound.message.kind, Ok(json!(1)));
            inbound.respond(response);
        });
        let response = time::timeout(Duration::from_secs(1), a.send_message(ping()))
            .await
            .expect("answer held back by a silent listener")
            .unwrap()
            .unwrap();
        assert_eq!(response.value, json!(1));
        drop(held_rx);
    }

    #[tokio::test]
    async fn dropped_listener_is_forgotten() {
        let (a, b) = pair();
        drop(b.subscribe());
        assert_eq!(b.listener_count(), 0);
        assert!(matches!(
            a.send_message(ping()).await,
            Err(SendError::NoReceiver { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_reply_is_an_error() {
        let (a, b) = pair();
        let mut rx = b.subscribe();
        tokio::spawn(async move {
            drop(rx.recv().await);
        });
        assert!(matches!(
            a.send_message(ping()).await,
            Err(SendError::ReplyDropped { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_breaks_both_directions() {
        let (a, b) = pair();
        let _rx_a = a.subscribe();
        let _rx_b = b.subscribe();
        a.disconnect();
        assert!(matches!(
            b.send_message(ping()).await,
            Err(SendError::Disconnected { .. })
        ));
        assert!(!a.is_connected());
        b.reconnect();
        assert!(a.is_connected());
    }
}
