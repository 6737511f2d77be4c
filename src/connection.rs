//! The message channel between the two execution contexts.
//!
//! A [`Connection`] is a best-effort request/response bridge. Sending returns the first
//! response any listener on the other end produced; the send fails if nobody on the
//! other end is listening yet.

use tokio::sync::{mpsc, oneshot};

use crate::{error::SendError, protocol::SyncMessage};

pub mod memory;

/// Capacity of the inbound message channel of a single listener.
pub const INBOUND_CHANNEL_CAP: usize = 64;

/// A message received from the peer, waiting for its response.
#[derive(Debug)]
pub struct InboundMessage {
    /// The received message.
    pub message: SyncMessage,
    reply: oneshot::Sender<Option<SyncMessage>>,
}

impl InboundMessage {
    /// Creates an inbound message and the receiver of its response.
    pub fn new(message: SyncMessage) -> (Self, oneshot::Receiver<Option<SyncMessage>>) {
        let (reply, reply_rx) = oneshot::channel();
        (Self { message, reply }, reply_rx)
    }

    /// Answers the message.
    pub fn respond(self, response: SyncMessage) {
        self.reply.send(Some(response)).ok();
    }

    /// Declines to answer, e.g. because the message was addressed to someone else.
    pub fn ignore(self) {
        self.reply.send(None).ok();
    }
}

/// One end of the message channel.
pub trait Connection: Clone + Send + Sync + 'static {
    /// Sends `message` to the other end and waits for its response.
    ///
    /// Resolves to `None` if all listeners on the other end declined to answer.
    fn send_message(
        &self,
        message: SyncMessage,
    ) -> impl Future<Output = Result<Option<SyncMessage>, SendError>> + Send;

    /// Registers a listener for messages sent from the other end.
    ///
    /// The listener is removed once the receiver is dropped.
    fn subscribe(&self) -> mpsc::Receiver<InboundMessage>;
}
