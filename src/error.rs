//! Errors of the storage synchronization.
//!
//! None of these ever leave the controller tasks. They are logged and turned into
//! state changes, see [`crate::controller`].

use n0_future::time::{Duration, Elapsed};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::{defer::DeferredError, protocol::MessageType};

/// The message channel failed to deliver a message or its response.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SendError {
    #[snafu(display("Could not establish connection. Receiving end does not exist."))]
    NoReceiver {},
    #[snafu(display("The connection to the peer is closed"))]
    Disconnected {},
    #[snafu(display("The peer dropped the message without responding"))]
    ReplyDropped {},
    #[snafu(display("No response from the peer within {timeout:?}"))]
    Timeout { timeout: Duration, source: Elapsed },
}

/// A response did not pass validation.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ProtocolError {
    #[snafu(display("No response"))]
    NoResponse {},
    #[snafu(display("Incorrect target: expected {expected:?}, got {actual:?}"))]
    IncorrectTarget { expected: String, actual: String },
    #[snafu(display("Incorrect response type: expected \"{expected}\", got \"{actual}\""))]
    IncorrectType {
        expected: MessageType,
        actual: MessageType,
    },
    #[snafu(display("Response value contains an error: {error}"))]
    ErrorValue { error: String },
    #[snafu(display("Malformed \"{kind}\" payload"))]
    MalformedPayload {
        kind: MessageType,
        source: serde_json::Error,
    },
    #[snafu(display("Unexpected message type \"{kind}\""))]
    UnexpectedType { kind: MessageType },
    #[snafu(display("Startup message without ready flag"))]
    NotReady {},
}

/// The local storage area failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StorageError {
    #[snafu(display("Storage area is unavailable"))]
    Unavailable {},
    #[snafu(display("Storage {operation} failed: {reason}"))]
    Io {
        operation: &'static str,
        reason: String,
    },
}

/// Any failure of a synchronization operation.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SyncError {
    #[snafu(transparent)]
    Channel { source: SendError },
    #[snafu(transparent)]
    Protocol { source: ProtocolError },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    NotReady { source: DeferredError },
}
