//! The wire format spoken between the two controllers.
//!
//! Every message is a [`SyncMessage`] envelope `{target, type, value}`. `target` names
//! the receiving controller, since several listeners may share one channel. Each request
//! type has a `"<type>:response"` counterpart which the receiver sends back, addressed to
//! the original sender.
//!
//! The protocol is:
//!
//! - Both sides announce themselves with a `startup` message carrying their
//!   `lastStorageChange` timestamp.
//! - The deciding side compares the timestamps with [`is_pull`] and either requests the
//!   peer's snapshot (`request:full-storage`) or pushes its own (`full-storage`).
//! - Afterwards local changes are relayed as `storage-changes`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{
    ErrorValueSnafu, IncorrectTargetSnafu, IncorrectTypeSnafu, MalformedPayloadSnafu,
    NoResponseSnafu, NotReadySnafu, ProtocolError,
};

/// Identity of the controller living in the legacy environment.
pub const LEGACY_SIDE_TARGET: &str = "legacy-side-storage-migration-controller";

/// Identity of the controller living in the embedded WebExtension.
pub const WEBEXT_SIDE_TARGET: &str = "storage-migration-from-xpcom";

/// The `type` of a [`SyncMessage`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum MessageType {
    /// Announces readiness together with the sender's `lastStorageChange`.
    #[serde(rename = "startup")]
    #[strum(serialize = "startup")]
    Startup,
    /// Acknowledges a `startup`.
    #[serde(rename = "startup:response")]
    #[strum(serialize = "startup:response")]
    StartupResponse,
    /// Asks the peer for its full snapshot.
    #[serde(rename = "request:full-storage")]
    #[strum(serialize = "request:full-storage")]
    RequestFullStorage,
    /// Carries the requested snapshot.
    #[serde(rename = "request:full-storage:response")]
    #[strum(serialize = "request:full-storage:response")]
    RequestFullStorageResponse,
    /// Carries a full snapshot which replaces the receiver's storage.
    #[serde(rename = "full-storage")]
    #[strum(serialize = "full-storage")]
    FullStorage,
    /// Acknowledges a `full-storage`.
    #[serde(rename = "full-storage:response")]
    #[strum(serialize = "full-storage:response")]
    FullStorageResponse,
    /// Carries a change set to apply on the receiver's storage.
    #[serde(rename = "storage-changes", alias = "storage-change")]
    #[strum(to_string = "storage-changes", serialize = "storage-change")]
    StorageChanges,
    /// Acknowledges a `storage-changes`.
    #[serde(rename = "storage-changes:response", alias = "storage-change:response")]
    #[strum(
        to_string = "storage-changes:response",
        serialize = "storage-change:response"
    )]
    StorageChangesResponse,
}

impl MessageType {
    /// Returns the response type belonging to this request type.
    ///
    /// Returns `None` if `self` already is a response.
    pub fn response(self) -> Option<Self> {
        match self {
            Self::Startup => Some(Self::StartupResponse),
            Self::RequestFullStorage => Some(Self::RequestFullStorageResponse),
            Self::FullStorage => Some(Self::FullStorageResponse),
            Self::StorageChanges => Some(Self::StorageChangesResponse),
            Self::StartupResponse
            | Self::RequestFullStorageResponse
            | Self::FullStorageResponse
            | Self::StorageChangesResponse => None,
        }
    }

    /// Whether this is a `":response"` type.
    pub fn is_response(self) -> bool {
        self.response().is_none()
    }
}

/// The envelope of every message sent over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Identity of the receiving controller.
    pub target: String,
    /// What this message is.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The payload, depends on `kind`.
    #[serde(default)]
    pub value: Value,
}

impl SyncMessage {
    /// Creates a message addressed to `target`.
    pub fn new(target: impl Into<String>, kind: MessageType, value: impl Into<Value>) -> Self {
        Self {
            target: target.into(),
            kind,
            value: value.into(),
        }
    }

    /// Creates the response to a request of type `request`, addressed to `target`.
    ///
    /// A failed operation is answered with `{"error": "<reason>"}` as value.
    pub fn response_to(
        target: impl Into<String>,
        request: MessageType,
        result: Result<Value, String>,
    ) -> Self {
        let kind = request.response().unwrap_or(request);
        let value = match result {
            Ok(value) => value,
            Err(error) => serde_json::json!({ "error": error }),
        };
        Self::new(target, kind, value)
    }

    /// Parses the payload into `T`.
    pub fn parse_value<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.value.clone())
            .context(MalformedPayloadSnafu { kind: self.kind })
    }

    /// Returns the embedded `error` of a failure response, if any.
    pub fn error(&self) -> Option<String> {
        let error = self.value.as_object()?.get("error")?;
        Some(match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Serializes to JSON, the form used by host bridges.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("messages always serialize")
    }

    /// Parses a JSON encoded message.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Validates a response to a message of type `sent`.
///
/// The response must exist, be addressed to `me`, have the type `"<sent>:response"` and
/// must not carry an `error` in its value.
pub fn check_response(
    response: Option<SyncMessage>,
    me: &str,
    sent: MessageType,
) -> Result<SyncMessage, ProtocolError> {
    let response = response.ok_or_else(|| NoResponseSnafu.build())?;
    snafu::ensure!(
        response.target == me,
        IncorrectTargetSnafu {
            expected: me,
            actual: response.target.clone(),
        }
    );
    let expected = sent.response().unwrap_or(sent);
    snafu::ensure!(
        response.kind == expected,
        IncorrectTypeSnafu {
            expected,
            actual: response.kind,
        }
    );
    if let Some(error) = response.error() {
        return Err(ErrorValueSnafu { error }.build());
    }
    Ok(response)
}

/// Payload of a `startup` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupValue {
    /// The sender is listening and ready to sync.
    pub ready: bool,
    /// When the sender's storage was last changed.
    #[serde(
        rename = "lastStorageChange",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_storage_change: Option<String>,
}

impl StartupValue {
    /// A ready announcement carrying `last_storage_change`.
    pub fn ready(last_storage_change: Option<String>) -> Self {
        Self {
            ready: true,
            last_storage_change,
        }
    }

    /// Reads the payload of a `startup` message.
    ///
    /// Older legacy builds announce themselves with the bare string `"ready"`, which is
    /// accepted as a ready announcement without timestamp.
    pub fn from_message(message: &SyncMessage) -> Result<Self, ProtocolError> {
        let value = match &message.value {
            Value::String(s) if s == "ready" => Self::ready(None),
            _ => message.parse_value()?,
        };
        snafu::ensure!(value.ready, NotReadySnafu);
        Ok(value)
    }
}

impl From<StartupValue> for Value {
    fn from(value: StartupValue) -> Self {
        serde_json::to_value(value).expect("startup values always serialize")
    }
}

/// Decides the direction of the initial full-storage transfer.
///
/// Returns `true` if the local side has to pull the peer's snapshot:
///
/// - no peer timestamp: push, we are authoritative.
/// - a peer timestamp but none locally: pull.
/// - both: pull iff the peer's is strictly newer.
///
/// Empty strings count as absent. A timestamp that cannot be parsed never compares as
/// newer.
pub fn is_pull(local: Option<&str>, peer: Option<&str>) -> bool {
    let Some(peer) = peer.filter(|s| !s.is_empty()) else {
        return false;
    };
    let Some(local) = local.filter(|s| !s.is_empty()) else {
        return true;
    };
    match (parse_timestamp(peer), parse_timestamp(local)) {
        (Some(peer), Some(local)) => peer > local,
        _ => false,
    }
}

/// Parses an ISO-8601 timestamp.
///
/// Besides full RFC 3339 timestamps this accepts the shorter date-only forms `YYYY`,
/// `YYYY-MM` and `YYYY-MM-DD` (as UTC midnight) and date-times without offset (as UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc());
        }
    }
    let date = match s.len() {
        4 => NaiveDate::from_ymd_opt(s.parse().ok()?, 1, 1),
        7 => NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok(),
        10 => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
        _ => None,
    }?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// The current time in the format stored as `lastStorageChange`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
