//! Configuration of a [`crate::SyncController`].

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

use crate::protocol::{LEGACY_SIDE_TARGET, WEBEXT_SIDE_TARGET};

/// Default time to wait for the response to a single message.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between startup announcements that found no listener.
pub const DEFAULT_STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Which part of the protocol a controller plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Role {
    /// Receives the peer's `startup` and decides the direction of the initial sync.
    ///
    /// This is the legacy side.
    Decider,
    /// Announces itself and answers the decider's full-storage requests.
    ///
    /// This is the embedded WebExtension side.
    Responder,
}

/// Retry policy for full-storage pushes after a failed incremental change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub min_delay: Duration,
    /// Upper bound of the growing delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Builds the backoff yielding the delays between attempts.
    ///
    /// It yields `max_attempts - 1` delays.
    pub(crate) fn backoff(&self) -> impl backon::Backoff + use<> {
        let builder = ExponentialBuilder::new()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1));
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

/// Configuration of one side of the synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Our part in the protocol.
    pub role: Role,
    /// Our identity, the `target` of messages meant for us.
    pub me: String,
    /// The peer's identity, the `target` of messages we send.
    pub peer: String,
    /// How long to wait for any single response.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// How often a responder repeats an announcement nobody listened to.
    #[serde(with = "millis")]
    pub startup_retry_interval: Duration,
    /// Retries of full-storage pushes.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::legacy_side()
    }
}

impl SyncConfig {
    /// The controller in the legacy environment.
    pub fn legacy_side() -> Self {
        Self::new(Role::Decider, LEGACY_SIDE_TARGET, WEBEXT_SIDE_TARGET)
    }

    /// The controller in the embedded WebExtension.
    pub fn webext_side() -> Self {
        Self::new(Role::Responder, WEBEXT_SIDE_TARGET, LEGACY_SIDE_TARGET)
    }

    /// A controller with the default timeouts.
    pub fn new(role: Role, me: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            role,
            me: me.into(),
            peer: peer.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_retry_interval: DEFAULT_STARTUP_RETRY_INTERVAL,
            retry: RetryConfig::default(),
        }
    }

    /// Sets [`Self::request_timeout`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets [`Self::startup_retry_interval`].
    pub fn with_startup_retry_interval(mut self, interval: Duration) -> Self {
        self.startup_retry_interval = interval;
        self
    }

    /// Sets [`Self::retry`].
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// (De)serializes a [`Duration`] as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
