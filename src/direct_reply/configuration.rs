//! Tuning knobs for a [`DirectReplyContainer`](super::DirectReplyContainer).
use serde::Deserialize;
use serde_aux::field_attributes::{
    deserialize_number_from_string, deserialize_option_number_from_string,
};
use std::time::Duration;

const MAX_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Configuration of the reply channel pool.
///
/// All fields are optional when deserializing; missing ones take the values of
/// `DirectReplySettings::default()`.
pub struct DirectReplySettings {
    /// The maximum number of channels borrowed at the same time.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_concurrent_channels: usize,
    /// How long a returned channel can sit in the pool before it is closed, in seconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub idle_timeout_seconds: u64,
    /// How often idle channels are looked for, in milliseconds.
    /// Defaults to the idle timeout, capped at 5 seconds.
    #[serde(deserialize_with = "deserialize_option_number_from_string")]
    pub idle_poll_interval_millis: Option<u64>,
    /// How long `borrow` waits for a channel when the pool is at capacity, in milliseconds.
    /// `borrow` waits indefinitely if set to `None`.
    #[serde(deserialize_with = "deserialize_option_number_from_string")]
    pub borrow_timeout_millis: Option<u64>,
    /// How long `stop` waits for in-flight replies to be processed, in seconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub shutdown_grace_period_seconds: u64,
    /// How many channels are opened when the container starts.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub prewarm_channels: usize,
}

impl Default for DirectReplySettings {
    fn default() -> Self {
        Self {
            max_concurrent_channels: 16,
            idle_timeout_seconds: 60,
            idle_poll_interval_millis: None,
            borrow_timeout_millis: Some(5_000),
            shutdown_grace_period_seconds: 5,
            prewarm_channels: 0,
        }
    }
}

impl DirectReplySettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        let interval = self
            .idle_poll_interval_millis
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.idle_timeout().min(MAX_IDLE_POLL_INTERVAL));
        // tokio intervals panic on a zero period.
        interval.max(Duration::from_millis(1))
    }

    pub fn borrow_timeout(&self) -> Option<Duration> {
        self.borrow_timeout_millis.map(Duration::from_millis)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }
}
