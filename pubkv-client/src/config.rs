//! # Service Configuration
//!
//! Purpose: Describe where the backend lives and how connections behave, and
//! fill in the pub/sub timing defaults exactly once when applied.
//!
//! ## Design Principles
//! 1. **Zero Means Unset**: Durations default to zero and are replaced by
//!    `with_defaults`, so a partially filled struct is always valid input.
//! 2. **Plain Data**: The structs derive serde so callers can build them from
//!    any format; durations travel as integer milliseconds.
//! 3. **Validate Once**: Invariants are checked when the configuration is
//!    applied, not on every dial.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Health-check period used when none is configured.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Extra read slack on top of the health-check period.
pub const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Session write timeout used when none is configured.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection and pool configuration for [`crate::KVService`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Server address, e.g. "127.0.0.1:6379".
    pub address: String,
    /// Maximum idle connections kept in the pool.
    #[serde(default)]
    pub max_idle: usize,
    /// Maximum connections (idle + in use); 0 means unlimited.
    #[serde(default)]
    pub max_active: usize,
    /// Idle connections unused for longer than this are closed; 0 disables.
    #[serde(default, rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Settings for the dedicated subscribe connection.
    #[serde(default)]
    pub pubsub: PubSubConfiguration,
}

/// Timing for subscribe sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubConfiguration {
    /// Bound on each read from the session connection.
    #[serde(default, rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,
    /// Bound on each write to the session connection.
    #[serde(default, rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Period between PINGs on the session connection.
    #[serde(default, rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Configuration {
    /// Creates a configuration for `address` with every other field unset.
    pub fn new(address: impl Into<String>) -> Self {
        Configuration {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Replaces unset pub/sub timings with their defaults.
    ///
    /// The read timeout is derived from the (possibly defaulted) health-check
    /// interval, so it is filled last.
    pub fn with_defaults(mut self) -> Self {
        let pubsub = &mut self.pubsub;
        if pubsub.health_check_interval.is_zero() {
            pubsub.health_check_interval = DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        if pubsub.read_timeout.is_zero() {
            pubsub.read_timeout = pubsub.health_check_interval + READ_TIMEOUT_MARGIN;
        }
        if pubsub.write_timeout.is_zero() {
            pubsub.write_timeout = DEFAULT_WRITE_TIMEOUT;
        }
        self
    }

    /// Checks invariants on an already-defaulted configuration.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.address.trim().is_empty() {
            return Err(ServiceError::InvalidConfiguration(
                "address is required".to_string(),
            ));
        }
        // A missed PONG has to trip the read timeout before the next PING.
        if self.pubsub.read_timeout <= self.pubsub.health_check_interval {
            return Err(ServiceError::InvalidConfiguration(format!(
                "pubsub read timeout ({:?}) must exceed the health check interval ({:?})",
                self.pubsub.read_timeout, self.pubsub.health_check_interval
            )));
        }
        Ok(())
    }

    /// Deserializes a configuration from a loosely typed value.
    pub fn from_value(value: serde_json::Value) -> ServiceResult<Self> {
        serde_json::from_value(value).map_err(ServiceError::WrongConfiguration)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
