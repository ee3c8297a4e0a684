//! Client configuration.
//!
//! Plain data, so it can be loaded from a config file when the `serde` feature
//! is enabled:
//!
//! ```rust
//! use redial::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig {
//!     max_total_attempts: 4,
//!     attempt_timeout: Some(Duration::from_secs(2)),
//!     ..ClientConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::BuildError;
use std::time::Duration;

/// Default ceiling on attempts per logical request.
pub const DEFAULT_MAX_TOTAL_ATTEMPTS: u32 = 10;

/// Header carrying the number of retries made before the current attempt.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Settings of a retrying [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientConfig {
    /// Hard ceiling on attempts (initial + retries), whatever the rule says.
    pub max_total_attempts: u32,
    /// Deadline for each attempt; expiry fails the attempt with
    /// [`TimeoutError::Attempt`](crate::TimeoutError::Attempt).
    pub attempt_timeout: Option<Duration>,
    /// Deadline for the whole logical request, retries included. A duration
    /// too large to add to the current instant means no deadline.
    pub response_timeout: Option<Duration>,
    /// Honor numeric `Retry-After` headers when retrying.
    pub use_retry_after: bool,
    /// Send [`RETRY_COUNT_HEADER`] on retries.
    pub retry_count_header: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: DEFAULT_MAX_TOTAL_ATTEMPTS,
            attempt_timeout: None,
            response_timeout: None,
            use_retry_after: true,
            retry_count_header: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.max_total_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroTimeout("attempt_timeout"));
        }
        if self.response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroTimeout("response_timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ClientConfig::default();
        assert_eq!(config.max_total_attempts, DEFAULT_MAX_TOTAL_ATTEMPTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_attempts_and_timeouts() {
        let zero_attempts = ClientConfig { max_total_attempts: 0, ..ClientConfig::default() };
        assert_eq!(zero_attempts.validate(), Err(BuildError::InvalidMaxAttempts(0)));

        let zero_timeout =
            ClientConfig { attempt_timeout: Some(Duration::ZERO), ..ClientConfig::default() };
        assert_eq!(zero_timeout.validate(), Err(BuildError::ZeroTimeout("attempt_timeout")));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "max_total_attempts": 3, "retry_count_header": true }"#)
                .expect("config");
        assert_eq!(config.max_total_attempts, 3);
        assert!(config.retry_count_header);
        assert!(config.use_retry_after);
    }
}
