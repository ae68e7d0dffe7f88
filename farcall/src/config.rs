use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::time::Duration;

use crate::{
    EndpointSelection,
    error::{Error, ErrorKind, Result},
};

/// Sentinel for "no timeout" on invocation, connection and locator-cache timeouts.
pub const INFINITE_TIMEOUT: i32 = -1;
/// Invocation-timeout sentinel meaning "use the connection timeout".
pub const CONNECTION_TIMEOUT: i32 = -2;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct RuntimeConfig {
    /// Number of retries an invocation may make after its first attempt.
    #[serde_inline_default(4)]
    pub max_retry_attempts: u32,
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,
    #[serde_inline_default(INFINITE_TIMEOUT)]
    pub connect_timeout_ms: i32,
    #[serde_inline_default(INFINITE_TIMEOUT)]
    pub invocation_timeout_ms: i32,
    #[serde_inline_default(INFINITE_TIMEOUT)]
    pub locator_cache_timeout_ms: i32,
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
    #[serde_inline_default(true)]
    pub cache_connection: bool,
    #[serde_inline_default(EndpointSelection::Random)]
    pub endpoint_selection: EndpointSelection,
    #[serde_inline_default(false)]
    pub prefer_secure: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl RuntimeConfig {
    /// # Errors
    ///
    /// Fails with `InvalidArgument` when a default timeout is out of range.
    pub fn validate(&self) -> Result<()> {
        check_connection_timeout(self.connect_timeout_ms)?;
        check_invocation_timeout(self.invocation_timeout_ms)?;
        check_locator_cache_timeout(self.locator_cache_timeout_ms)?;
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

pub(crate) fn check_locator_cache_timeout(timeout: i32) -> Result<()> {
    if timeout < INFINITE_TIMEOUT {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid locator cache timeout: {timeout}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_invocation_timeout(timeout: i32) -> Result<()> {
    if timeout < 1 && timeout != INFINITE_TIMEOUT && timeout != CONNECTION_TIMEOUT {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid invocation timeout: {timeout}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_connection_timeout(timeout: i32) -> Result<()> {
    if timeout < 1 && timeout != INFINITE_TIMEOUT {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid connection timeout: {timeout}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_retry_attempts, 4);
        assert_eq!(config.invocation_timeout_ms, INFINITE_TIMEOUT);
        assert_eq!(config.endpoint_selection, EndpointSelection::Random);
        assert!(config.use_msgpack);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_json() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"max_retry_attempts": 1, "retry_backoff": "10ms", "invocation_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(config.max_retry_attempts, 1);
        assert_eq!(config.retry_backoff, Duration::from_millis(10));
        assert_eq!(config.invocation_timeout_ms, 250);

        let config: RuntimeConfig = serde_json::from_str(r#"{"connect_timeout_ms": 0}"#).unwrap();
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_backoff() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"retry_backoff": "100ms", "retry_backoff_max": "300ms"}"#)
                .unwrap();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(300));
        assert_eq!(config.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_timeout_checks() {
        for valid in [-1, 1, 500] {
            check_connection_timeout(valid).unwrap();
        }
        for invalid in [0, -2, -10] {
            check_connection_timeout(invalid).unwrap_err();
        }
        for valid in [-2, -1, 1] {
            check_invocation_timeout(valid).unwrap();
        }
        for invalid in [0, -3] {
            check_invocation_timeout(invalid).unwrap_err();
        }
        for valid in [-1, 0, 60] {
            check_locator_cache_timeout(valid).unwrap();
        }
        check_locator_cache_timeout(-2).unwrap_err();
    }
}
