use serde::{Deserialize, Serialize};
use std::time::Duration;
use svcdir_common::Credentials;

/// Retry configuration for connect failover and reconnect.
///
/// Controls how many endpoints are tried before a connect attempt (or a
/// reconnect after session loss) is given up, and how long to wait between
/// attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Total attempts = max_retries + 1
    /// Default: 3
    pub max_retries: usize,
    /// Initial backoff in milliseconds
    ///
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Default: 5000ms
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `initial * multiplier^(attempt-1)`, capped at `max_backoff_ms`.
    /// Attempt 0 is the initial attempt and has no delay.
    pub fn backoff(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if delay.is_finite() {
            delay.min(self.max_backoff_ms as f64)
        } else {
            self.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn total_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Connection configuration.
///
/// # Default Configuration
///
/// - `connect_timeout_ms`: 5000
/// - `read_timeout_ms`: 20000
/// - `session_timeout_ms`: 40000 (requested; the server's value wins)
/// - `ping_interval_ms`: derived, a third of the smaller of read and
///   negotiated session timeout
/// - `max_outstanding_packets`: 1000
/// - `latency_collection`: disabled
///
/// # Example
///
/// ```
/// use svcdir_client::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     read_timeout_ms: 3_000,
///     latency_collection: true,
///     ..Default::default()
/// };
/// assert_eq!(config.connect_timeout_ms, 5_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    /// A session with no inbound frame for this long is considered dead.
    pub read_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub ping_interval_ms: Option<u64>,
    /// Queued plus in-flight packets allowed before `send` is rejected.
    pub max_outstanding_packets: usize,
    pub latency_collection: bool,
    pub credentials: Option<Credentials>,
    pub read_only_allowed: bool,
    pub retry: RetryConfig,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Keepalive interval for a session with the given negotiated timeout.
    pub fn ping_interval(&self, negotiated_session_timeout: Duration) -> Duration {
        match self.ping_interval_ms {
            Some(ms) => Duration::from_millis(ms.max(1)),
            None => {
                let base = self.read_timeout().min(negotiated_session_timeout);
                (base / 3).max(Duration::from_millis(1))
            }
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 20_000,
            session_timeout_ms: 40_000,
            ping_interval_ms: None,
            max_outstanding_packets: 1_000,
            latency_collection: false,
            credentials: None,
            read_only_allowed: false,
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.read_timeout_ms, 20_000);
        assert_eq!(config.session_timeout_ms, 40_000);
        assert_eq!(config.max_outstanding_packets, 1_000);
        assert!(!config.latency_collection);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::ZERO);
        assert_eq!(retry.backoff(1), Duration::from_millis(50));
        assert_eq!(retry.backoff(2), Duration::from_millis(100));
        assert_eq!(retry.backoff(3), Duration::from_millis(200));
        assert_eq!(retry.backoff(20), Duration::from_millis(5_000));
        assert_eq!(retry.backoff(usize::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_ping_interval_derivation() {
        let config = ConnectionConfig {
            read_timeout_ms: 9_000,
            ..Default::default()
        };
        assert_eq!(
            config.ping_interval(Duration::from_millis(30_000)),
            Duration::from_millis(3_000)
        );
        assert_eq!(
            config.ping_interval(Duration::from_millis(600)),
            Duration::from_millis(200)
        );

        let fixed = ConnectionConfig {
            ping_interval_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(
            fixed.ping_interval(Duration::from_millis(600)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"read_timeout_ms": 1500, "retry": {"max_retries": 0}}"#)
                .unwrap();
        assert_eq!(config.read_timeout_ms, 1_500);
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert_eq!(config.retry.total_attempts(), 1);
    }
}
