//! Pure reconnection policy
//!
//! Backoff arithmetic and the attempt/abort decision live here, away from the
//! manager's locks and tasks, so they can be tested without a runtime.

use super::state::ConnectionState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

/// Exponential backoff settings for the reconnection loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 0-indexed attempt: `min(base * multiplier^attempt, max)`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() {
            scaled.min(self.max_backoff_ms as f64)
        } else {
            self.max_backoff_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Total time spent sleeping if every attempt fails
    pub fn calculate_max_total_time(&self) -> Duration {
        (0..self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .sum()
    }
}

/// Outcome of asking whether another attempt should run
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then make attempt number `attempt` (1-based)
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

pub struct ReconnectPolicy;

impl ReconnectPolicy {
    pub fn should_attempt_reconnection(
        attempts_made: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if attempts_made >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt: attempts_made + 1,
            delay: config.calculate_backoff_delay(attempts_made),
        }
    }

    pub fn validate(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if config.base_backoff_ms == 0 {
            return Err("base_backoff_ms must be greater than 0".to_string());
        }
        if config.multiplier.is_nan() || config.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }
        if config.max_backoff_ms < config.base_backoff_ms {
            return Err("max_backoff_ms must not be less than base_backoff_ms".to_string());
        }
        Ok(())
    }

    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, endpoint: &str) {
        match (from, to) {
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                info!(endpoint, "HSM link established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(endpoint, "HSM link down");
            }
            (ConnectionState::Disconnected, ConnectionState::Reconnecting) => {
                info!(endpoint, "Starting reconnection");
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                info!(endpoint, "Reconnection successful");
            }
            (ConnectionState::Reconnecting, ConnectionState::Disconnected) => {
                error!(endpoint, "Reconnection abandoned");
            }
            _ => {
                info!(endpoint, %from, %to, "Connection state changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_backoff_ms, 1000);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(0), Duration::from_secs(1));
        assert_eq!(config.calculate_backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.calculate_backoff_delay(4), Duration::from_secs(16));
        assert_eq!(config.calculate_backoff_delay(5), Duration::from_secs(30));
        assert_eq!(
            config.calculate_backoff_delay(u32::MAX),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_max_total_time() {
        // 1 + 2 + 4 + 8 + 16
        assert_eq!(
            ReconnectConfig::default().calculate_max_total_time(),
            Duration::from_secs(31)
        );
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        assert_eq!(
            ReconnectPolicy::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
        assert_eq!(
            ReconnectPolicy::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_secs(4),
            }
        );
        assert_eq!(
            ReconnectPolicy::should_attempt_reconnection(5, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            ReconnectPolicy::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectPolicy::validate(&ReconnectConfig::default()).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(ReconnectPolicy::validate(&zero_attempts).is_err());

        let shrinking = ReconnectConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(ReconnectPolicy::validate(&shrinking).is_err());

        let inverted = ReconnectConfig {
            base_backoff_ms: 5000,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        assert!(ReconnectPolicy::validate(&inverted).is_err());
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base in 1u64..10_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let config = ReconnectConfig {
                max_attempts: 5,
                base_backoff_ms: base,
                max_backoff_ms: base + extra,
                multiplier,
            };
            let this = config.calculate_backoff_delay(attempt);
            let next = config.calculate_backoff_delay(attempt + 1);

            prop_assert!(next >= this);
            prop_assert!(this <= Duration::from_millis(config.max_backoff_ms));
            prop_assert_eq!(
                config.calculate_backoff_delay(0),
                Duration::from_millis(base)
            );
        }
    }
}
