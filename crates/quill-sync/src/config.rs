use std::time::Duration;

use chrono::TimeDelta;

use crate::error::ConfigError;

/// Heartbeat cadence and eviction deadline for presence.
///
/// The eviction timeout is derived: `heartbeat_interval * max_missed_heartbeats`.
/// Requiring at least two missed intervals means a single late heartbeat never
/// evicts a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.max_missed_heartbeats < 2 {
            return Err(ConfigError::TooFewMissedHeartbeats(self.max_missed_heartbeats));
        }
        self.timeout_delta().map(|_| ())
    }

    pub fn timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.max_missed_heartbeats)
    }

    /// The timeout as a chrono delta, for comparing wall-clock timestamps.
    pub fn timeout_delta(&self) -> Result<TimeDelta, ConfigError> {
        TimeDelta::from_std(self.timeout()).map_err(|_| ConfigError::TimeoutOutOfRange)
    }
}

/// Limits applied to comment bodies before they reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommentLimits {
    pub max_body_chars: usize,
}

impl Default for CommentLimits {
    fn default() -> Self {
        Self { max_body_chars: 1000 }
    }
}

impl CommentLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_chars == 0 {
            return Err(ConfigError::ZeroCommentLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_three_intervals() {
        let config = PresenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.timeout_delta().unwrap(), TimeDelta::seconds(30));
    }

    #[test]
    fn rejects_single_interval_timeout() {
        let config = PresenceConfig {
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 1,
        };
        assert_eq!(config.validate(), Err(ConfigError::TooFewMissedHeartbeats(1)));

        let config = PresenceConfig {
            heartbeat_interval: Duration::ZERO,
            max_missed_heartbeats: 3,
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroHeartbeatInterval));
    }
}
