//! Session configuration.

use crate::action_log::SessionMetadata;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest accepted think-time bank (one day).
pub const MAX_THINK_TIME_SECS: f64 = 86_400.0;

/// Budgets and clock settings for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Game-time limit in seconds (default: 60)
    pub game_time_secs: f64,

    /// Per-agent think-time bank in seconds (default: 150)
    pub think_time_secs: f64,

    /// Per-agent command-rate limit (default: 4)
    pub commands_per_second: f64,

    /// Fixed tick rate in Hz (default: 60)
    pub tick_rate_hz: u32,

    /// TCP listening port for the headless server (default: 2049)
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            game_time_secs: 60.0,
            think_time_secs: 150.0,
            commands_per_second: 4.0,
            tick_rate_hz: 60,
            port: 2049,
        }
    }
}

impl SessionConfig {
    /// Sets the game-time limit to exactly `ticks` ticks.
    pub fn with_game_ticks(mut self, ticks: u64) -> Self {
        self.game_time_secs = ticks as f64 / self.tick_rate_hz as f64;
        self
    }

    /// Sets the think-time bank to exactly `ticks` ticks.
    pub fn with_think_ticks(mut self, ticks: u64) -> Self {
        self.think_time_secs = ticks as f64 / self.tick_rate_hz as f64;
        self
    }

    /// Rebuilds the configuration a log was recorded with.
    pub fn from_metadata(meta: &SessionMetadata) -> Self {
        Self {
            game_time_secs: meta.game_time_secs,
            think_time_secs: meta.think_time_secs,
            commands_per_second: meta.commands_per_second,
            tick_rate_hz: meta.tick_rate_hz,
            ..Self::default()
        }
    }

    /// # Errors
    /// `ConfigurationInvalid` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.tick_rate_hz == 0 {
            return Err(SessionError::config("tick rate must be positive"));
        }
        if !(self.game_time_secs > 0.0) || !self.game_time_secs.is_finite() {
            return Err(SessionError::config(format!(
                "game time must be positive (got {})",
                self.game_time_secs
            )));
        }
        if !(self.think_time_secs >= 0.0) || !self.think_time_secs.is_finite() {
            return Err(SessionError::config(format!(
                "think time must be non-negative (got {})",
                self.think_time_secs
            )));
        }
        if self.think_time_secs > MAX_THINK_TIME_SECS {
            return Err(SessionError::config(format!(
                "think time must be at most {}s (got {})",
                MAX_THINK_TIME_SECS, self.think_time_secs
            )));
        }
        if !(self.commands_per_second >= 1.0) || !self.commands_per_second.is_finite() {
            return Err(SessionError::config(format!(
                "commands per second must be at least 1 (got {})",
                self.commands_per_second
            )));
        }
        Ok(())
    }

    /// Wall-clock length of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz as f64)
    }

    /// Simulation step in seconds.
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate_hz as f32
    }

    /// Number of ticks before the session ends with `TimeExpired`.
    pub fn limit_ticks(&self) -> u64 {
        // Tolerance absorbs float error in secs * rate (2/60 * 60 != 2.0 exactly)
        let ticks = (self.game_time_secs * self.tick_rate_hz as f64 - 1e-6).ceil();
        ticks.max(1.0) as u64
    }

    /// Agents are polled every this many ticks.
    pub fn poll_interval_ticks(&self) -> u64 {
        let interval = (self.tick_rate_hz as f64 / self.commands_per_second).floor();
        interval.max(1.0) as u64
    }

    /// Think-time bank, clamped to `0..=MAX_THINK_TIME_SECS`.
    pub fn think_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.think_time_secs.min(MAX_THINK_TIME_SECS)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 2049);
        assert_eq!(config.limit_ticks(), 3600);
        assert_eq!(config.poll_interval_ticks(), 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_game_ticks_is_exact() {
        for ticks in [1, 2, 3, 7, 59, 61, 1000] {
            let config = SessionConfig::default().with_game_ticks(ticks);
            assert_eq!(config.limit_ticks(), ticks);
        }
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let config = SessionConfig {
            commands_per_second: 500.0,
            ..SessionConfig::default()
        };
        assert_eq!(config.poll_interval_ticks(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            SessionConfig { tick_rate_hz: 0, ..SessionConfig::default() },
            SessionConfig { game_time_secs: 0.0, ..SessionConfig::default() },
            SessionConfig { think_time_secs: -1.0, ..SessionConfig::default() },
            SessionConfig { commands_per_second: 0.9, ..SessionConfig::default() },
            SessionConfig { game_time_secs: f64::NAN, ..SessionConfig::default() },
            SessionConfig { think_time_secs: 1e20, ..SessionConfig::default() },
            SessionConfig { think_time_secs: MAX_THINK_TIME_SECS + 1.0, ..SessionConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SessionError::ConfigurationInvalid(_))));
        }
    }

    #[test]
    fn test_think_time_never_panics() {
        let huge = SessionConfig { think_time_secs: 1e20, ..SessionConfig::default() };
        assert_eq!(huge.think_time(), Duration::from_secs(86_400));
        let nan = SessionConfig { think_time_secs: f64::NAN, ..SessionConfig::default() };
        assert_eq!(nan.think_time(), Duration::from_secs(86_400));
        let negative = SessionConfig { think_time_secs: -3.0, ..SessionConfig::default() };
        assert_eq!(negative.think_time(), Duration::ZERO);
    }
}
