//! Per-agent command-rate limiting.
//!
//! Ticks are grouped into fixed one-second windows (`tick_rate_hz` ticks
//! each, first window starts at tick 1). Each agent may have at most
//! `floor(commands_per_second)` commands accepted per window; everything
//! beyond that is rejected with `RateLimited`, never queued for later.

use crate::error::{RejectedReason, Result, SessionError};
use crate::types::AgentId;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    budget: u32,
    window_ticks: u64,
    usage: BTreeMap<AgentId, (u64, u32)>,
}

impl RateLimiter {
    /// # Errors
    /// `ConfigurationInvalid` if the budget admits fewer than one command per
    /// window or the tick rate is zero.
    pub fn new(commands_per_second: f64, tick_rate_hz: u32) -> Result<Self> {
        if !(commands_per_second >= 1.0) || !commands_per_second.is_finite() {
            return Err(SessionError::config(format!(
                "commands per second must be at least 1 (got {})",
                commands_per_second
            )));
        }
        if tick_rate_hz == 0 {
            return Err(SessionError::config("tick rate must be positive"));
        }
        Ok(Self {
            budget: commands_per_second.floor().min(u32::MAX as f64) as u32,
            window_ticks: tick_rate_hz as u64,
            usage: BTreeMap::new(),
        })
    }

    /// Accepted commands allowed per window.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn window_ticks(&self) -> u64 {
        self.window_ticks
    }

    /// Rate window containing `tick` (ticks start at 1).
    pub fn window_of(&self, tick: u64) -> u64 {
        tick.saturating_sub(1) / self.window_ticks
    }

    /// Consumes one unit of `agent`'s budget for the window containing `tick`.
    pub fn check(&mut self, agent: AgentId, tick: u64) -> std::result::Result<(), RejectedReason> {
        let window = self.window_of(tick);
        let (current, used) = self.usage.entry(agent).or_insert((window, 0));
        if *current != window {
            *current = window;
            *used = 0;
        }
        if *used >= self.budget {
            return Err(RejectedReason::RateLimited);
        }
        *used += 1;
        Ok(())
    }

    /// Commands still admissible for `agent` in the window containing `tick`.
    pub fn remaining(&self, agent: AgentId, tick: u64) -> u32 {
        let window = self.window_of(tick);
        match self.usage.get(&agent) {
            Some((current, used)) if *current == window => self.budget - used,
            _ => self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_budget_is_floor_of_rate() {
        let limiter = RateLimiter::new(4.7, 60).unwrap();
        assert_eq!(limiter.budget(), 4);
    }

    #[test]
    fn test_sub_one_rate_is_configuration_error() {
        assert!(matches!(
            RateLimiter::new(0.5, 60),
            Err(SessionError::ConfigurationInvalid(_))
        ));
        assert!(RateLimiter::new(f64::NAN, 60).is_err());
        assert!(RateLimiter::new(4.0, 0).is_err());
    }

    #[test]
    fn test_window_resets() {
        let mut limiter = RateLimiter::new(2.0, 10).unwrap();
        let agent = AgentId(1);
        assert!(limiter.check(agent, 1).is_ok());
        assert!(limiter.check(agent, 5).is_ok());
        assert_eq!(limiter.check(agent, 10), Err(RejectedReason::RateLimited));
        // Tick 11 opens the second window
        assert!(limiter.check(agent, 11).is_ok());
        assert_eq!(limiter.remaining(agent, 11), 1);
    }

    #[test]
    fn test_agents_are_independent() {
        let mut limiter = RateLimiter::new(1.0, 60).unwrap();
        assert!(limiter.check(AgentId(1), 1).is_ok());
        assert!(limiter.check(AgentId(2), 1).is_ok());
        assert!(limiter.check(AgentId(1), 2).is_err());
    }

    proptest! {
        #[test]
        fn test_exactly_floor_budget_accepted_per_window(
            rate in 1.0f64..12.0,
            tick_rate in 1u32..120,
            submissions in proptest::collection::vec(1u64..600, 0..300),
        ) {
            let mut limiter = RateLimiter::new(rate, tick_rate).unwrap();
            let mut ticks = submissions;
            ticks.sort_unstable();

            let mut accepted: BTreeMap<u64, u32> = BTreeMap::new();
            let mut offered: BTreeMap<u64, u32> = BTreeMap::new();
            for tick in &ticks {
                let window = limiter.window_of(*tick);
                *offered.entry(window).or_default() += 1;
                if limiter.check(AgentId(1), *tick).is_ok() {
                    *accepted.entry(window).or_default() += 1;
                }
            }

            let budget = rate.floor() as u32;
            for (window, count) in offered {
                let got = accepted.get(&window).copied().unwrap_or(0);
                prop_assert_eq!(got, count.min(budget));
            }
        }
    }
}
