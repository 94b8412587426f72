//! Session Clock & Scheduler - the single writer of the authoritative World.
//!
//! # State machine
//!
//! ```text
//!            open_tick()            close_tick()
//!   Running ─────────────► window ─────────────► Running ──► ... ──► Ended(reason)
//!      │                                                               ▲
//!      └── quit() / Quit from a controller / limit reached ────────────┘
//! ```
//!
//! # One tick boundary
//!
//! 1. `open_tick` advances to tick `T` and opens a think window for every
//!    polled agent. The window closes when the agent's remaining think-time
//!    bank runs out.
//! 2. The caller collects [`Submission`]s (live agents via the network
//!    session, or local input).
//! 3. `close_tick` resolves every submission in `(agent_id, arrival)` order:
//!    late -> `Timeout`, over budget -> `RateLimited`, otherwise applied to
//!    the World (which may itself reject). Every outcome is appended to the
//!    action log. Polled agents that sent nothing get a single no-op record.
//! 4. The World is stepped and a filtered snapshot is produced.
//! 5. If the game-time limit has been reached the session ends with
//!    `TimeExpired`; the log is finalized.

use crate::action_log::{ActionRecord, AgentInfo, EndReason, Outcome, SharedActionLog};
use crate::command::Command;
use crate::config::SessionConfig;
use crate::error::{RejectedReason, Result, SessionError};
use crate::rate_limit::RateLimiter;
use crate::types::AgentId;
use crate::world::{Snapshot, World};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Ended(EndReason),
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            SessionState::Running => None,
            SessionState::Ended(reason) => Some(*reason),
        }
    }
}

/// Connection status of an agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
struct AgentSlot {
    info: AgentInfo,
    status: AgentStatus,

    /// Remaining think time for the whole session
    think_bank: Duration,
}

/// A command as it reached the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub agent_id: AgentId,

    /// Tick the agent answered for
    pub tick: u64,

    pub command: Command,

    /// Session-clock time the command was received
    pub issued_at: Duration,

    /// Wall-clock milliseconds, recorded in the log
    pub issued_at_ms: u64,

    /// Global arrival sequence (ties within an agent)
    pub arrival: u64,
}

/// Think windows opened for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickWindow {
    pub tick: u64,

    /// Session-clock time the window opened
    pub opened_at: Duration,

    /// Agents asked for a command this tick
    pub polled: BTreeSet<AgentId>,

    /// Per connected polled agent: latest acceptable issue time
    pub deadlines: BTreeMap<AgentId, Duration>,
}

impl TickWindow {
    /// Latest deadline of the window (the tick boundary may not wait longer).
    pub fn closes_at(&self) -> Duration {
        self.deadlines
            .values()
            .copied()
            .max()
            .unwrap_or(self.opened_at)
    }
}

/// What a closed tick produced.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,

    /// Records appended this tick, in log order
    pub records: Vec<ActionRecord>,

    /// Synchronized view after the tick
    pub snapshot: Snapshot,

    /// Set if the session ended at this boundary
    pub ended: Option<EndReason>,
}

/// Outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub applied: u64,
    pub rejected: BTreeMap<RejectedReason, u64>,
}

impl SessionStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Rejected { reason } => *self.rejected.entry(*reason).or_default() += 1,
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// Owns the World and drives it one tick at a time.
pub struct Scheduler {
    world: World,
    config: SessionConfig,
    limiter: RateLimiter,
    log: Option<SharedActionLog>,
    agents: BTreeMap<AgentId, AgentSlot>,
    tick: u64,
    state: SessionState,
    stats: SessionStats,
}

impl Scheduler {
    /// Creates a scheduler at tick 0.
    ///
    /// `log` is `None` in replay, where the log is the input rather than the output.
    ///
    /// # Errors
    /// `ConfigurationInvalid` if the config fails validation.
    pub fn new(world: World, config: SessionConfig, log: Option<SharedActionLog>) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::new(config.commands_per_second, config.tick_rate_hz)?;
        Ok(Self {
            world,
            config,
            limiter,
            log,
            agents: BTreeMap::new(),
            tick: 0,
            state: SessionState::Running,
            stats: SessionStats::default(),
        })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable World access for session setup (spawning players).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> Option<&SharedActionLog> {
        self.log.as_ref()
    }

    /// Last completed tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Adds an agent (or refreshes a reconnecting one).
    pub fn register_agent(&mut self, info: AgentInfo) -> Result<()> {
        if let Some(log) = &self.log {
            log.register_agent(info.clone())?;
        }
        let think_bank = self.config.think_time();
        let slot = self.agents.entry(info.agent_id).or_insert_with(|| AgentSlot {
            info: info.clone(),
            status: AgentStatus::Connected,
            think_bank,
        });
        slot.info = info;
        slot.status = AgentStatus::Connected;
        Ok(())
    }

    pub fn set_status(&mut self, agent: AgentId, status: AgentStatus) {
        if let Some(slot) = self.agents.get_mut(&agent) {
            if slot.status != status {
                info!(%agent, ?status, tick = self.tick, "agent status changed");
            }
            slot.status = status;
        }
    }

    pub fn agent_status(&self, agent: AgentId) -> Option<AgentStatus> {
        self.agents.get(&agent).map(|s| s.status)
    }

    /// Remaining think time of an agent.
    pub fn think_bank(&self, agent: AgentId) -> Option<Duration> {
        self.agents.get(&agent).map(|s| s.think_bank)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents.values().map(|s| &s.info)
    }

    /// Advances to the next tick and opens think windows.
    ///
    /// Returns `None` once the session has ended.
    pub fn open_tick(&mut self, now: Duration) -> Option<TickWindow> {
        if !self.state.is_running() {
            return None;
        }
        let tick = self.tick + 1;
        let poll_tick = (tick - 1) % self.config.poll_interval_ticks() == 0;

        let mut polled = BTreeSet::new();
        let mut deadlines = BTreeMap::new();
        if poll_tick {
            for (id, slot) in &self.agents {
                if !slot.info.role.is_polled() {
                    continue;
                }
                polled.insert(*id);
                if slot.status == AgentStatus::Connected {
                    deadlines.insert(*id, now + slot.think_bank);
                }
            }
        }

        debug!(tick, polled = polled.len(), "tick opened");
        Some(TickWindow {
            tick,
            opened_at: now,
            polled,
            deadlines,
        })
    }

    /// Resolves a window's submissions, mutates the World and emits a snapshot.
    ///
    /// # Errors
    /// Only integrity failures of the action log; per-command failures are
    /// recorded, never returned.
    pub fn close_tick(
        &mut self,
        window: &TickWindow,
        submissions: Vec<Submission>,
    ) -> Result<TickReport> {
        if !self.state.is_running() {
            return Err(SessionError::LogFinalized);
        }
        if window.tick != self.tick + 1 {
            return Err(SessionError::protocol(format!(
                "closing tick {} but the next tick is {}",
                window.tick,
                self.tick + 1
            )));
        }
        let tick = window.tick;

        let mut by_agent: BTreeMap<AgentId, Vec<Submission>> = BTreeMap::new();
        for submission in submissions {
            if !self.agents.contains_key(&submission.agent_id) {
                warn!(agent = %submission.agent_id, "dropping submission from unregistered agent");
                continue;
            }
            by_agent.entry(submission.agent_id).or_default().push(submission);
        }
        for list in by_agent.values_mut() {
            list.sort_by_key(|s| s.arrival);
        }

        let involved: BTreeSet<AgentId> = window
            .polled
            .iter()
            .copied()
            .chain(by_agent.keys().copied())
            .collect();

        let mut records = Vec::new();
        let mut quit = false;
        for agent in involved {
            let submissions = by_agent.remove(&agent).unwrap_or_default();
            let deadline = window.deadlines.get(&agent).copied();
            let mut last_on_time: Option<Duration> = None;

            if submissions.is_empty() {
                let reason = match self.agent_status(agent) {
                    Some(AgentStatus::Disconnected) | None => RejectedReason::AgentDisconnected,
                    Some(AgentStatus::Connected) if deadline.is_none() => {
                        // Dropped mid-window and came back before the boundary
                        RejectedReason::AgentDisconnected
                    }
                    Some(AgentStatus::Connected) => RejectedReason::Timeout,
                };
                records.push(ActionRecord::rejected(tick, agent, None, 0, reason));
            }

            for submission in submissions {
                let (outcome, on_time) = self.resolve(window, &submission, deadline);
                if on_time {
                    last_on_time = Some(submission.issued_at);
                }
                if outcome.is_applied() && submission.command.is_control() {
                    quit = true;
                }
                records.push(ActionRecord {
                    tick,
                    agent_id: agent,
                    command: Some(submission.command),
                    issued_at_ms: submission.issued_at_ms,
                    outcome,
                });
            }

            if let Some(deadline) = deadline {
                let spent_until = last_on_time.unwrap_or(deadline);
                let spent = spent_until.saturating_sub(window.opened_at);
                if let Some(slot) = self.agents.get_mut(&agent) {
                    slot.think_bank = slot.think_bank.saturating_sub(spent);
                }
            }
        }

        for record in &records {
            self.stats.record(&record.outcome);
            if let Some(reason) = record.outcome.rejection() {
                debug!(tick, agent = %record.agent_id, %reason, "command rejected");
            }
            if let Some(log) = &self.log {
                log.append(record.clone())?;
            }
        }

        self.world.step(self.config.dt());
        self.tick = tick;

        let ended = if quit {
            Some(EndReason::Quit)
        } else if tick >= self.config.limit_ticks() {
            Some(EndReason::TimeExpired)
        } else {
            None
        };
        if let Some(reason) = ended {
            self.end(reason)?;
        }

        Ok(TickReport {
            tick,
            records,
            snapshot: self.world.snapshot(tick),
            ended,
        })
    }

    /// Decides one submission. Returns the outcome and whether it was on time.
    fn resolve(
        &mut self,
        window: &TickWindow,
        submission: &Submission,
        deadline: Option<Duration>,
    ) -> (Outcome, bool) {
        let agent = submission.agent_id;
        let privileged = self
            .agents
            .get(&agent)
            .map(|s| s.info.role.is_privileged())
            .unwrap_or(false);

        if submission.tick != window.tick {
            return (Outcome::Rejected { reason: RejectedReason::Timeout }, false);
        }
        let on_time = match deadline {
            Some(deadline) => submission.issued_at <= deadline,
            // Controllers are never polled and may submit at any tick
            None => privileged,
        };
        if !on_time {
            return (Outcome::Rejected { reason: RejectedReason::Timeout }, false);
        }
        if let Err(reason) = self.limiter.check(agent, window.tick) {
            return (Outcome::Rejected { reason }, true);
        }

        let result = match &submission.command {
            Command::Quit if privileged => Ok(()),
            command => self.world.apply_command(window.tick, command),
        };
        (Outcome::from(result), true)
    }

    /// Re-applies one recorded tick (replay mode).
    ///
    /// Applied records must apply again, and records the World rejected must
    /// be rejected again for the same reason. Records rejected before reaching
    /// the World (`Timeout`, `RateLimited`, `AgentDisconnected`) are skipped.
    ///
    /// # Errors
    /// `CorruptActionLog` on any divergence.
    pub fn replay_tick(&mut self, records: &[ActionRecord]) -> Result<TickReport> {
        if !self.state.is_running() {
            return Err(SessionError::corrupt(format!(
                "records after the session ended at tick {}",
                self.tick
            )));
        }
        let tick = self.tick + 1;
        let mut quit = false;

        for record in records {
            if record.tick != tick {
                return Err(SessionError::corrupt(format!(
                    "record for tick {} fed at tick {}",
                    record.tick, tick
                )));
            }
            let privileged = self
                .agents
                .get(&record.agent_id)
                .map(|s| s.info.role.is_privileged())
                .ok_or_else(|| {
                    SessionError::corrupt(format!("unknown {} at tick {}", record.agent_id, tick))
                })?;

            match (&record.outcome, &record.command) {
                (Outcome::Applied, Some(Command::Quit)) if privileged => quit = true,
                (Outcome::Applied, Some(command)) => {
                    if let Err(reason) = self.world.apply_command(tick, command) {
                        return Err(SessionError::corrupt(format!(
                            "tick {}: {} was applied originally but replay rejected it ({})",
                            tick, record.agent_id, reason
                        )));
                    }
                }
                (Outcome::Applied, None) => {
                    return Err(SessionError::corrupt(format!(
                        "tick {}: applied record without a command",
                        tick
                    )));
                }
                (Outcome::Rejected { reason }, Some(command))
                    if matches!(
                        reason,
                        RejectedReason::InvalidTarget | RejectedReason::IllegalTransition
                    ) =>
                {
                    let replayed = match command {
                        Command::Quit if privileged => Ok(()),
                        command => self.world.apply_command(tick, command),
                    };
                    if replayed != Err(*reason) {
                        return Err(SessionError::corrupt(format!(
                            "tick {}: recorded {} but replay produced {:?}",
                            tick, reason, replayed
                        )));
                    }
                }
                _ => {}
            }
            self.stats.record(&record.outcome);
        }

        self.world.step(self.config.dt());
        self.tick = tick;

        let ended = if quit { Some(EndReason::Quit) } else { None };
        if let Some(reason) = ended {
            self.end(reason)?;
        }

        Ok(TickReport {
            tick,
            records: records.to_vec(),
            snapshot: self.world.snapshot(tick),
            ended,
        })
    }

    /// Ends the session now and finalizes the log. No-op if already ended.
    pub fn end(&mut self, reason: EndReason) -> Result<()> {
        if !self.state.is_running() {
            return Ok(());
        }
        self.state = SessionState::Ended(reason);
        info!(tick = self.tick, %reason, "session ended");
        if let Some(log) = &self.log {
            log.finalize(reason, self.tick)?;
        }
        Ok(())
    }

    /// External shutdown signal.
    pub fn quit(&mut self) -> Result<()> {
        self.end(EndReason::Quit)
    }
}
