//! Named simulation scenarios: who joins, what breaks, and what must hold.

use crate::bots::{BotBehavior, BotTuning};
use crate::network::NetworkStats;
use arena_core::{ActionLog, AgentId, EndReason, RejectedReason, SessionConfig, SessionSummary};
use serde::Serialize;
use std::time::Duration;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// One agent that never answers, two ticks, one-tick think budget
    SilentAgent,

    /// Two chasers on opposite teams with uneven latency
    Duel,

    /// One agent sending more commands than its rate budget
    RateFlood,

    /// An agent whose answers take longer than its think bank allows
    SlowThinker,

    /// An agent that drops its connection and comes back
    FlakyLink,

    /// The server cuts one agent off, then lets it back in
    Partition,

    /// A controller ends the session early
    ControllerQuit,

    /// Many agents with latency jitter
    Brawl,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SilentAgent,
            ScenarioId::Duel,
            ScenarioId::RateFlood,
            ScenarioId::SlowThinker,
            ScenarioId::FlakyLink,
            ScenarioId::Partition,
            ScenarioId::ControllerQuit,
            ScenarioId::Brawl,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SilentAgent => "silent_agent",
            ScenarioId::Duel => "duel",
            ScenarioId::RateFlood => "rate_flood",
            ScenarioId::SlowThinker => "slow_thinker",
            ScenarioId::FlakyLink => "flaky_link",
            ScenarioId::Partition => "partition",
            ScenarioId::ControllerQuit => "controller_quit",
            ScenarioId::Brawl => "brawl",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SilentAgent => "2-tick game, 1-tick think bank, agent never answers: two Timeouts",
            ScenarioId::Duel => "Two chasers on uneven links that flip halfway, applied in agent-id order",
            ScenarioId::RateFlood => "Spammer bursts 3 commands per ask; exactly floor(cps) accepted per window",
            ScenarioId::SlowThinker => "2s answers against a 5s bank: on time until the bank runs dry",
            ScenarioId::FlakyLink => "Agent drops after 5 asks and reconnects under the same id",
            ScenarioId::Partition => "Server severs one agent for a quarter of the game",
            ScenarioId::ControllerQuit => "Controller sends Quit after tick 30",
            ScenarioId::Brawl => "N chasers plus an idle agent, 5ms latency jitter",
        }
    }

    /// Builds the run plan.
    ///
    /// `agents` and `game_time_secs` only affect scenarios whose shape does
    /// not pin them.
    pub fn plan(&self, agents: usize, game_time_secs: f64, tick_rate_hz: u32) -> ScenarioPlan {
        let base = SessionConfig {
            game_time_secs,
            tick_rate_hz,
            ..SessionConfig::default()
        };
        let limit = base.limit_ticks();

        match self {
            ScenarioId::SilentAgent => ScenarioPlan::new(
                SessionConfig {
                    commands_per_second: tick_rate_hz as f64,
                    ..base
                }
                .with_game_ticks(2)
                .with_think_ticks(1),
            )
            .bot(BotSlot::new("mute", 0, BotBehavior::Silent)),

            ScenarioId::Duel => ScenarioPlan::new(base)
                .bot(BotSlot::new("red", 0, BotBehavior::Chaser).latency(40))
                .bot(BotSlot::new("blue", 1, BotBehavior::Chaser).latency(10))
                .fault(limit / 2, Fault::Latency("red".into(), 5)),

            ScenarioId::RateFlood => {
                let tuning = BotTuning {
                    think_time: Duration::from_millis(1),
                    think_jitter: Duration::ZERO,
                    ..BotTuning::default()
                };
                ScenarioPlan::new(base)
                    .latency(2)
                    .bot(BotSlot::new("flood", 0, BotBehavior::Spammer).tuning(tuning))
            }

            ScenarioId::SlowThinker => ScenarioPlan::new(SessionConfig {
                think_time_secs: 5.0,
                ..base
            })
            .bot(BotSlot::new("quick", 0, BotBehavior::Chaser))
            .bot(BotSlot::new("ponder", 1, BotBehavior::Slow)),

            ScenarioId::FlakyLink => ScenarioPlan::new(base)
                .bot(BotSlot::new("steady", 0, BotBehavior::Chaser))
                .bot(BotSlot::new("flaky", 1, BotBehavior::Flaky)),

            ScenarioId::Partition => ScenarioPlan::new(base)
                .bot(BotSlot::new("red", 0, BotBehavior::Chaser))
                .bot(BotSlot::new("blue", 1, BotBehavior::Chaser))
                .fault(limit / 4, Fault::Sever("blue".into()))
                .fault(limit / 2, Fault::Restore("blue".into())),

            ScenarioId::ControllerQuit => ScenarioPlan::new(SessionConfig {
                game_time_secs: game_time_secs.max(2.0),
                ..base
            })
            .bot(BotSlot::new("red", 0, BotBehavior::Chaser))
            .bot(BotSlot::new("ops", 0, BotBehavior::Quitter)),

            ScenarioId::Brawl => {
                let mut plan = ScenarioPlan::new(base).latency(10).jitter(5.0);
                let chasers = agents.max(2);
                for i in 0..chasers {
                    let team = (i % 2) as u8;
                    plan = plan.bot(BotSlot::new(format!("brawler-{}", i), team, BotBehavior::Chaser));
                }
                plan.bot(BotSlot::new("bystander", 0, BotBehavior::Idle))
            }
        }
    }

    /// Checks the scenario-specific expectations of a finished run.
    pub fn verify(&self, run: &ScenarioRun) -> Result<(), String> {
        let summary = &run.summary;
        match self {
            ScenarioId::SilentAgent => {
                expect_end(summary, EndReason::TimeExpired)?;
                if summary.ticks != 2 {
                    return Err(format!("expected 2 ticks, got {}", summary.ticks));
                }
                let timeouts = run.count("mute", RejectedReason::Timeout);
                if timeouts != 2 || run.log.len() != 2 || summary.applied != 0 {
                    return Err(format!(
                        "expected exactly 2 Timeout records and nothing applied, got {} timeouts / {} records / {} applied",
                        timeouts,
                        run.log.len(),
                        summary.applied
                    ));
                }
            }
            ScenarioId::Duel => {
                expect_end(summary, EndReason::TimeExpired)?;
                for name in ["red", "blue"] {
                    if run.applied(name) == 0 {
                        return Err(format!("{} never got a command applied", name));
                    }
                    if run.count(name, RejectedReason::Timeout) != 0 {
                        return Err(format!("{} timed out on a 150s bank", name));
                    }
                }
            }
            ScenarioId::RateFlood => {
                expect_end(summary, EndReason::TimeExpired)?;
                if run.count("flood", RejectedReason::RateLimited) == 0 {
                    return Err("no command was rate limited".into());
                }
                let budget = run.config.commands_per_second.floor() as u64;
                let window = run.config.tick_rate_hz as u64;
                let full_windows = run.summary.ticks / window;
                for w in 0..full_windows {
                    let range = (w * window + 1)..=((w + 1) * window);
                    let accepted = run
                        .log
                        .records()
                        .iter()
                        .filter(|r| range.contains(&r.tick) && r.outcome.is_applied())
                        .count() as u64;
                    if accepted != budget {
                        return Err(format!("window {} accepted {} commands, budget is {}", w, accepted, budget));
                    }
                }
                let bursts_intact = run
                    .log
                    .records()
                    .chunk_by(|a, b| a.tick == b.tick)
                    .all(|tick| tick.len() == 3 && tick.iter().all(|r| r.command.is_some()));
                if !bursts_intact {
                    return Err("a burst command is missing from the log".into());
                }
            }
            ScenarioId::SlowThinker => {
                expect_end(summary, EndReason::TimeExpired)?;
                if run.count("quick", RejectedReason::Timeout) != 0 {
                    return Err("the quick agent was penalized for the slow one".into());
                }
                if run.applied("ponder") == 0 {
                    return Err("slow agent never made it within its bank".into());
                }
                if run.count("ponder", RejectedReason::Timeout) == 0 {
                    return Err("slow agent never timed out".into());
                }
            }
            ScenarioId::FlakyLink => {
                expect_end(summary, EndReason::TimeExpired)?;
                expect_rejoined(run, "flaky")?;
                if run.log.metadata.agents.len() != 2 {
                    return Err(format!(
                        "reconnection created a new agent ({} in roster)",
                        run.log.metadata.agents.len()
                    ));
                }
            }
            ScenarioId::Partition => {
                expect_end(summary, EndReason::TimeExpired)?;
                expect_rejoined(run, "blue")?;
                if run.count("red", RejectedReason::AgentDisconnected) != 0 {
                    return Err("red was affected by blue's partition".into());
                }
            }
            ScenarioId::ControllerQuit => {
                expect_end(summary, EndReason::Quit)?;
                if !(31..=33).contains(&summary.ticks) {
                    return Err(format!("quit for tick 31 ended the session at tick {}", summary.ticks));
                }
            }
            ScenarioId::Brawl => {
                expect_end(summary, EndReason::TimeExpired)?;
                if summary.applied == 0 {
                    return Err("nothing was applied".into());
                }
            }
        }
        Ok(())
    }
}

fn expect_end(summary: &SessionSummary, reason: EndReason) -> Result<(), String> {
    match summary.end_reason {
        Some(r) if r == reason => Ok(()),
        other => Err(format!("expected end reason {}, got {:?}", reason, other)),
    }
}

/// Disconnected at some poll, then answering again afterwards.
fn expect_rejoined(run: &ScenarioRun, username: &str) -> Result<(), String> {
    let agent = run
        .agent(username)
        .ok_or_else(|| format!("{} is not in the roster", username))?;
    let gone_at = run
        .log
        .records()
        .iter()
        .find(|r| r.agent_id == agent && r.outcome.rejection() == Some(RejectedReason::AgentDisconnected))
        .map(|r| r.tick)
        .ok_or_else(|| format!("{} was never recorded as disconnected", username))?;
    let back = run
        .log
        .records()
        .iter()
        .any(|r| r.agent_id == agent && r.tick > gone_at && r.command.is_some());
    if !back {
        return Err(format!("{} sent nothing after tick {}", username, gone_at));
    }
    if run.network.reconnects == 0 {
        return Err("no reconnection happened".into());
    }
    Ok(())
}

/// A network fault injected before a given tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Sever(String),
    Restore(String),
    Latency(String, u64),
}

/// One scripted participant.
#[derive(Debug, Clone)]
pub struct BotSlot {
    pub username: String,
    pub team: u8,
    pub behavior: BotBehavior,
    pub tuning: BotTuning,

    /// One-way latency override (ms)
    pub latency_ms: Option<u64>,
}

impl BotSlot {
    pub fn new(username: impl Into<String>, team: u8, behavior: BotBehavior) -> Self {
        Self {
            username: username.into(),
            team,
            behavior,
            tuning: BotTuning::default(),
            latency_ms: None,
        }
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn tuning(mut self, tuning: BotTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

/// Everything the runner needs to play a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub config: SessionConfig,
    pub bots: Vec<BotSlot>,

    /// Faults applied before the tick they are keyed with
    pub faults: Vec<(u64, Fault)>,

    /// Default one-way latency (ms)
    pub latency_ms: u64,
    pub jitter_ms: f64,
}

impl ScenarioPlan {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            bots: Vec::new(),
            faults: Vec::new(),
            latency_ms: 10,
            jitter_ms: 0.0,
        }
    }

    pub fn bot(mut self, slot: BotSlot) -> Self {
        self.bots.push(slot);
        self
    }

    pub fn fault(mut self, tick: u64, fault: Fault) -> Self {
        self.faults.push((tick, fault));
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn jitter(mut self, ms: f64) -> Self {
        self.jitter_ms = ms;
        self
    }

    /// Bots that get a player entity.
    pub fn players(&self) -> usize {
        self.bots
            .iter()
            .filter(|b| b.behavior.role().is_polled())
            .count()
    }

    pub fn faults_before(&self, tick: u64) -> impl Iterator<Item = &Fault> {
        self.faults.iter().filter(move |(t, _)| *t == tick).map(|(_, f)| f)
    }
}

/// What a finished run left behind.
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub config: SessionConfig,
    pub summary: SessionSummary,
    pub log: ActionLog,
    pub network: NetworkStats,
}

impl ScenarioRun {
    pub fn agent(&self, username: &str) -> Option<AgentId> {
        self.log
            .metadata
            .agents
            .iter()
            .find(|a| a.username == username)
            .map(|a| a.agent_id)
    }

    /// Records of `username` rejected for `reason`.
    pub fn count(&self, username: &str, reason: RejectedReason) -> usize {
        let Some(agent) = self.agent(username) else {
            return 0;
        };
        self.log
            .records()
            .iter()
            .filter(|r| r.agent_id == agent && r.outcome.rejection() == Some(reason))
            .count()
    }

    pub fn applied(&self, username: &str) -> usize {
        let Some(agent) = self.agent(username) else {
            return 0;
        };
        self.log
            .records()
            .iter()
            .filter(|r| r.agent_id == agent && r.outcome.is_applied())
            .count()
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent_agent" | "silent" => Ok(ScenarioId::SilentAgent),
            "duel" => Ok(ScenarioId::Duel),
            "rate_flood" | "flood" => Ok(ScenarioId::RateFlood),
            "slow_thinker" | "slow" => Ok(ScenarioId::SlowThinker),
            "flaky_link" | "flaky" => Ok(ScenarioId::FlakyLink),
            "partition" => Ok(ScenarioId::Partition),
            "controller_quit" | "quit" => Ok(ScenarioId::ControllerQuit),
            "brawl" => Ok(ScenarioId::Brawl),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_silent_agent_plan_is_pinned() {
        let plan = ScenarioId::SilentAgent.plan(8, 60.0, 60);
        assert_eq!(plan.config.limit_ticks(), 2);
        assert_eq!(plan.config.poll_interval_ticks(), 1);
        assert_eq!(plan.config.think_time(), plan.config.tick_duration());
        assert_eq!(plan.players(), 1);
    }

    #[test]
    fn test_partition_faults_are_ordered() {
        let plan = ScenarioId::Partition.plan(2, 10.0, 60);
        assert_eq!(plan.faults_before(150).collect::<Vec<_>>(), vec![&Fault::Sever("blue".into())]);
        assert_eq!(plan.faults_before(300).collect::<Vec<_>>(), vec![&Fault::Restore("blue".into())]);
        assert_eq!(plan.faults_before(1).count(), 0);
    }

    #[test]
    fn test_brawl_scales_with_agents() {
        let plan = ScenarioId::Brawl.plan(6, 10.0, 60);
        assert_eq!(plan.players(), 7);
        assert!(plan.jitter_ms > 0.0);
    }

    #[test]
    fn test_controller_is_not_a_player() {
        let plan = ScenarioId::ControllerQuit.plan(2, 0.5, 60);
        assert_eq!(plan.players(), 1);
        assert!(plan.config.game_time_secs >= 2.0);
    }
}
