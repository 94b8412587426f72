//! Replay: re-executes a recorded action log against a fresh World.
//!
//! No network and no prediction. The World is rebuilt from the scene and the
//! logged roster, then each tick is fed exactly its recorded records. Any
//! divergence from the recorded outcomes fails fast with `CorruptActionLog`.

use super::{Mode, Session, SessionSummary};
use crate::action_log::{ActionLog, AgentInfo, EndReason};
use crate::command::Command;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::scene::SceneDefinition;
use crate::scheduler::{Scheduler, SessionState};
use crate::types::{AgentId, Role};
use crate::world::Snapshot;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

pub struct ReplaySession {
    log: ActionLog,
    scheduler: Scheduler,
}

impl ReplaySession {
    /// Loads and validates a log file.
    pub fn from_file(path: impl AsRef<Path>, scene: &SceneDefinition) -> Result<Self> {
        let log = ActionLog::load(path)?;
        Self::new(log, scene)
    }

    /// # Errors
    /// `CorruptActionLog` if the log is malformed or its roster does not
    /// reproduce the recorded player entities; `ConfigurationInvalid` for a
    /// bad scene.
    pub fn new(log: ActionLog, scene: &SceneDefinition) -> Result<Self> {
        log.validate()?;
        if log.metadata.scene != scene.name {
            warn!(
                recorded = %log.metadata.scene,
                given = %scene.name,
                "replaying against a different scene"
            );
        }

        let config = SessionConfig::from_metadata(&log.metadata);
        let mut world = scene.build_world()?;

        let mut roster: Vec<AgentInfo> = log.metadata.agents.clone();
        roster.sort_by_key(|a| a.agent_id);
        for info in &roster {
            if info.role != Role::Agent {
                continue;
            }
            let entity = scene.spawn_player(&mut world, &info.username, info.team)?;
            if info.entity != Some(entity) {
                return Err(SessionError::corrupt(format!(
                    "{} recorded entity {:?} but the scene spawns {}",
                    info.agent_id, info.entity, entity
                )));
            }
        }

        let mut scheduler = Scheduler::new(world, config, None)?;
        for info in roster {
            scheduler.register_agent(info)?;
        }

        info!(
            session = %log.metadata.session_id,
            records = log.len(),
            final_tick = log.final_tick(),
            "replay loaded"
        );
        Ok(Self { log, scheduler })
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[async_trait]
impl Session for ReplaySession {
    fn mode(&self) -> Mode {
        Mode::Replay
    }

    async fn tick(&mut self) -> Result<u64> {
        if !self.scheduler.state().is_running() {
            return Ok(self.scheduler.tick());
        }
        if self.scheduler.tick() >= self.log.final_tick() {
            self.scheduler.end(EndReason::LogExhausted)?;
            return Ok(self.scheduler.tick());
        }

        let tick = self.scheduler.tick() + 1;
        let records = self.log.records_for_tick(tick);
        let report = self.scheduler.replay_tick(records)?;
        debug!(tick, records = records.len(), "tick replayed");

        if report.tick >= self.log.final_tick() && self.scheduler.state().is_running() {
            self.scheduler.end(EndReason::LogExhausted)?;
        }
        Ok(report.tick)
    }

    async fn apply_command(&mut self, agent: AgentId, _command: Command) -> Result<()> {
        Err(SessionError::config(format!(
            "replay accepts no commands (from {})",
            agent
        )))
    }

    fn snapshot(&self) -> Snapshot {
        self.scheduler.world().snapshot(self.scheduler.tick())
    }

    fn state(&self) -> SessionState {
        self.scheduler.state()
    }

    fn interrupt(&mut self) -> Result<()> {
        self.scheduler.quit()
    }

    fn summary(&self) -> SessionSummary {
        let stats = self.scheduler.stats();
        SessionSummary {
            mode: Mode::Replay,
            end_reason: self.scheduler.state().end_reason(),
            ticks: self.scheduler.tick(),
            applied: stats.applied,
            rejected: stats.rejected.clone(),
            state_hash: self.scheduler.world().state_hash(),
            result: self.scheduler.world().match_result(),
            recorded_end: self.log.end_reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::{ActionRecord, SessionMetadata, SharedActionLog};
    use crate::error::RejectedReason;
    use crate::modes::run_session;
    use crate::scheduler::Submission;
    use crate::types::EntityId;
    use arena_env::SessionId;
    use std::time::Duration;

    fn roster() -> Vec<AgentInfo> {
        vec![
            AgentInfo {
                agent_id: AgentId(1),
                username: "red".to_string(),
                team: 0,
                role: Role::Agent,
                entity: Some(EntityId(3)),
            },
            AgentInfo {
                agent_id: AgentId(2),
                username: "blue".to_string(),
                team: 1,
                role: Role::Agent,
                entity: Some(EntityId(4)),
            },
        ]
    }

    /// Plays a short live session on the arena scene and returns its log and final hash.
    fn record(ticks: u64) -> (ActionLog, u64) {
        let scene = SceneDefinition::arena();
        let config = SessionConfig {
            commands_per_second: 60.0,
            ..SessionConfig::default()
        }
        .with_game_ticks(ticks);
        let metadata = SessionMetadata {
            session_id: SessionId::from_seed(1),
            game_time_secs: config.game_time_secs,
            think_time_secs: config.think_time_secs,
            commands_per_second: config.commands_per_second,
            tick_rate_hz: config.tick_rate_hz,
            scene: scene.name.clone(),
            agents: Vec::new(),
        };
        let log = SharedActionLog::new(ActionLog::new(metadata));
        let mut world = scene.build_world().unwrap();
        for info in roster() {
            scene.spawn_player(&mut world, &info.username, info.team).unwrap();
        }
        let mut scheduler = Scheduler::new(world, config, Some(log.clone())).unwrap();
        for info in roster() {
            scheduler.register_agent(info).unwrap();
        }

        let script = |tick: u64, agent: u32| -> Option<Command> {
            match (tick, agent) {
                (1, 1) => Some(Command::Move { entity: EntityId(3), direction: [1.0, 0.0, 0.0] }),
                (1, 2) => Some(Command::Shoot { entity: EntityId(4), target: EntityId(3) }),
                (2, 1) => Some(Command::Shoot { entity: EntityId(3), target: EntityId(1) }),
                (2, 2) => Some(Command::Move { entity: EntityId(4), direction: [0.0, 1.0, 0.0] }),
                (3, 2) => Some(Command::Stop { entity: EntityId(99) }),
                (4, 2) => Some(Command::Shoot { entity: EntityId(4), target: EntityId(3) }),
                // Agent 2 keeps answering so its think bank is never spent waiting
                (_, 2) => Some(Command::Stop { entity: EntityId(4) }),
                _ => None,
            }
        };

        let mut arrival = 0;
        while scheduler.state().is_running() {
            let now = Duration::from_millis(scheduler.tick() * 20);
            let window = scheduler.open_tick(now).unwrap();
            let mut submissions = Vec::new();
            for agent in [2u32, 1] {
                if let Some(command) = script(window.tick, agent) {
                    submissions.push(Submission {
                        agent_id: AgentId(agent),
                        tick: window.tick,
                        command,
                        issued_at: now + Duration::from_millis(5),
                        issued_at_ms: 1_000 + arrival,
                        arrival,
                    });
                    arrival += 1;
                }
            }
            scheduler.close_tick(&window, submissions).unwrap();
        }
        (log.to_log(), scheduler.world().state_hash())
    }

    #[tokio::test]
    async fn test_replay_reproduces_live_session() {
        let (log, live_hash) = record(6);
        let outcomes: Vec<_> = log.records().iter().map(|r| r.outcome.rejection()).collect();
        assert!(outcomes.contains(&Some(RejectedReason::InvalidTarget)));
        assert!(outcomes.contains(&Some(RejectedReason::IllegalTransition)));

        let mut replay = ReplaySession::new(log, &SceneDefinition::arena()).unwrap();
        let summary = run_session(&mut replay).await.unwrap();

        assert_eq!(summary.end_reason, Some(EndReason::LogExhausted));
        assert_eq!(summary.recorded_end, Some(EndReason::TimeExpired));
        assert_eq!(summary.ticks, 6);
        assert_eq!(summary.state_hash, live_hash);
        // Blue shot red once (tick 1); red's shot at tick 2 hit a dummy
        assert_eq!(summary.result.winner, None);
        assert!(summary.result.scores.iter().all(|s| s.score == 5.0));
    }

    #[tokio::test]
    async fn test_quit_log_reports_its_recorded_end() {
        let (mut log, _) = record(3);
        let mut json: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        json["end_reason"] = serde_json::json!("quit");
        log = ActionLog::from_json(&json.to_string()).unwrap();

        let mut replay = ReplaySession::new(log, &SceneDefinition::arena()).unwrap();
        let summary = run_session(&mut replay).await.unwrap();
        assert_eq!(summary.end_reason, Some(EndReason::LogExhausted));
        assert_eq!(summary.recorded_end, Some(EndReason::Quit));
    }

    #[test]
    fn test_oversized_think_time_is_corrupt() {
        let (mut log, _) = record(2);
        log.metadata.think_time_secs = 1e20;
        assert!(matches!(
            ReplaySession::new(log, &SceneDefinition::arena()),
            Err(SessionError::CorruptActionLog(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_outcome_fails_fast() {
        let (log, _) = record(6);
        let mut json: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        let records = json["records"].as_array_mut().unwrap();
        let invalid = records
            .iter_mut()
            .find(|r| r["outcome"]["reason"] == "invalid_target")
            .unwrap();
        invalid["outcome"] = serde_json::json!({"status": "applied"});
        let tampered = ActionLog::from_json(&json.to_string()).unwrap();

        let mut replay = ReplaySession::new(tampered, &SceneDefinition::arena()).unwrap();
        let result = run_session(&mut replay).await;
        assert!(matches!(result, Err(SessionError::CorruptActionLog(_))));
    }

    #[test]
    fn test_roster_mismatch_is_corrupt() {
        let (mut log, _) = record(2);
        log.metadata.agents[0].entity = Some(EntityId(9));
        assert!(matches!(
            ReplaySession::new(log, &SceneDefinition::arena()),
            Err(SessionError::CorruptActionLog(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_refuses_commands() {
        let (log, _) = record(2);
        let mut replay = ReplaySession::new(log, &SceneDefinition::arena()).unwrap();
        assert!(replay.apply_command(AgentId(1), Command::Quit).await.is_err());
    }

    #[test]
    fn test_records_without_command_are_kept() {
        let (log, _) = record(6);
        // Agent 1 is silent from tick 3 on
        let silent: Vec<&ActionRecord> = log
            .records()
            .iter()
            .filter(|r| r.agent_id == AgentId(1) && r.command.is_none())
            .collect();
        assert_eq!(silent.len(), 4);
        assert!(silent
            .iter()
            .all(|r| r.outcome.rejection() == Some(RejectedReason::Timeout)));
    }
}
