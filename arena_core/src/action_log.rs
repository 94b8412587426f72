//! Action Log - the ordered, append-only history of a session.
//!
//! Every command the scheduler resolves (applied or rejected) becomes one
//! [`ActionRecord`]. Together with the [`SessionMetadata`] captured at record
//! time, the log is sufficient to reproduce a session without live agents.
//!
//! # Lifecycle
//!
//! ```text
//!   new(metadata) ──append()*──► finalize(reason, tick) ──save()──► file
//!                                                                    │
//!   replay: load() ──validate()──► records_for_tick(t) ◄─────────────┘
//! ```
//!
//! A finalized log is never mutated again.

use crate::command::Command;
use crate::config::MAX_THINK_TIME_SECS;
use crate::error::{RejectedReason, Result, SessionError};
use crate::types::{AgentId, EntityId, Role};
use arena_env::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Result of resolving one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Rejected { reason: RejectedReason },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }

    /// The rejection reason, if any.
    pub fn rejection(&self) -> Option<RejectedReason> {
        match self {
            Outcome::Applied => None,
            Outcome::Rejected { reason } => Some(*reason),
        }
    }
}

impl From<std::result::Result<(), RejectedReason>> for Outcome {
    fn from(result: std::result::Result<(), RejectedReason>) -> Self {
        match result {
            Ok(()) => Outcome::Applied,
            Err(reason) => Outcome::Rejected { reason },
        }
    }
}

/// One resolved command. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Tick the command was resolved in (first tick is 1)
    pub tick: u64,

    /// Submitting agent
    pub agent_id: AgentId,

    /// The command as submitted (absent for no-show records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    /// Wall-clock milliseconds when the command was issued
    pub issued_at_ms: u64,

    pub outcome: Outcome,
}

impl ActionRecord {
    pub fn applied(tick: u64, agent_id: AgentId, command: Command, issued_at_ms: u64) -> Self {
        Self {
            tick,
            agent_id,
            command: Some(command),
            issued_at_ms,
            outcome: Outcome::Applied,
        }
    }

    pub fn rejected(
        tick: u64,
        agent_id: AgentId,
        command: Option<Command>,
        issued_at_ms: u64,
        reason: RejectedReason,
    ) -> Self {
        Self {
            tick,
            agent_id,
            command,
            issued_at_ms,
            outcome: Outcome::Rejected { reason },
        }
    }

    /// Ordering key within a log.
    pub fn key(&self) -> (u64, AgentId) {
        (self.tick, self.agent_id)
    }
}

/// Roster entry recorded in the log metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub username: String,
    pub team: u8,
    pub role: Role,

    /// Player entity spawned for this agent (agents only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityId>,
}

/// Budgets and context captured when the session started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,

    /// Game-time limit in seconds
    pub game_time_secs: f64,

    /// Per-agent think-time bank in seconds
    pub think_time_secs: f64,

    /// Per-agent command-rate limit
    pub commands_per_second: f64,

    /// Fixed tick rate of the session clock
    pub tick_rate_hz: u32,

    /// Name of the scene the World was built from
    pub scene: String,

    /// Everyone who joined, in handshake order
    pub agents: Vec<AgentInfo>,
}

impl SessionMetadata {
    pub fn agent(&self, agent_id: AgentId) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}

/// Why a session ended. Normal termination, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    TimeExpired,
    Quit,
    LogExhausted,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndReason::TimeExpired => "time_expired",
            EndReason::Quit => "quit",
            EndReason::LogExhausted => "log_exhausted",
        };
        write!(f, "{}", name)
    }
}

/// Ordered records plus session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub metadata: SessionMetadata,
    records: Vec<ActionRecord>,

    /// Set by `finalize`
    #[serde(default)]
    end_reason: Option<EndReason>,

    #[serde(default)]
    final_tick: u64,
}

impl ActionLog {
    /// Creates an empty, open log.
    pub fn new(metadata: SessionMetadata) -> Self {
        Self {
            metadata,
            records: Vec::new(),
            end_reason: None,
            final_tick: 0,
        }
    }

    /// Appends one record.
    ///
    /// # Errors
    /// * `LogFinalized` - the log is closed
    /// * `CorruptActionLog` - the record sorts before the last one
    pub fn append(&mut self, record: ActionRecord) -> Result<()> {
        if self.is_finalized() {
            return Err(SessionError::LogFinalized);
        }
        if let Some(last) = self.records.last() {
            if record.key() < last.key() {
                return Err(SessionError::corrupt(format!(
                    "record ({}, {}) appended after ({}, {})",
                    record.tick, record.agent_id, last.tick, last.agent_id
                )));
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Closes the log. Further appends fail.
    pub fn finalize(&mut self, reason: EndReason, final_tick: u64) -> Result<()> {
        if self.is_finalized() {
            return Err(SessionError::LogFinalized);
        }
        self.end_reason = Some(reason);
        self.final_tick = final_tick;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.end_reason.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// Last tick the recorded session processed.
    pub fn final_tick(&self) -> u64 {
        self.final_tick
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one tick, in recorded order.
    pub fn records_for_tick(&self, tick: u64) -> &[ActionRecord] {
        let start = self.records.partition_point(|r| r.tick < tick);
        let end = self.records.partition_point(|r| r.tick <= tick);
        &self.records[start..end]
    }

    /// Checks every structural invariant a replay depends on.
    ///
    /// # Errors
    /// `CorruptActionLog` naming the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !self.is_finalized() {
            return Err(SessionError::corrupt("log was never finalized"));
        }

        let meta = &self.metadata;
        if meta.tick_rate_hz == 0 {
            return Err(SessionError::corrupt("tick rate is zero"));
        }
        if !(meta.commands_per_second >= 1.0) {
            return Err(SessionError::corrupt(format!(
                "commands per second {} below 1",
                meta.commands_per_second
            )));
        }
        if !(meta.game_time_secs > 0.0) || !(meta.think_time_secs >= 0.0) {
            return Err(SessionError::corrupt("non-positive time budget"));
        }
        if !(meta.think_time_secs <= MAX_THINK_TIME_SECS) {
            return Err(SessionError::corrupt(format!(
                "think time {}s above {}s",
                meta.think_time_secs, MAX_THINK_TIME_SECS
            )));
        }

        let mut seen = BTreeSet::new();
        for agent in &meta.agents {
            if !seen.insert(agent.agent_id) {
                return Err(SessionError::corrupt(format!(
                    "agent {} listed twice",
                    agent.agent_id
                )));
            }
        }

        let mut previous: Option<(u64, AgentId)> = None;
        for (index, record) in self.records.iter().enumerate() {
            let at = |msg: String| SessionError::corrupt(format!("record #{}: {}", index, msg));

            if record.tick == 0 || record.tick > self.final_tick {
                return Err(at(format!(
                    "tick {} outside 1..={}",
                    record.tick, self.final_tick
                )));
            }
            if let Some(prev) = previous {
                if record.key() < prev {
                    return Err(at("out of (tick, agent) order".to_string()));
                }
            }
            previous = Some(record.key());

            let agent = meta
                .agent(record.agent_id)
                .ok_or_else(|| at(format!("unknown {}", record.agent_id)))?;

            match (&record.outcome, &record.command) {
                (Outcome::Applied, None) => {
                    return Err(at("applied record without a command".to_string()));
                }
                (Outcome::Applied, Some(Command::Quit)) if !agent.role.is_privileged() => {
                    return Err(at(format!("quit applied for unprivileged {}", agent.agent_id)));
                }
                (Outcome::Rejected { reason }, None)
                    if !matches!(
                        reason,
                        RejectedReason::Timeout | RejectedReason::AgentDisconnected
                    ) =>
                {
                    return Err(at(format!("{} record without a command", reason)));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Writes the log as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::from)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads and validates a log file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let log: ActionLog =
            serde_json::from_reader(reader).map_err(|e| SessionError::corrupt(e.to_string()))?;
        log.validate()?;
        Ok(log)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SessionError::Io(e.into()))
    }

    /// Parses and validates a log from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let log: ActionLog =
            serde_json::from_str(json).map_err(|e| SessionError::corrupt(e.to_string()))?;
        log.validate()?;
        Ok(log)
    }
}

/// An action log shared between the scheduler (single appender) and any
/// number of lagging readers.
#[derive(Debug, Clone)]
pub struct SharedActionLog {
    inner: Arc<RwLock<ActionLog>>,
}

impl SharedActionLog {
    pub fn new(log: ActionLog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(log)),
        }
    }

    pub fn append(&self, record: ActionRecord) -> Result<()> {
        self.inner
            .write()
            .expect("action log lock poisoned")
            .append(record)
    }

    pub fn finalize(&self, reason: EndReason, final_tick: u64) -> Result<()> {
        self.inner
            .write()
            .expect("action log lock poisoned")
            .finalize(reason, final_tick)
    }

    /// Adds an agent to the roster (only while the log is open).
    pub fn register_agent(&self, info: AgentInfo) -> Result<()> {
        let mut log = self.inner.write().expect("action log lock poisoned");
        if log.is_finalized() {
            return Err(SessionError::LogFinalized);
        }
        log.metadata.agents.retain(|a| a.agent_id != info.agent_id);
        log.metadata.agents.push(info);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("action log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.inner
            .read()
            .expect("action log lock poisoned")
            .is_finalized()
    }

    /// Point-in-time copy of the whole log.
    pub fn to_log(&self) -> ActionLog {
        self.inner.read().expect("action log lock poisoned").clone()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.read().expect("action log lock poisoned").save(path)
    }

    /// Creates a reader positioned at the first record.
    pub fn reader(&self) -> ActionLogReader {
        ActionLogReader {
            log: self.clone(),
            cursor: 0,
        }
    }
}

/// Tails a [`SharedActionLog`] for audit while the session is still running.
#[derive(Debug)]
pub struct ActionLogReader {
    log: SharedActionLog,
    cursor: usize,
}

impl ActionLogReader {
    /// Returns every record appended since the previous poll.
    pub fn poll(&mut self) -> Vec<ActionRecord> {
        let log = self.log.inner.read().expect("action log lock poisoned");
        let fresh = log.records()[self.cursor..].to_vec();
        self.cursor = log.len();
        fresh
    }

    /// True once the log is finalized and every record has been read.
    pub fn is_drained(&self) -> bool {
        let log = self.log.inner.read().expect("action log lock poisoned");
        log.is_finalized() && self.cursor == log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            session_id: SessionId::from_seed(1),
            game_time_secs: 1.0,
            think_time_secs: 1.0,
            commands_per_second: 4.0,
            tick_rate_hz: 60,
            scene: "test".to_string(),
            agents: vec![
                AgentInfo {
                    agent_id: AgentId(1),
                    username: "alice".to_string(),
                    team: 0,
                    role: Role::Agent,
                    entity: Some(EntityId(1)),
                },
                AgentInfo {
                    agent_id: AgentId(2),
                    username: "bob".to_string(),
                    team: 1,
                    role: Role::Agent,
                    entity: Some(EntityId(2)),
                },
            ],
        }
    }

    fn stop(entity: u32) -> Command {
        Command::Stop { entity: EntityId(entity) }
    }

    #[test]
    fn test_append_after_finalize_fails() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(1, AgentId(1), stop(1), 0)).unwrap();
        log.finalize(EndReason::TimeExpired, 1).unwrap();

        let result = log.append(ActionRecord::applied(1, AgentId(2), stop(2), 0));
        assert!(matches!(result, Err(SessionError::LogFinalized)));
        assert!(log.finalize(EndReason::Quit, 2).is_err());
        assert_eq!(log.end_reason(), Some(EndReason::TimeExpired));
    }

    #[test]
    fn test_out_of_order_append_is_rejected() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(2, AgentId(1), stop(1), 0)).unwrap();
        assert!(log.append(ActionRecord::applied(1, AgentId(2), stop(2), 0)).is_err());
        // Same key twice is fine (arrival order tie)
        log.append(ActionRecord::applied(2, AgentId(1), stop(1), 0)).unwrap();
    }

    #[test]
    fn test_records_for_tick() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(1, AgentId(1), stop(1), 0)).unwrap();
        log.append(ActionRecord::applied(3, AgentId(1), stop(1), 0)).unwrap();
        log.append(ActionRecord::applied(3, AgentId(2), stop(2), 0)).unwrap();

        assert_eq!(log.records_for_tick(1).len(), 1);
        assert!(log.records_for_tick(2).is_empty());
        let tick3 = log.records_for_tick(3);
        assert_eq!(tick3.len(), 2);
        assert_eq!(tick3[0].agent_id, AgentId(1));
        assert_eq!(tick3[1].agent_id, AgentId(2));
    }

    #[test]
    fn test_json_round_trip_preserves_outcomes() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::rejected(1, AgentId(1), None, 5, RejectedReason::Timeout))
            .unwrap();
        log.append(ActionRecord::rejected(
            2,
            AgentId(2),
            Some(stop(9)),
            7,
            RejectedReason::InvalidTarget,
        ))
        .unwrap();
        log.finalize(EndReason::TimeExpired, 2).unwrap();

        let back = ActionLog::from_json(&log.to_json().unwrap()).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn test_validate_rejects_unfinalized_log() {
        let log = ActionLog::new(metadata());
        assert!(matches!(log.validate(), Err(SessionError::CorruptActionLog(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_agent() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(1, AgentId(7), stop(1), 0)).unwrap();
        log.finalize(EndReason::TimeExpired, 1).unwrap();
        assert!(matches!(log.validate(), Err(SessionError::CorruptActionLog(_))));
    }

    #[test]
    fn test_validate_rejects_record_past_final_tick() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(4, AgentId(1), stop(1), 0)).unwrap();
        log.finalize(EndReason::TimeExpired, 3).unwrap();
        assert!(log.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_think_time() {
        for think_time_secs in [1e20, f64::INFINITY, f64::NAN] {
            let mut log = ActionLog::new(SessionMetadata { think_time_secs, ..metadata() });
            log.finalize(EndReason::TimeExpired, 1).unwrap();
            assert!(matches!(log.validate(), Err(SessionError::CorruptActionLog(_))));
        }
    }

    #[test]
    fn test_validate_rejects_unprivileged_quit() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(1, AgentId(1), Command::Quit, 0)).unwrap();
        log.finalize(EndReason::Quit, 1).unwrap();
        assert!(log.validate().is_err());
    }

    #[test]
    fn test_tampered_json_is_corrupt() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(2, AgentId(1), stop(1), 0)).unwrap();
        log.append(ActionRecord::applied(2, AgentId(2), stop(2), 0)).unwrap();
        log.finalize(EndReason::TimeExpired, 2).unwrap();

        // Swap agent ids so the second record sorts before the first
        let mut value = serde_json::to_value(&log).unwrap();
        value["records"][0]["agent_id"] = serde_json::json!(2);
        value["records"][1]["agent_id"] = serde_json::json!(1);
        let result = ActionLog::from_json(&value.to_string());
        assert!(matches!(result, Err(SessionError::CorruptActionLog(_))));

        let garbage = ActionLog::from_json("{\"metadata\": 3}");
        assert!(matches!(garbage, Err(SessionError::CorruptActionLog(_))));
    }

    #[test]
    fn test_reader_tails_concurrent_appends() {
        let shared = SharedActionLog::new(ActionLog::new(metadata()));
        let mut reader = shared.reader();
        assert!(reader.poll().is_empty());

        shared.append(ActionRecord::applied(1, AgentId(1), stop(1), 0)).unwrap();
        shared.append(ActionRecord::applied(1, AgentId(2), stop(2), 0)).unwrap();
        assert_eq!(reader.poll().len(), 2);

        shared.append(ActionRecord::applied(2, AgentId(1), stop(1), 0)).unwrap();
        assert!(!reader.is_drained());
        shared.finalize(EndReason::TimeExpired, 2).unwrap();
        let last = reader.poll();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].tick, 2);
        assert!(reader.is_drained());
    }

    #[test]
    fn test_save_and_load_file() {
        let mut log = ActionLog::new(metadata());
        log.append(ActionRecord::applied(1, AgentId(1), stop(1), 3)).unwrap();
        log.finalize(EndReason::Quit, 1).unwrap();

        let path = std::env::temp_dir().join(format!("arena-log-{}.json", uuid::Uuid::new_v4()));
        log.save(&path).unwrap();
        let loaded = ActionLog::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, log);
    }
}
