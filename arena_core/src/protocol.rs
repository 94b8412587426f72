//! Wire protocol between the server and agents.
//!
//! One JSON document per frame, discriminated by a `header` field:
//!
//! ```text
//! agent  ── HELLO {username, team, role} ────────────────► server
//! agent  ◄─ WELCOME {agent_id, entity, tick, snapshot} ─── server
//! agent  ◄─ ASK_COMMAND {tick, snapshot} ───────────────── server   (every poll interval)
//! agent  ── COMMAND {agent_id, tick, payload} ───────────► server
//! all    ◄─ SNAPSHOT {snapshot} ────────────────────────── server   (every tick)
//! all    ◄─ GAME_FINISHED {reason, final_tick, result} ─── server
//! peer   ◄─ ABORT {error, blame} ───────────────────────── server
//! ```

use crate::action_log::EndReason;
use crate::command::Command;
use crate::types::{AgentId, EntityId, Role};
use crate::world::{MatchResult, Snapshot};
use arena_env::{EnvError, WireEnvelope};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "header", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// First frame from every connection
    Hello {
        username: String,
        #[serde(default)]
        team: u8,
        #[serde(default)]
        role: Role,
    },

    /// Handshake accepted (also sent on reconnection)
    Welcome {
        agent_id: AgentId,
        entity: Option<EntityId>,
        tick: u64,
        snapshot: Snapshot,
    },

    /// Think window opened for `tick`; `snapshot` is the state before it
    AskCommand { tick: u64, snapshot: Snapshot },

    /// Authoritative state after a tick
    Snapshot { snapshot: Snapshot },

    Command {
        agent_id: AgentId,
        tick: u64,
        payload: Command,
    },

    GameFinished {
        reason: EndReason,
        final_tick: u64,
        #[serde(default)]
        result: MatchResult,
    },

    /// Connection refused or terminated; `blame` names the offending agent
    Abort {
        error: String,
        blame: Option<AgentId>,
    },
}

impl WireMessage {
    /// Header name, for logging.
    pub fn header(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "HELLO",
            WireMessage::Welcome { .. } => "WELCOME",
            WireMessage::AskCommand { .. } => "ASK_COMMAND",
            WireMessage::Snapshot { .. } => "SNAPSHOT",
            WireMessage::Command { .. } => "COMMAND",
            WireMessage::GameFinished { .. } => "GAME_FINISHED",
            WireMessage::Abort { .. } => "ABORT",
        }
    }

    /// Snapshot carried by this message, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            WireMessage::Welcome { snapshot, .. }
            | WireMessage::AskCommand { snapshot, .. }
            | WireMessage::Snapshot { snapshot } => Some(snapshot),
            _ => None,
        }
    }

    pub fn encode(&self, timestamp_ms: u64) -> Result<WireEnvelope, EnvError> {
        let payload = serde_json::to_vec(self).map_err(EnvError::serialization)?;
        Ok(WireEnvelope::new(payload, timestamp_ms))
    }

    pub fn decode(envelope: &WireEnvelope) -> Result<Self, EnvError> {
        serde_json::from_slice(&envelope.payload).map_err(EnvError::serialization)
    }
}
