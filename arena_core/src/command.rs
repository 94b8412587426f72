//! The command grammar agents speak.
//!
//! Commands are pure functions of World state: applying the same command to
//! the same World always yields the same World. Prediction relies on this to
//! re-apply queued commands during reconciliation.

use crate::component::ComponentKind;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};

/// A request to change the World.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type", rename_all = "snake_case")]
pub enum Command {
    /// Head in `direction` at the entity's maximum speed (zero vector stops)
    Move { entity: EntityId, direction: [f32; 3] },

    /// Zero the entity's speed
    Stop { entity: EntityId },

    /// Fire the entity's weapon at `target`
    Shoot { entity: EntityId, target: EntityId },

    /// Add `delta` hit points (negative for damage), clamped to max health
    AdjustHealth { entity: EntityId, delta: f32 },

    /// End the session (privileged controllers only)
    Quit,
}

impl Command {
    /// Entity the command acts on, if any.
    pub fn subject(&self) -> Option<EntityId> {
        match self {
            Command::Move { entity, .. }
            | Command::Stop { entity }
            | Command::Shoot { entity, .. }
            | Command::AdjustHealth { entity, .. } => Some(*entity),
            Command::Quit => None,
        }
    }

    /// Component kinds the command may write.
    pub fn affected_components(&self) -> &'static [ComponentKind] {
        match self {
            Command::Move { .. } | Command::Stop { .. } => {
                &[ComponentKind::Dynamic, ComponentKind::State]
            }
            Command::Shoot { .. } => &[
                ComponentKind::Character,
                ComponentKind::State,
                ComponentKind::Weapon,
                ComponentKind::Score,
            ],
            Command::AdjustHealth { .. } => &[ComponentKind::Character],
            Command::Quit => &[],
        }
    }

    /// Session control rather than a World mutation.
    pub fn is_control(&self) -> bool {
        matches!(self, Command::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::Move {
            entity: EntityId(3),
            direction: [1.0, 0.0, 0.0],
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command_type"], "move");
        assert_eq!(json["entity"], 3);

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_quit_is_control() {
        assert!(Command::Quit.is_control());
        assert!(Command::Quit.subject().is_none());
        assert!(!Command::Stop { entity: EntityId(1) }.is_control());
    }
}
