//! Identifier newtypes.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-level identity of an agent.
///
/// Assigned by the server in handshake order starting at 1, stable across
/// reconnections of the same username. Action records sort by this id within
/// a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Opaque entity handle inside a [`World`](crate::world::World).
///
/// Serialized as a bare number. Snapshots use it as a JSON object key, which
/// arrives as a string, so deserialization accepts both forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntityIdVisitor;

        impl<'de> Visitor<'de> for EntityIdVisitor {
            type Value = EntityId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an entity id as a number or numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<EntityId, E> {
                u32::try_from(v)
                    .map(EntityId)
                    .map_err(|_| E::custom(format!("entity id {} out of range", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<EntityId, E> {
                u32::try_from(v)
                    .map(EntityId)
                    .map_err(|_| E::custom(format!("entity id {} out of range", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EntityId, E> {
                v.parse::<u32>()
                    .map(EntityId)
                    .map_err(|_| E::custom(format!("bad entity id '{}'", v)))
            }
        }

        deserializer.deserialize_any(EntityIdVisitor)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Polled for commands every poll interval, controls one player entity
    #[default]
    Agent,

    /// Receives snapshots only
    Observer,

    /// Privileged: never polled, may submit at any tick, may `Quit`
    Controller,
}

impl Role {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Controller)
    }

    /// Whether the scheduler opens think windows for this role.
    pub fn is_polled(&self) -> bool {
        matches!(self, Role::Agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_entity_id_accepts_number_and_string() {
        let a: EntityId = serde_json::from_str("7").unwrap();
        let b: EntityId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(a, EntityId(7));
        assert_eq!(b, EntityId(7));
        assert!(serde_json::from_str::<EntityId>("-1").is_err());
    }

    #[test]
    fn test_entity_id_as_map_key_survives_buffered_decoding() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        #[serde(tag = "header")]
        enum Wrapped {
            Positions { by_entity: BTreeMap<EntityId, u8> },
        }

        let value = Wrapped::Positions {
            by_entity: BTreeMap::from([(EntityId(3), 1)]),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<Wrapped>(&json).unwrap(), value);
    }

    #[test]
    fn test_role_privileges() {
        assert!(Role::Controller.is_privileged());
        assert!(!Role::Controller.is_polled());
        assert!(Role::Agent.is_polled());
        assert!(!Role::Observer.is_polled());
    }
}
