//! Scene definitions: initial entities, the player template and sync policy.
//!
//! A scene is read once when a session is constructed. Replay rebuilds the
//! World from the same scene plus the logged roster, so everything here must
//! be deterministic: entities are spawned in file order, then one player per
//! agent in agent-id order.

use crate::component::{Component, ComponentKind, PropertyValue};
use crate::error::{Result, SessionError};
use crate::sync_policy::{SyncDescriptor, SyncPolicyRegistry};
use crate::types::EntityId;
use crate::world::World;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Distance of each team's spawn point from the origin along x.
const SPAWN_OFFSET: f32 = 200.0;

/// An entity to create at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTemplate {
    pub name: String,

    #[serde(default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDefinition {
    pub name: String,

    #[serde(default)]
    pub entities: Vec<EntityTemplate>,

    /// Components every player entity starts with
    #[serde(default = "default_player")]
    pub player: Vec<Component>,

    /// Sync descriptors by component kind; absent means the arena defaults
    #[serde(default)]
    pub sync: Option<BTreeMap<ComponentKind, SyncDescriptor>>,
}

fn default_player() -> Vec<Component> {
    ComponentKind::all()
        .iter()
        .map(|kind| Component::default_for(*kind))
        .collect()
}

impl SceneDefinition {
    /// The built-in arena: two training dummies between the team spawns.
    pub fn arena() -> Self {
        let dummy = |name: &str, y: f32| {
            let mut transform = Component::default_for(ComponentKind::Transform);
            transform.set_property("pos", &PropertyValue::Vector([0.0, y, 0.0]));
            EntityTemplate {
                name: name.to_string(),
                components: vec![
                    transform,
                    Component::default_for(ComponentKind::Character),
                    Component::default_for(ComponentKind::State),
                ],
            }
        };
        Self {
            name: "arena".to_string(),
            entities: vec![dummy("dummy-north", 150.0), dummy("dummy-south", -150.0)],
            player: default_player(),
            sync: None,
        }
    }

    /// `"arena"` or a path to a JSON scene file.
    pub fn resolve(name_or_path: &str) -> Result<Self> {
        if name_or_path == "arena" {
            return Ok(Self::arena());
        }
        Self::load(name_or_path)
    }

    /// # Errors
    /// `Io` if the file cannot be read, `ConfigurationInvalid` if it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let scene: Self = serde_json::from_str(&text)
            .map_err(|e| SessionError::config(format!("scene {}: {}", path.display(), e)))?;
        info!(scene = %scene.name, entities = scene.entities.len(), "scene loaded");
        Ok(scene)
    }

    pub fn policy(&self) -> Result<SyncPolicyRegistry> {
        match &self.sync {
            Some(descriptors) => SyncPolicyRegistry::from_descriptors(descriptors.clone()),
            None => Ok(SyncPolicyRegistry::arena_default()),
        }
    }

    /// Builds the initial World (without players).
    ///
    /// # Errors
    /// `ConfigurationInvalid` for a bad sync policy or an entity template
    /// listing a component kind twice.
    pub fn build_world(&self) -> Result<World> {
        let mut world = World::new(Arc::new(self.policy()?));
        for template in &self.entities {
            let id = world.spawn(template.name.clone());
            for component in &template.components {
                world.attach(id, component.clone())?;
            }
        }
        Ok(world)
    }

    /// Spawns a player entity for an agent, placed by team.
    pub fn spawn_player(&self, world: &mut World, username: &str, team: u8) -> Result<EntityId> {
        let id = world.spawn(username);
        for template in &self.player {
            let mut component = template.clone();
            match &mut component {
                Component::Transform(transform) => {
                    transform.pos = spawn_point(team);
                    if team == 1 {
                        transform.rot = Vector3::new(0.0, 0.0, std::f32::consts::PI);
                    }
                }
                Component::Score(score) => score.team = team,
                _ => {}
            }
            world.attach(id, component)?;
        }
        Ok(id)
    }
}

fn spawn_point(team: u8) -> Vector3<f32> {
    match team {
        0 => Vector3::new(-SPAWN_OFFSET, 0.0, 0.0),
        1 => Vector3::new(SPAWN_OFFSET, 0.0, 0.0),
        _ => Vector3::zeros(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_arena_players_spawn_by_team() {
        let scene = SceneDefinition::arena();
        let mut world = scene.build_world().unwrap();
        assert_eq!(world.len(), 2);

        let red = scene.spawn_player(&mut world, "red", 0).unwrap();
        let blue = scene.spawn_player(&mut world, "blue", 1).unwrap();
        assert_eq!(red, EntityId(3));
        assert_eq!(blue, EntityId(4));

        let blue = world.entity(blue).unwrap();
        assert_relative_eq!(blue.transform().unwrap().pos.x, 200.0);
        assert_eq!(blue.score().unwrap().team, 1);
        assert!(blue.weapon().is_some());
        assert_relative_eq!(world.entity(red).unwrap().transform().unwrap().pos.x, -200.0);
    }

    #[test]
    fn test_scene_from_json_with_partial_components() {
        let json = r#"{
            "name": "duel",
            "entities": [
                {"name": "wall", "components": [{"kind": "transform", "pos": [1.0, 2.0, 0.0]}]}
            ],
            "sync": {
                "transform": {"client_predicted": true,
                              "synchronized_properties": {"transform": ["pos"]}}
            }
        }"#;
        let scene: SceneDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(scene.player.len(), ComponentKind::all().len());

        let world = scene.build_world().unwrap();
        let wall = world.entity(EntityId(1)).unwrap().transform().unwrap();
        assert_relative_eq!(wall.pos.y, 2.0);
        assert_relative_eq!(wall.scale.x, 1.0);
        assert!(world.policy().is_predicted(ComponentKind::Transform));
        assert!(!world.policy().is_synchronized(ComponentKind::Character, "health"));
    }

    #[test]
    fn test_bad_sync_policy_is_configuration_error() {
        let scene = SceneDefinition {
            sync: Some(BTreeMap::from([(
                ComponentKind::Score,
                SyncDescriptor::for_component(ComponentKind::Score, &["ammo"]),
            )])),
            ..SceneDefinition::arena()
        };
        assert!(matches!(scene.build_world(), Err(SessionError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_unknown_scene_file_is_io_error() {
        assert!(matches!(
            SceneDefinition::resolve("/nonexistent/scene.json"),
            Err(SessionError::Io(_))
        ));
    }
}
