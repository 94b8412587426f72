//! Component types and their named properties.
//!
//! Components are plain data. Every component exposes its fields by name as
//! [`PropertyValue`]s so that the sync policy, snapshots and scene files can
//! address them without knowing the concrete Rust type.
//!
//! | Kind        | Properties                                 |
//! |-------------|--------------------------------------------|
//! | `transform` | `pos`, `rot`, `scale`                      |
//! | `dynamic`   | `speed`, `acceleration`                    |
//! | `character` | `health`, `max_health`, `max_speed`        |
//! | `state`     | `state`                                    |
//! | `score`     | `team`, `score`                            |
//! | `weapon`    | `damage`, `cooldown_ticks`, `ready_at_tick`|

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Component type tag. One instance per kind per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Transform,
    Dynamic,
    Character,
    State,
    Score,
    Weapon,
}

impl ComponentKind {
    /// Returns all component kinds.
    pub fn all() -> &'static [ComponentKind] {
        &[
            ComponentKind::Transform,
            ComponentKind::Dynamic,
            ComponentKind::Character,
            ComponentKind::State,
            ComponentKind::Score,
            ComponentKind::Weapon,
        ]
    }

    /// Type name used in sync descriptors and scene files.
    pub fn name(&self) -> &'static str {
        match self {
            ComponentKind::Transform => "transform",
            ComponentKind::Dynamic => "dynamic",
            ComponentKind::Character => "character",
            ComponentKind::State => "state",
            ComponentKind::Score => "score",
            ComponentKind::Weapon => "weapon",
        }
    }

    /// Property names carried by this kind, in declaration order.
    pub fn property_names(&self) -> &'static [&'static str] {
        match self {
            ComponentKind::Transform => &["pos", "rot", "scale"],
            ComponentKind::Dynamic => &["speed", "acceleration"],
            ComponentKind::Character => &["health", "max_health", "max_speed"],
            ComponentKind::State => &["state"],
            ComponentKind::Score => &["team", "score"],
            ComponentKind::Weapon => &["damage", "cooldown_ticks", "ready_at_tick"],
        }
    }

    /// Returns true if `property` is a field of this kind.
    pub fn has_property(&self, property: &str) -> bool {
        self.property_names().contains(&property)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentKind::all()
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown component type: {}", s))
    }
}

/// Lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorState {
    Idle,
    Moving,
    Shooting,
    Hit,
    Dead,
}

/// A single property value as it appears in snapshots and scene files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Float(f32),
    Count(u64),
    Vector([f32; 3]),
    State(ActorState),
    Team(u8),
}

impl PropertyValue {
    fn vector(v: &Vector3<f32>) -> Self {
        PropertyValue::Vector([v.x, v.y, v.z])
    }
}

/// Position, orientation (Euler angles, radians) and scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub pos: Vector3<f32>,
    pub rot: Vector3<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pos: Vector3::zeros(),
            rot: Vector3::zeros(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

/// Velocity and acceleration in world units per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dynamic {
    pub speed: Vector3<f32>,
    pub acceleration: Vector3<f32>,
}

/// Hit points and movement cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub health: f32,
    pub max_health: f32,
    pub max_speed: f32,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            health: 20.0,
            max_health: 20.0,
            max_speed: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub state: ActorState,
}

impl Default for State {
    fn default() -> Self {
        Self { state: ActorState::Idle }
    }
}

/// Team membership and accumulated points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Score {
    pub team: u8,
    pub score: f32,
}

/// Hitscan weapon with a per-shot cooldown measured in ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weapon {
    pub damage: f32,
    pub cooldown_ticks: u64,
    pub ready_at_tick: u64,
}

impl Default for Weapon {
    fn default() -> Self {
        Self {
            damage: 5.0,
            cooldown_ticks: 30,
            ready_at_tick: 0,
        }
    }
}

/// A component instance, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    Transform(Transform),
    Dynamic(Dynamic),
    Character(Character),
    State(State),
    Score(Score),
    Weapon(Weapon),
}

impl Component {
    /// Creates a default-valued component of the given kind.
    pub fn default_for(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Transform => Component::Transform(Transform::default()),
            ComponentKind::Dynamic => Component::Dynamic(Dynamic::default()),
            ComponentKind::Character => Component::Character(Character::default()),
            ComponentKind::State => Component::State(State::default()),
            ComponentKind::Score => Component::Score(Score::default()),
            ComponentKind::Weapon => Component::Weapon(Weapon::default()),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Transform(_) => ComponentKind::Transform,
            Component::Dynamic(_) => ComponentKind::Dynamic,
            Component::Character(_) => ComponentKind::Character,
            Component::State(_) => ComponentKind::State,
            Component::Score(_) => ComponentKind::Score,
            Component::Weapon(_) => ComponentKind::Weapon,
        }
    }

    /// Reads a property by name.
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        let value = match (self, name) {
            (Component::Transform(t), "pos") => PropertyValue::vector(&t.pos),
            (Component::Transform(t), "rot") => PropertyValue::vector(&t.rot),
            (Component::Transform(t), "scale") => PropertyValue::vector(&t.scale),
            (Component::Dynamic(d), "speed") => PropertyValue::vector(&d.speed),
            (Component::Dynamic(d), "acceleration") => PropertyValue::vector(&d.acceleration),
            (Component::Character(c), "health") => PropertyValue::Float(c.health),
            (Component::Character(c), "max_health") => PropertyValue::Float(c.max_health),
            (Component::Character(c), "max_speed") => PropertyValue::Float(c.max_speed),
            (Component::State(s), "state") => PropertyValue::State(s.state),
            (Component::Score(s), "team") => PropertyValue::Team(s.team),
            (Component::Score(s), "score") => PropertyValue::Float(s.score),
            (Component::Weapon(w), "damage") => PropertyValue::Float(w.damage),
            (Component::Weapon(w), "cooldown_ticks") => PropertyValue::Count(w.cooldown_ticks),
            (Component::Weapon(w), "ready_at_tick") => PropertyValue::Count(w.ready_at_tick),
            _ => return None,
        };
        Some(value)
    }

    /// Writes a property by name.
    ///
    /// Returns false (and leaves the component untouched) when the property
    /// does not exist or the value has the wrong shape.
    pub fn set_property(&mut self, name: &str, value: &PropertyValue) -> bool {
        use PropertyValue as V;
        match (self, name, value) {
            (Component::Transform(t), "pos", V::Vector(v)) => t.pos = Vector3::from(*v),
            (Component::Transform(t), "rot", V::Vector(v)) => t.rot = Vector3::from(*v),
            (Component::Transform(t), "scale", V::Vector(v)) => t.scale = Vector3::from(*v),
            (Component::Dynamic(d), "speed", V::Vector(v)) => d.speed = Vector3::from(*v),
            (Component::Dynamic(d), "acceleration", V::Vector(v)) => {
                d.acceleration = Vector3::from(*v)
            }
            (Component::Character(c), "health", V::Float(x)) => c.health = *x,
            (Component::Character(c), "max_health", V::Float(x)) => c.max_health = *x,
            (Component::Character(c), "max_speed", V::Float(x)) => c.max_speed = *x,
            (Component::State(s), "state", V::State(x)) => s.state = *x,
            (Component::Score(s), "team", V::Team(x)) => s.team = *x,
            (Component::Score(s), "score", V::Float(x)) => s.score = *x,
            (Component::Weapon(w), "damage", V::Float(x)) => w.damage = *x,
            (Component::Weapon(w), "cooldown_ticks", V::Count(x)) => w.cooldown_ticks = *x,
            (Component::Weapon(w), "ready_at_tick", V::Count(x)) => w.ready_at_tick = *x,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_declared_property_is_readable() {
        for kind in ComponentKind::all() {
            let component = Component::default_for(*kind);
            assert_eq!(component.kind(), *kind);
            for name in kind.property_names() {
                assert!(component.property(name).is_some(), "{}.{} unreadable", kind, name);
            }
            assert!(component.property("nonexistent").is_none());
        }
    }

    #[test]
    fn test_set_property_checks_shape() {
        let mut character = Component::default_for(ComponentKind::Character);
        assert!(character.set_property("health", &PropertyValue::Float(7.5)));
        assert_eq!(character.property("health"), Some(PropertyValue::Float(7.5)));

        // Wrong shape leaves the value untouched
        assert!(!character.set_property("health", &PropertyValue::Count(3)));
        assert_eq!(character.property("health"), Some(PropertyValue::Float(7.5)));
    }

    #[test]
    fn test_component_kind_from_str() {
        assert_eq!("Transform".parse::<ComponentKind>().unwrap(), ComponentKind::Transform);
        assert_eq!("weapon".parse::<ComponentKind>().unwrap(), ComponentKind::Weapon);
        assert!("network".parse::<ComponentKind>().is_err());
    }

    #[test]
    fn test_component_serde_is_tagged_by_kind() {
        let json = serde_json::to_value(Component::default_for(ComponentKind::State)).unwrap();
        assert_eq!(json["kind"], "state");
        assert_eq!(json["state"], "IDLE");
    }
}
