//! The authoritative World: entities, their components, and command application.
//!
//! The World is mutated by exactly one owner (the scheduler, or a replay
//! driver standing in for it). Commands are applied atomically: every
//! precondition is checked against the current state before anything is
//! written, so a rejected command leaves no trace.

use crate::action_log::ActionRecord;
use crate::command::Command;
use crate::component::{
    ActorState, Character, Component, ComponentKind, Dynamic, PropertyValue, Score, State,
    Transform, Weapon,
};
use crate::error::{RejectedReason, Result, SessionError};
use crate::hashing::FnvHasher;
use crate::sync_policy::SyncPolicyRegistry;
use crate::types::EntityId;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

/// Synchronized properties of one component, by name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// The networked view of a World at a tick.
///
/// `entities[id][kind]` holds exactly the properties the sync policy lists
/// for `kind`; components with nothing synchronized are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,

    /// World revision at capture time
    pub revision: u64,

    pub entities: BTreeMap<EntityId, BTreeMap<ComponentKind, PropertyMap>>,
}

/// Total score of one team.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamScore {
    pub team: u8,
    pub score: f32,
}

/// Outcome of a match: team totals in team order, and the team that leads
/// outright (none on a tie or without scoring entities).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchResult {
    pub scores: Vec<TeamScore>,
    pub winner: Option<u8>,
}

/// An identifier plus at most one component per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    components: BTreeMap<ComponentKind, Component>,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self) -> Option<&$ty> {
            match self.components.get(&ComponentKind::$variant) {
                Some(Component::$variant(c)) => Some(c),
                _ => None,
            }
        }

        fn $get_mut(&mut self) -> Option<&mut $ty> {
            match self.components.get_mut(&ComponentKind::$variant) {
                Some(Component::$variant(c)) => Some(c),
                _ => None,
            }
        }
    };
}

impl Entity {
    fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            components: BTreeMap::new(),
        }
    }

    pub fn get(&self, kind: ComponentKind) -> Option<&Component> {
        self.components.get(&kind)
    }

    pub fn has(&self, kind: ComponentKind) -> bool {
        self.components.contains_key(&kind)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    typed_access!(transform, transform_mut, Transform, Transform);
    typed_access!(dynamic, dynamic_mut, Dynamic, Dynamic);
    typed_access!(character, character_mut, Character, Character);
    typed_access!(state, state_mut, State, State);
    typed_access!(score, score_mut, Score, Score);
    typed_access!(weapon, weapon_mut, Weapon, Weapon);

    fn actor_state(&self) -> Option<ActorState> {
        self.state().map(|s| s.state)
    }
}

/// Entity map plus the sync policy it was built with.
#[derive(Debug, Clone)]
pub struct World {
    entities: BTreeMap<EntityId, Entity>,
    policy: Arc<SyncPolicyRegistry>,
    revision: u64,
    next_id: u32,
}

impl World {
    /// Creates an empty World bound to `policy` for its whole lifetime.
    pub fn new(policy: Arc<SyncPolicyRegistry>) -> Self {
        Self {
            entities: BTreeMap::new(),
            policy,
            revision: 0,
            next_id: 1,
        }
    }

    pub fn policy(&self) -> &Arc<SyncPolicyRegistry> {
        &self.policy
    }

    /// Number of successful command applications so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Creates an entity with no components. Ids are sequential from 1.
    pub fn spawn(&mut self, name: impl Into<String>) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(id, Entity::new(id, name));
        id
    }

    /// Attaches a component.
    ///
    /// # Errors
    /// `ConfigurationInvalid` if the entity is missing or already holds that kind.
    pub fn attach(&mut self, entity: EntityId, component: Component) -> Result<()> {
        let target = self
            .entities
            .get_mut(&entity)
            .ok_or_else(|| SessionError::config(format!("no entity {}", entity)))?;
        let kind = component.kind();
        if target.components.contains_key(&kind) {
            return Err(SessionError::config(format!(
                "{} already has a {} component",
                entity, kind
            )));
        }
        target.components.insert(kind, component);
        Ok(())
    }

    pub fn get(&self, entity: EntityId, kind: ComponentKind) -> Option<&Component> {
        self.entities.get(&entity).and_then(|e| e.get(kind))
    }

    pub fn entity(&self, entity: EntityId) -> Option<&Entity> {
        self.entities.get(&entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Applies a logged record.
    ///
    /// Records without a command (no-shows) carry nothing to apply and fail
    /// with their recorded reason.
    pub fn apply(&mut self, record: &ActionRecord) -> std::result::Result<(), RejectedReason> {
        match &record.command {
            Some(command) => self.apply_command(record.tick, command),
            None => Err(record
                .outcome
                .rejection()
                .unwrap_or(RejectedReason::InvalidTarget)),
        }
    }

    /// Applies one command at `tick`.
    ///
    /// # Errors
    /// * `InvalidTarget` - an entity or required component is absent
    /// * `IllegalTransition` - a component precondition fails
    pub fn apply_command(
        &mut self,
        tick: u64,
        command: &Command,
    ) -> std::result::Result<(), RejectedReason> {
        match command {
            Command::Move { entity, direction } => self.apply_move(*entity, *direction),
            Command::Stop { entity } => self.apply_stop(*entity),
            Command::Shoot { entity, target } => self.apply_shoot(tick, *entity, *target),
            Command::AdjustHealth { entity, delta } => self.apply_adjust_health(*entity, *delta),
            Command::Quit => Err(RejectedReason::IllegalTransition),
        }?;
        self.revision += 1;
        Ok(())
    }

    fn actor(&self, id: EntityId) -> std::result::Result<&Entity, RejectedReason> {
        self.entities.get(&id).ok_or(RejectedReason::InvalidTarget)
    }

    fn actor_mut(&mut self, id: EntityId) -> std::result::Result<&mut Entity, RejectedReason> {
        self.entities.get_mut(&id).ok_or(RejectedReason::InvalidTarget)
    }

    fn apply_move(
        &mut self,
        id: EntityId,
        direction: [f32; 3],
    ) -> std::result::Result<(), RejectedReason> {
        let entity = self.actor(id)?;
        let (Some(_), Some(character), Some(state)) =
            (entity.dynamic(), entity.character(), entity.actor_state())
        else {
            return Err(RejectedReason::InvalidTarget);
        };
        if state == ActorState::Dead {
            return Err(RejectedReason::IllegalTransition);
        }
        let direction = Vector3::from(direction);
        if direction.iter().any(|c| !c.is_finite()) {
            return Err(RejectedReason::IllegalTransition);
        }

        // Scaled by the largest component first so huge inputs cannot overflow the norm
        let largest = direction.amax();
        let (speed, next_state) = if largest > 0.0 {
            let scaled = direction / largest;
            (scaled / scaled.norm() * character.max_speed, ActorState::Moving)
        } else {
            (Vector3::zeros(), ActorState::Idle)
        };

        let entity = self.actor_mut(id)?;
        if let Some(dynamic) = entity.dynamic_mut() {
            dynamic.speed = speed;
        }
        if let Some(s) = entity.state_mut() {
            s.state = next_state;
        }
        Ok(())
    }

    fn apply_stop(&mut self, id: EntityId) -> std::result::Result<(), RejectedReason> {
        let entity = self.actor(id)?;
        let (Some(_), Some(state)) = (entity.dynamic(), entity.actor_state()) else {
            return Err(RejectedReason::InvalidTarget);
        };
        if state == ActorState::Dead {
            return Err(RejectedReason::IllegalTransition);
        }

        let entity = self.actor_mut(id)?;
        if let Some(dynamic) = entity.dynamic_mut() {
            dynamic.speed = Vector3::zeros();
        }
        if let Some(s) = entity.state_mut() {
            s.state = ActorState::Idle;
        }
        Ok(())
    }

    fn apply_shoot(
        &mut self,
        tick: u64,
        shooter_id: EntityId,
        target_id: EntityId,
    ) -> std::result::Result<(), RejectedReason> {
        let shooter = self.actor(shooter_id)?;
        let target = self.actor(target_id)?;
        let (Some(weapon), Some(shooter_state)) = (shooter.weapon(), shooter.actor_state()) else {
            return Err(RejectedReason::InvalidTarget);
        };
        let (Some(victim), Some(target_state)) = (target.character(), target.actor_state()) else {
            return Err(RejectedReason::InvalidTarget);
        };

        if shooter_id == target_id
            || shooter_state == ActorState::Dead
            || target_state == ActorState::Dead
            || tick < weapon.ready_at_tick
        {
            return Err(RejectedReason::IllegalTransition);
        }

        let health = (victim.health - weapon.damage).max(0.0);
        let dealt = victim.health - health;
        let target_next = if health == 0.0 {
            ActorState::Dead
        } else {
            ActorState::Hit
        };
        let ready_at = tick + weapon.cooldown_ticks;

        let target = self.actor_mut(target_id)?;
        if let Some(c) = target.character_mut() {
            c.health = health;
        }
        if let Some(s) = target.state_mut() {
            s.state = target_next;
        }

        let shooter = self.actor_mut(shooter_id)?;
        if let Some(w) = shooter.weapon_mut() {
            w.ready_at_tick = ready_at;
        }
        if let Some(s) = shooter.state_mut() {
            s.state = ActorState::Shooting;
        }
        if let Some(score) = shooter.score_mut() {
            score.score += dealt;
        }
        Ok(())
    }

    fn apply_adjust_health(
        &mut self,
        id: EntityId,
        delta: f32,
    ) -> std::result::Result<(), RejectedReason> {
        let entity = self.actor(id)?;
        let character = entity.character().ok_or(RejectedReason::InvalidTarget)?;
        let raw = character.health + delta;
        if !raw.is_finite() || raw < 0.0 {
            return Err(RejectedReason::IllegalTransition);
        }
        let health = raw.min(character.max_health);

        let entity = self.actor_mut(id)?;
        if let Some(c) = entity.character_mut() {
            c.health = health;
        }
        if health == 0.0 {
            if let Some(s) = entity.state_mut() {
                s.state = ActorState::Dead;
            }
        }
        Ok(())
    }

    /// Advances kinematics by `dt` seconds.
    ///
    /// Integrates acceleration into speed and speed into position, and lets
    /// the one-tick `Shooting`/`Hit` states settle back to `Moving`/`Idle`.
    pub fn step(&mut self, dt: f32) {
        for entity in self.entities.values_mut() {
            let speed = match entity.dynamic_mut() {
                Some(dynamic) => {
                    let accel = dynamic.acceleration;
                    dynamic.speed += accel * dt;
                    Some(dynamic.speed)
                }
                None => None,
            };

            if let (Some(speed), Some(transform)) = (speed, entity.transform_mut()) {
                transform.pos += speed * dt;
            }

            if let Some(s) = entity.state_mut() {
                if matches!(s.state, ActorState::Shooting | ActorState::Hit) {
                    let moving = speed.map(|v| v.norm() > 0.0).unwrap_or(false);
                    s.state = if moving {
                        ActorState::Moving
                    } else {
                        ActorState::Idle
                    };
                }
            }
        }
    }

    /// Captures the synchronized view of the World.
    pub fn snapshot(&self, tick: u64) -> Snapshot {
        let entities = self
            .entities
            .values()
            .map(|entity| {
                let components = entity
                    .components
                    .values()
                    .filter_map(|component| {
                        let kind = component.kind();
                        let names = self.policy.synchronized_properties(kind);
                        if names.is_empty() {
                            return None;
                        }
                        let props: PropertyMap = names
                            .iter()
                            .filter_map(|name| {
                                component.property(name).map(|value| (name.clone(), value))
                            })
                            .collect();
                        Some((kind, props))
                    })
                    .collect();
                (entity.id, components)
            })
            .collect();

        Snapshot {
            tick,
            revision: self.revision,
            entities,
        }
    }

    /// Checks that a snapshot carries exactly the synchronized property set,
    /// each value of the type its property holds.
    ///
    /// # Errors
    /// `Protocol` on any absent, extra or mistyped property, or a component
    /// kind with nothing synchronized.
    pub fn validate_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        for (entity, components) in &snapshot.entities {
            for (kind, props) in components {
                let expected = self.policy.synchronized_properties(*kind);
                if expected.is_empty() {
                    return Err(SessionError::protocol(format!(
                        "{}: {} is not synchronized",
                        entity, kind
                    )));
                }
                if let Some(extra) = props.keys().find(|name| !expected.contains(*name)) {
                    return Err(SessionError::protocol(format!(
                        "{}: unexpected property {}.{}",
                        entity, kind, extra
                    )));
                }
                if let Some(missing) = expected.iter().find(|name| !props.contains_key(*name)) {
                    return Err(SessionError::protocol(format!(
                        "{}: missing property {}.{}",
                        entity, kind, missing
                    )));
                }

                let mut scratch = self
                    .entities
                    .get(entity)
                    .and_then(|e| e.components.get(kind))
                    .cloned()
                    .unwrap_or_else(|| Component::default_for(*kind));
                if let Some((name, _)) = props
                    .iter()
                    .find(|(name, value)| !scratch.set_property(name, value))
                {
                    return Err(SessionError::protocol(format!(
                        "{}: bad value for {}.{}",
                        entity, kind, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Overwrites synchronized properties from an authoritative snapshot.
    ///
    /// Entities and components the snapshot mentions but this World lacks are
    /// created with default values first. Local-only properties are kept.
    /// A snapshot that fails validation leaves the World untouched.
    pub fn merge_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.validate_snapshot(snapshot)?;

        for (id, components) in &snapshot.entities {
            let entity = self
                .entities
                .entry(*id)
                .or_insert_with(|| Entity::new(*id, format!("remote-{}", id.0)));
            for (kind, props) in components {
                let component = entity
                    .components
                    .entry(*kind)
                    .or_insert_with(|| Component::default_for(*kind));
                for (name, value) in props {
                    if !component.set_property(name, value) {
                        return Err(SessionError::protocol(format!(
                            "{}: bad value for {}.{}",
                            id, kind, name
                        )));
                    }
                }
            }
            self.next_id = self.next_id.max(id.0 + 1);
        }

        self.revision = snapshot.revision;
        Ok(())
    }

    /// Overwrites only the listed component kinds of every entity from `other`.
    pub(crate) fn copy_components_from(&mut self, other: &World, kinds: &[ComponentKind]) {
        for (id, source) in &other.entities {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            for kind in kinds {
                if let Some(component) = source.components.get(kind) {
                    entity.components.insert(*kind, component.clone());
                }
            }
        }
    }

    /// Summed `score` per team over every entity with a Score component.
    pub fn match_result(&self) -> MatchResult {
        let mut totals: BTreeMap<u8, f32> = BTreeMap::new();
        for score in self.entities.values().filter_map(Entity::score) {
            *totals.entry(score.team).or_default() += score.score;
        }

        let best = totals.values().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut leaders = totals.iter().filter(|(_, score)| **score == best);
        let winner = match (leaders.next(), leaders.next()) {
            (Some((team, _)), None) => Some(*team),
            _ => None,
        };

        MatchResult {
            scores: totals
                .into_iter()
                .map(|(team, score)| TeamScore { team, score })
                .collect(),
            winner,
        }
    }

    /// Deterministic digest of the complete World state (all properties,
    /// synchronized or not).
    pub fn state_hash(&self) -> u64 {
        let mut hasher = FnvHasher::new();
        hasher.write_u64(self.revision);
        for entity in self.entities.values() {
            hasher.write_u32(entity.id.0);
            hasher.write(entity.name.as_bytes());
            for component in entity.components.values() {
                let kind = component.kind();
                hasher.write(kind.name().as_bytes());
                for name in kind.property_names() {
                    if let Some(value) = component.property(name) {
                        hash_value(&mut hasher, &value);
                    }
                }
            }
        }
        hasher.finish()
    }
}

fn hash_value(hasher: &mut FnvHasher, value: &PropertyValue) {
    match value {
        PropertyValue::Float(x) => {
            hasher.write_u8(0);
            hasher.write_f32(*x);
        }
        PropertyValue::Count(n) => {
            hasher.write_u8(1);
            hasher.write_u64(*n);
        }
        PropertyValue::Vector(v) => {
            hasher.write_u8(2);
            v.iter().for_each(|c| hasher.write_f32(*c));
        }
        PropertyValue::State(s) => {
            hasher.write_u8(3);
            hasher.write_u8(*s as u8);
        }
        PropertyValue::Team(t) => {
            hasher.write_u8(4);
            hasher.write_u8(*t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::ActionRecord;
    use crate::types::AgentId;
    use approx::assert_relative_eq;

    fn policy() -> Arc<SyncPolicyRegistry> {
        Arc::new(SyncPolicyRegistry::arena_default())
    }

    fn spawn_actor(world: &mut World, name: &str) -> EntityId {
        let id = world.spawn(name);
        for kind in [
            ComponentKind::Transform,
            ComponentKind::Dynamic,
            ComponentKind::Character,
            ComponentKind::State,
            ComponentKind::Score,
            ComponentKind::Weapon,
        ] {
            world.attach(id, Component::default_for(kind)).unwrap();
        }
        id
    }

    #[test]
    fn test_one_component_per_kind() {
        let mut world = World::new(policy());
        let id = world.spawn("a");
        world.attach(id, Component::default_for(ComponentKind::State)).unwrap();
        let dup = world.attach(id, Component::default_for(ComponentKind::State));
        assert!(matches!(dup, Err(SessionError::ConfigurationInvalid(_))));
        assert!(world.attach(EntityId(99), Component::default_for(ComponentKind::State)).is_err());
    }

    #[test]
    fn test_move_sets_speed_and_state() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");

        let cmd = Command::Move { entity: id, direction: [3.0, 4.0, 0.0] };
        world.apply_command(1, &cmd).unwrap();

        let entity = world.entity(id).unwrap();
        let speed = entity.dynamic().unwrap().speed;
        assert_relative_eq!(speed.x, 60.0, epsilon = 1e-4);
        assert_relative_eq!(speed.y, 80.0, epsilon = 1e-4);
        assert_eq!(entity.state().unwrap().state, ActorState::Moving);
        assert_eq!(world.revision(), 1);
    }

    #[test]
    fn test_huge_direction_still_moves_at_max_speed() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");

        let cmd = Command::Move { entity: id, direction: [f32::MAX, f32::MAX, 0.0] };
        world.apply_command(1, &cmd).unwrap();

        let entity = world.entity(id).unwrap();
        let speed = entity.dynamic().unwrap().speed;
        assert!(speed.iter().all(|c| c.is_finite()));
        assert_relative_eq!(speed.norm(), 100.0, epsilon = 1e-3);
        assert_relative_eq!(speed.x, speed.y);
        assert_eq!(entity.state().unwrap().state, ActorState::Moving);
    }

    #[test]
    fn test_missing_target_is_invalid_and_leaves_world_untouched() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");
        let before = world.state_hash();

        let ghost = Command::Stop { entity: EntityId(42) };
        assert_eq!(world.apply_command(1, &ghost), Err(RejectedReason::InvalidTarget));

        let bare = world.spawn("prop");
        let no_dynamic = Command::Move { entity: bare, direction: [1.0, 0.0, 0.0] };
        assert_eq!(world.apply_command(1, &no_dynamic), Err(RejectedReason::InvalidTarget));

        let shoot_prop = Command::Shoot { entity: id, target: bare };
        assert_eq!(world.apply_command(1, &shoot_prop), Err(RejectedReason::InvalidTarget));

        assert_eq!(world.revision(), 0);
        // Only the spawn of `bare` changed the hash input
        let mut expected = World::new(policy());
        spawn_actor(&mut expected, "a");
        expected.spawn("prop");
        assert_ne!(before, world.state_hash());
        assert_eq!(expected.state_hash(), world.state_hash());
    }

    #[test]
    fn test_negative_health_is_illegal() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");

        let lethal = Command::AdjustHealth { entity: id, delta: -25.0 };
        assert_eq!(world.apply_command(1, &lethal), Err(RejectedReason::IllegalTransition));
        assert_eq!(
            world.entity(id).unwrap().character().unwrap().health,
            20.0
        );

        let heal = Command::AdjustHealth { entity: id, delta: 50.0 };
        world.apply_command(1, &heal).unwrap();
        assert_eq!(world.entity(id).unwrap().character().unwrap().health, 20.0);

        let nan = Command::AdjustHealth { entity: id, delta: f32::NAN };
        assert_eq!(world.apply_command(1, &nan), Err(RejectedReason::IllegalTransition));
    }

    #[test]
    fn test_shoot_damages_scores_and_respects_cooldown() {
        let mut world = World::new(policy());
        let a = spawn_actor(&mut world, "a");
        let b = spawn_actor(&mut world, "b");

        world.apply_command(1, &Command::Shoot { entity: a, target: b }).unwrap();
        let victim = world.entity(b).unwrap();
        assert_eq!(victim.character().unwrap().health, 15.0);
        assert_eq!(victim.state().unwrap().state, ActorState::Hit);
        let shooter = world.entity(a).unwrap();
        assert_eq!(shooter.score().unwrap().score, 5.0);
        assert_eq!(shooter.weapon().unwrap().ready_at_tick, 31);

        // Weapon still cooling down
        let again = Command::Shoot { entity: a, target: b };
        assert_eq!(world.apply_command(10, &again), Err(RejectedReason::IllegalTransition));
        world.apply_command(31, &again).unwrap();

        // Self-targeting
        let selfie = Command::Shoot { entity: b, target: b };
        assert_eq!(world.apply_command(40, &selfie), Err(RejectedReason::IllegalTransition));
    }

    #[test]
    fn test_match_result_sums_scores_per_team() {
        let mut world = World::new(policy());
        assert_eq!(world.match_result(), MatchResult::default());

        let a = spawn_actor(&mut world, "a");
        let b = spawn_actor(&mut world, "b");
        world.entities.get_mut(&b).unwrap().score_mut().unwrap().team = 1;
        let tied = world.match_result();
        assert_eq!(tied.scores.len(), 2);
        assert_eq!(tied.winner, None);

        world.apply_command(1, &Command::Shoot { entity: a, target: b }).unwrap();
        let result = world.match_result();
        assert_eq!(
            result.scores,
            vec![TeamScore { team: 0, score: 5.0 }, TeamScore { team: 1, score: 0.0 }]
        );
        assert_eq!(result.winner, Some(0));

        // Props without a Score component do not count
        world.spawn("crate");
        assert_eq!(world.match_result(), result);
    }

    #[test]
    fn test_dead_actors_cannot_act() {
        let mut world = World::new(policy());
        let a = spawn_actor(&mut world, "a");
        let b = spawn_actor(&mut world, "b");

        world.apply_command(1, &Command::AdjustHealth { entity: b, delta: -20.0 }).unwrap();
        assert_eq!(world.entity(b).unwrap().state().unwrap().state, ActorState::Dead);

        let walk = Command::Move { entity: b, direction: [1.0, 0.0, 0.0] };
        assert_eq!(world.apply_command(2, &walk), Err(RejectedReason::IllegalTransition));
        let shoot_corpse = Command::Shoot { entity: a, target: b };
        assert_eq!(world.apply_command(2, &shoot_corpse), Err(RejectedReason::IllegalTransition));
    }

    #[test]
    fn test_quit_never_applies_to_world() {
        let mut world = World::new(policy());
        assert_eq!(world.apply_command(1, &Command::Quit), Err(RejectedReason::IllegalTransition));
    }

    #[test]
    fn test_apply_record_without_command_uses_recorded_reason() {
        let mut world = World::new(policy());
        let record = ActionRecord::rejected(1, AgentId(1), None, 0, RejectedReason::Timeout);
        assert_eq!(world.apply(&record), Err(RejectedReason::Timeout));
    }

    #[test]
    fn test_step_integrates_speed() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");
        world
            .apply_command(1, &Command::Move { entity: id, direction: [0.0, 1.0, 0.0] })
            .unwrap();

        for _ in 0..60 {
            world.step(1.0 / 60.0);
        }
        let pos = world.entity(id).unwrap().transform().unwrap().pos;
        assert_relative_eq!(pos.y, 100.0, epsilon = 1e-2);
        assert_relative_eq!(pos.x, 0.0);
    }

    #[test]
    fn test_transient_states_settle_after_step() {
        let mut world = World::new(policy());
        let a = spawn_actor(&mut world, "a");
        let b = spawn_actor(&mut world, "b");
        world.apply_command(1, &Command::Shoot { entity: a, target: b }).unwrap();
        world.step(1.0 / 60.0);
        assert_eq!(world.entity(a).unwrap().state().unwrap().state, ActorState::Idle);
        assert_eq!(world.entity(b).unwrap().state().unwrap().state, ActorState::Idle);
    }

    #[test]
    fn test_snapshot_contains_exactly_synchronized_properties() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");
        let snapshot = world.snapshot(3);

        assert_eq!(snapshot.tick, 3);
        let components = &snapshot.entities[&id];
        // Weapon is local-only
        assert!(!components.contains_key(&ComponentKind::Weapon));
        let character = &components[&ComponentKind::Character];
        assert_eq!(character.len(), 2);
        assert!(character.contains_key("health"));
        assert!(!character.contains_key("max_speed"));
        assert!(world.validate_snapshot(&snapshot).is_ok());
    }

    #[test]
    fn test_snapshot_with_absent_or_extra_fields_is_rejected() {
        let mut world = World::new(policy());
        let id = spawn_actor(&mut world, "a");

        let mut missing = world.snapshot(1);
        missing
            .entities
            .get_mut(&id)
            .unwrap()
            .get_mut(&ComponentKind::Character)
            .unwrap()
            .remove("health");
        assert!(matches!(world.validate_snapshot(&missing), Err(SessionError::Protocol(_))));

        let mut extra = world.snapshot(1);
        extra
            .entities
            .get_mut(&id)
            .unwrap()
            .get_mut(&ComponentKind::Character)
            .unwrap()
            .insert("max_speed".to_string(), PropertyValue::Float(1.0));
        assert!(world.validate_snapshot(&extra).is_err());

        let mut leaked = world.snapshot(1);
        leaked.entities.get_mut(&id).unwrap().insert(
            ComponentKind::Weapon,
            PropertyMap::from([("damage".to_string(), PropertyValue::Float(1.0))]),
        );
        assert!(world.validate_snapshot(&leaked).is_err());
    }

    #[test]
    fn test_merge_snapshot_builds_remote_entities() {
        let mut server = World::new(policy());
        let id = spawn_actor(&mut server, "a");
        server
            .apply_command(1, &Command::AdjustHealth { entity: id, delta: -3.0 })
            .unwrap();

        let mut client = World::new(policy());
        client.merge_snapshot(&server.snapshot(1)).unwrap();

        let health = client.get(id, ComponentKind::Character).unwrap().property("health");
        assert_eq!(health, Some(PropertyValue::Float(17.0)));
        assert_eq!(client.revision(), 1);
        // Weapon never crossed the wire
        assert!(client.get(id, ComponentKind::Weapon).is_none());
    }

    #[test]
    fn test_mistyped_value_on_last_entity_leaves_world_untouched() {
        let mut server = World::new(policy());
        let a = spawn_actor(&mut server, "a");
        let b = spawn_actor(&mut server, "b");

        let mut client = World::new(policy());
        client.merge_snapshot(&server.snapshot(1)).unwrap();
        let before = client.state_hash();

        let mut bad = server.snapshot(2);
        bad.revision = 9;
        let health = |snapshot: &mut Snapshot, id: EntityId, value: PropertyValue| {
            snapshot
                .entities
                .get_mut(&id)
                .unwrap()
                .get_mut(&ComponentKind::Character)
                .unwrap()
                .insert("health".to_string(), value);
        };
        health(&mut bad, a, PropertyValue::Float(11.0));
        health(&mut bad, b, PropertyValue::Vector([1.0, 2.0, 3.0]));

        assert!(matches!(client.validate_snapshot(&bad), Err(SessionError::Protocol(_))));
        assert!(matches!(client.merge_snapshot(&bad), Err(SessionError::Protocol(_))));
        assert_eq!(client.state_hash(), before);
        assert_eq!(client.revision(), 0);
        let kept = client.get(a, ComponentKind::Character).unwrap().property("health");
        assert_eq!(kept, Some(PropertyValue::Float(20.0)));

        // A brand-new entity is checked against default components
        let mut fresh = World::new(policy());
        assert!(fresh.merge_snapshot(&bad).is_err());
        assert!(fresh.entity(a).is_none());
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut world = World::new(policy());
        spawn_actor(&mut world, "a");
        let snapshot = world.snapshot(2);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
