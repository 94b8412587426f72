//! Scripted remote agents for the simulated network.
//!
//! A bot reacts to the frames the server sends it and answers with frames of
//! its own, each with a think delay. The simulated network adds link latency
//! on top and delivers the answers on the virtual clock.

use arena_core::{AgentId, Command, ComponentKind, EntityId, PropertyValue, Role, Snapshot, WireMessage};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Distance at which a chaser stops walking and starts shooting.
const SHOOT_RANGE: f32 = 250.0;

/// Matches the default weapon cooldown; chasers do not waste shots.
const COOLDOWN_TICKS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotBehavior {
    /// Answers every ask with `Stop`
    Idle,

    /// Joins and never answers
    Silent,

    /// Walks to the nearest living enemy and shoots it
    Chaser,

    /// Sends several commands per ask to trip the rate limit
    Spammer,

    /// Chases, but drops its connection once and comes back
    Flaky,

    /// Chases, but thinks longer than its budget allows
    Slow,

    /// Privileged controller that ends the session at a given tick
    Quitter,
}

impl BotBehavior {
    pub fn name(&self) -> &'static str {
        match self {
            BotBehavior::Idle => "idle",
            BotBehavior::Silent => "silent",
            BotBehavior::Chaser => "chaser",
            BotBehavior::Spammer => "spammer",
            BotBehavior::Flaky => "flaky",
            BotBehavior::Slow => "slow",
            BotBehavior::Quitter => "quitter",
        }
    }

    /// Role the bot announces in HELLO.
    pub fn role(&self) -> Role {
        match self {
            BotBehavior::Quitter => Role::Controller,
            _ => Role::Agent,
        }
    }
}

impl fmt::Display for BotBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BotBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(BotBehavior::Idle),
            "silent" => Ok(BotBehavior::Silent),
            "chaser" => Ok(BotBehavior::Chaser),
            "spammer" => Ok(BotBehavior::Spammer),
            "flaky" => Ok(BotBehavior::Flaky),
            "slow" => Ok(BotBehavior::Slow),
            "quitter" => Ok(BotBehavior::Quitter),
            _ => Err(format!("Unknown bot behavior: {}", s)),
        }
    }
}

/// Knobs shared by all behaviors.
#[derive(Debug, Clone)]
pub struct BotTuning {
    /// Base reaction time before answering (default: 5ms)
    pub think_time: Duration,

    /// Extra random reaction time, uniform in `0..think_jitter` (default: 10ms)
    pub think_jitter: Duration,

    /// Reaction time of `Slow` bots (default: 2s)
    pub slow_think_time: Duration,

    /// `Flaky` bots drop after this many asks (default: 5)
    pub drop_after_asks: u64,

    /// How long a `Flaky` bot stays away (default: 500ms)
    pub downtime: Duration,

    /// Commands per ask sent by a `Spammer` (default: 3)
    pub burst: usize,

    /// Tick after which a `Quitter` sends `Quit` (default: 30)
    pub quit_at_tick: u64,
}

impl Default for BotTuning {
    fn default() -> Self {
        Self {
            think_time: Duration::from_millis(5),
            think_jitter: Duration::from_millis(10),
            slow_think_time: Duration::from_secs(2),
            drop_after_asks: 5,
            downtime: Duration::from_millis(500),
            burst: 3,
            quit_at_tick: 30,
        }
    }
}

/// What a bot wants the network to do.
#[derive(Debug, Clone, PartialEq)]
pub enum BotAction {
    /// Deliver `msg` to the server after `delay`
    Send { msg: WireMessage, delay: Duration },

    /// Close the connection after `delay`, reconnect `downtime` later
    Drop { delay: Duration, downtime: Duration },
}

pub struct SimBot {
    pub username: String,
    pub team: u8,
    pub behavior: BotBehavior,
    tuning: BotTuning,
    rng: ChaCha8Rng,

    agent: Option<AgentId>,
    entity: Option<EntityId>,

    asks: u64,
    dropped: bool,
    quit_sent: bool,

    /// Tick the own weapon is expected to be ready again
    weapon_ready_at: u64,
}

impl SimBot {
    pub fn new(username: impl Into<String>, team: u8, behavior: BotBehavior, seed: u64) -> Self {
        Self {
            username: username.into(),
            team,
            behavior,
            tuning: BotTuning::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            agent: None,
            entity: None,
            asks: 0,
            dropped: false,
            quit_sent: false,
            weapon_ready_at: 0,
        }
    }

    pub fn with_tuning(mut self, tuning: BotTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn agent(&self) -> Option<AgentId> {
        self.agent
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    /// First frame on every (re)connection.
    pub fn hello(&self) -> WireMessage {
        WireMessage::Hello {
            username: self.username.clone(),
            team: self.team,
            role: self.behavior.role(),
        }
    }

    /// Reacts to one frame from the server.
    pub fn on_message(&mut self, msg: &WireMessage) -> Vec<BotAction> {
        match msg {
            WireMessage::Welcome { agent_id, entity, .. } => {
                self.agent = Some(*agent_id);
                self.entity = *entity;
                Vec::new()
            }
            WireMessage::AskCommand { tick, snapshot } => {
                self.asks += 1;
                self.on_ask(*tick, snapshot)
            }
            WireMessage::Snapshot { snapshot } => self.on_snapshot(snapshot),
            _ => Vec::new(),
        }
    }

    fn on_ask(&mut self, tick: u64, snapshot: &Snapshot) -> Vec<BotAction> {
        let Some(me) = self.entity else {
            return Vec::new();
        };
        match self.behavior {
            BotBehavior::Silent | BotBehavior::Quitter => Vec::new(),
            BotBehavior::Idle => vec![self.answer(tick, Command::Stop { entity: me })],
            BotBehavior::Chaser => {
                let command = self.chase(tick, me, snapshot);
                vec![self.answer(tick, command)]
            }
            BotBehavior::Spammer => {
                let mut actions = Vec::with_capacity(self.tuning.burst);
                for i in 0..self.tuning.burst {
                    let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
                    let command = Command::Move {
                        entity: me,
                        direction: [angle.cos(), angle.sin(), 0.0],
                    };
                    let mut action = self.answer(tick, command);
                    if let BotAction::Send { delay, .. } = &mut action {
                        *delay += Duration::from_millis(i as u64);
                    }
                    actions.push(action);
                }
                actions
            }
            BotBehavior::Flaky if !self.dropped && self.asks >= self.tuning.drop_after_asks => {
                self.dropped = true;
                vec![BotAction::Drop {
                    delay: self.reaction(),
                    downtime: self.tuning.downtime,
                }]
            }
            BotBehavior::Flaky => {
                let command = self.chase(tick, me, snapshot);
                vec![self.answer(tick, command)]
            }
            BotBehavior::Slow => {
                let command = self.chase(tick, me, snapshot);
                let msg = self.command_frame(tick, command);
                vec![BotAction::Send {
                    msg,
                    delay: self.tuning.slow_think_time,
                }]
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<BotAction> {
        if self.behavior != BotBehavior::Quitter
            || self.quit_sent
            || snapshot.tick < self.tuning.quit_at_tick
        {
            return Vec::new();
        }
        self.quit_sent = true;
        vec![self.answer(snapshot.tick + 1, Command::Quit)]
    }

    fn reaction(&mut self) -> Duration {
        let jitter_ns = self.tuning.think_jitter.as_nanos() as u64;
        let extra = if jitter_ns == 0 {
            0
        } else {
            self.rng.gen_range(0..jitter_ns)
        };
        self.tuning.think_time + Duration::from_nanos(extra)
    }

    fn command_frame(&self, tick: u64, payload: Command) -> WireMessage {
        WireMessage::Command {
            agent_id: self.agent.unwrap_or(AgentId(0)),
            tick,
            payload,
        }
    }

    fn answer(&mut self, tick: u64, command: Command) -> BotAction {
        let delay = self.reaction();
        BotAction::Send {
            msg: self.command_frame(tick, command),
            delay,
        }
    }

    /// Walks toward the nearest living enemy, shooting once in range.
    fn chase(&mut self, tick: u64, me: EntityId, snapshot: &Snapshot) -> Command {
        let Some(my_pos) = position(snapshot, me) else {
            return Command::Stop { entity: me };
        };

        let target = snapshot
            .entities
            .keys()
            .copied()
            .filter(|id| *id != me && is_enemy(snapshot, *id, self.team))
            .filter_map(|id| position(snapshot, id).map(|p| (id, (p - my_pos).norm(), p)))
            .fold(None, |best: Option<(EntityId, f32, Vector3<f32>)>, candidate| match best {
                Some(b) if b.1 <= candidate.1 => Some(b),
                _ => Some(candidate),
            });

        match target {
            None => Command::Stop { entity: me },
            Some((id, distance, _)) if distance <= SHOOT_RANGE && tick >= self.weapon_ready_at => {
                self.weapon_ready_at = tick + COOLDOWN_TICKS;
                Command::Shoot { entity: me, target: id }
            }
            Some((_, distance, _)) if distance <= SHOOT_RANGE => Command::Stop { entity: me },
            Some((_, _, pos)) => {
                let dir = pos - my_pos;
                Command::Move {
                    entity: me,
                    direction: [dir.x, dir.y, dir.z],
                }
            }
        }
    }
}

fn property(snapshot: &Snapshot, id: EntityId, kind: ComponentKind, name: &str) -> Option<PropertyValue> {
    snapshot.entities.get(&id)?.get(&kind)?.get(name).copied()
}

fn position(snapshot: &Snapshot, id: EntityId) -> Option<Vector3<f32>> {
    match property(snapshot, id, ComponentKind::Transform, "pos")? {
        PropertyValue::Vector(v) => Some(Vector3::from(v)),
        _ => None,
    }
}

/// Alive, targetable, and not on our team (teamless entities count as enemies).
fn is_enemy(snapshot: &Snapshot, id: EntityId, my_team: u8) -> bool {
    let alive = matches!(
        property(snapshot, id, ComponentKind::Character, "health"),
        Some(PropertyValue::Float(h)) if h > 0.0
    );
    let other_team = !matches!(
        property(snapshot, id, ComponentKind::Score, "team"),
        Some(PropertyValue::Team(t)) if t == my_team
    );
    alive && other_team
}
