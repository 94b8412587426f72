//! Simulated network transport with fault injection.
//!
//! The server talks to in-process [`SimBot`]s. Every frame a bot answers with
//! is queued with a virtual delivery time and registered as a wakeup on the
//! [`SimContext`]. `recv` only yields frames that are due; a racing
//! `sleep_until` moves the clock, stopping at each wakeup on the way, so
//! frames arrive exactly at their delivery time or after the deadline.

use crate::bots::{BotAction, SimBot};
use crate::context::SimContext;
use arena_core::WireMessage;
use arena_env::{EnvError, NetworkController, NetworkTransport, PeerId, SessionContext, TransportEvent, WireEnvelope};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;
use tracing::{debug, trace};

/// Counters reported with each scenario result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub disconnects: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
enum Pending {
    Deliver(PeerId, TransportEvent),

    /// Bot dials in again; settings of its previous connection carry over
    Reconnect { bot: usize, previous: PeerId },
}

struct NetState {
    bots: Vec<SimBot>,

    /// Live connection of each bot
    links: BTreeMap<PeerId, usize>,

    /// Bots cut off by `sever`, keyed by the peer id they had
    cut: BTreeMap<PeerId, usize>,

    queue: BTreeMap<(Duration, u64), Pending>,
    seq: u64,
    next_peer: u64,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

fn frame(msg: &WireMessage, at: Duration) -> WireEnvelope {
    let timestamp_ms = at.as_millis() as u64;
    msg.encode(timestamp_ms)
        .unwrap_or_else(|_| WireEnvelope::new(Vec::new(), timestamp_ms))
}

/// Server-side transport backed by scripted bots.
pub struct SimNetwork {
    ctx: Arc<SimContext>,
    controller: Arc<SimNetworkController>,

    /// Standard deviation of per-frame latency jitter (ms)
    jitter_ms: f64,

    state: Mutex<NetState>,
}

impl SimNetwork {
    pub fn new(ctx: Arc<SimContext>, controller: Arc<SimNetworkController>) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(ctx.fork_seed());
        Self {
            ctx,
            controller,
            jitter_ms: 0.0,
            state: Mutex::new(NetState {
                bots: Vec::new(),
                links: BTreeMap::new(),
                cut: BTreeMap::new(),
                queue: BTreeMap::new(),
                seq: 0,
                next_peer: 0,
                rng,
                stats: NetworkStats::default(),
            }),
        }
    }

    pub fn with_jitter(mut self, jitter_ms: f64) -> Self {
        self.jitter_ms = jitter_ms.max(0.0);
        self
    }

    /// Schedules a bot to connect and say HELLO at `join_at`.
    pub fn add_bot(&self, bot: SimBot, join_at: Duration) -> PeerId {
        let mut state = self.state.lock().unwrap();
        state.bots.push(bot);
        let index = state.bots.len() - 1;
        self.connect(&mut state, index, join_at)
    }

    fn push(&self, state: &mut NetState, at: Duration, event: Pending) {
        state.seq += 1;
        state.queue.insert((at, state.seq), event);
        self.ctx.schedule_wakeup(at);
    }

    fn connect(&self, state: &mut NetState, bot: usize, at: Duration) -> PeerId {
        state.next_peer += 1;
        let peer = PeerId(state.next_peer);
        state.links.insert(peer, bot);
        let hello = frame(&state.bots[bot].hello(), at);
        self.push(state, at, Pending::Deliver(peer, TransportEvent::Connected));
        self.push(state, at, Pending::Deliver(peer, TransportEvent::Message(hello)));
        peer
    }

    /// Current connection of the bot with `username`.
    pub fn peer_of(&self, username: &str) -> Option<PeerId> {
        let state = self.state.lock().unwrap();
        state
            .links
            .iter()
            .find(|(_, bot)| state.bots[**bot].username == username)
            .map(|(peer, _)| *peer)
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    /// One-way delay to `peer`: configured latency plus jitter.
    fn one_way(&self, state: &mut NetState, peer: PeerId) -> Duration {
        let base = self.controller.get_latency(peer) as f64;
        let jitter = match Normal::new(0.0, self.jitter_ms) {
            Ok(dist) if self.jitter_ms > 0.0 => dist.sample(&mut state.rng).abs(),
            _ => 0.0,
        };
        Duration::from_micros(((base + jitter) * 1000.0) as u64)
    }

    /// Hands one frame to the bot behind `peer` and queues its answers.
    fn deliver_to_bot(&self, state: &mut NetState, peer: PeerId, bot: usize, msg: &WireMessage) {
        let now = self.ctx.now();
        let outbound = self.one_way(state, peer);
        let actions = state.bots[bot].on_message(msg);
        for action in actions {
            match action {
                BotAction::Send { msg, delay } => {
                    let inbound = self.one_way(state, peer);
                    let at = now + outbound + delay + inbound;
                    let envelope = frame(&msg, at);
                    self.push(state, at, Pending::Deliver(peer, TransportEvent::Message(envelope)));
                }
                BotAction::Drop { delay, downtime } => {
                    let at = now + outbound + delay;
                    debug!(%peer, ?at, ?downtime, "bot will drop its connection");
                    self.push(state, at, Pending::Deliver(peer, TransportEvent::Disconnected));
                    self.push(state, at + downtime, Pending::Reconnect { bot, previous: peer });
                }
            }
        }
    }

    /// Applies `sever` / `restore` calls made since the last poll.
    fn apply_faults(&self, state: &mut NetState) {
        let now = self.ctx.now();
        let severed: Vec<(PeerId, usize)> = state
            .links
            .iter()
            .filter(|(peer, _)| self.controller.is_severed(**peer))
            .map(|(peer, bot)| (*peer, *bot))
            .collect();
        for (peer, bot) in severed {
            state.links.remove(&peer);
            state.cut.insert(peer, bot);
            state.stats.disconnects += 1;
            self.push(state, now, Pending::Deliver(peer, TransportEvent::Disconnected));
        }

        let restored: Vec<(PeerId, usize)> = state
            .cut
            .iter()
            .filter(|(peer, _)| !self.controller.is_severed(**peer))
            .map(|(peer, bot)| (*peer, *bot))
            .collect();
        for (peer, bot) in restored {
            state.cut.remove(&peer);
            self.push(state, now, Pending::Reconnect { bot, previous: peer });
        }
    }

    /// Pops events that are due until one should reach the server.
    fn pop_due(&self, state: &mut NetState) -> Option<(PeerId, TransportEvent)> {
        let now = self.ctx.now();
        loop {
            let due = matches!(state.queue.first_key_value(), Some(((at, _), _)) if *at <= now);
            if !due {
                return None;
            }
            let ((at, _), event) = state.queue.pop_first()?;
            self.ctx.cancel_wakeup(at);

            match event {
                Pending::Reconnect { bot, previous } => {
                    let peer = self.connect(state, bot, at);
                    self.controller.carry_over(previous, peer);
                    state.stats.reconnects += 1;
                    debug!(%peer, %previous, username = %state.bots[bot].username, "bot reconnecting");
                }
                Pending::Deliver(peer, TransportEvent::Disconnected) => {
                    if state.links.remove(&peer).is_some() {
                        state.stats.disconnects += 1;
                        return Some((peer, TransportEvent::Disconnected));
                    }
                    if state.cut.contains_key(&peer) {
                        return Some((peer, TransportEvent::Disconnected));
                    }
                }
                Pending::Deliver(peer, event) => {
                    if state.links.contains_key(&peer) {
                        state.stats.frames_delivered += 1;
                        return Some((peer, event));
                    }
                    trace!(%peer, "dropping frame from a closed connection");
                    state.stats.frames_dropped += 1;
                }
            }
        }
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, envelope: WireEnvelope) -> Result<(), EnvError> {
        let mut state = self.state.lock().unwrap();
        self.apply_faults(&mut state);
        let bot = *state.links.get(&target).ok_or_else(|| EnvError::unreachable(target))?;

        state.stats.frames_sent += 1;
        let loss = self.controller.get_loss(target);
        if loss > 0.0 && state.rng.gen_bool(loss) {
            trace!(%target, "frame lost");
            state.stats.frames_dropped += 1;
            return Ok(());
        }

        let msg = WireMessage::decode(&envelope)?;
        self.deliver_to_bot(&mut state, target, bot, &msg);
        Ok(())
    }

    async fn recv(&self) -> Option<(PeerId, TransportEvent)> {
        // Never resolves on its own while nothing is due; the racing sleep
        // advances the clock and wakes the task
        std::future::poll_fn(|_cx| {
            let mut state = self.state.lock().unwrap();
            self.apply_faults(&mut state);
            match self.pop_due(&mut state) {
                Some(event) => Poll::Ready(Some(event)),
                None => Poll::Pending,
            }
        })
        .await
    }

    async fn broadcast(&self, envelope: WireEnvelope) -> usize {
        let peers: Vec<PeerId> = self.state.lock().unwrap().links.keys().copied().collect();
        let mut sent = 0;
        for peer in peers {
            if self.send(peer, envelope.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    async fn disconnect(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        if state.links.remove(&peer).is_some() {
            state.stats.disconnects += 1;
        }
    }

    fn local_id(&self) -> PeerId {
        PeerId::SERVER
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Per-peer one-way latency in milliseconds
    peer_latency: Arc<Mutex<HashMap<PeerId, u64>>>,

    /// Per-peer frame loss rate (0.0 - 1.0), server to peer
    peer_loss: Arc<Mutex<HashMap<PeerId, f64>>>,

    /// Peers currently cut off
    severed: Arc<Mutex<HashSet<PeerId>>>,

    /// Latency for peers without an explicit setting
    default_latency_ms: Arc<Mutex<u64>>,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self {
            peer_latency: Arc::new(Mutex::new(HashMap::new())),
            peer_loss: Arc::new(Mutex::new(HashMap::new())),
            severed: Arc::new(Mutex::new(HashSet::new())),
            default_latency_ms: Arc::new(Mutex::new(0)),
        }
    }

    pub fn set_default_latency(&self, latency_ms: u64) {
        *self.default_latency_ms.lock().unwrap() = latency_ms;
    }

    /// Sets packet loss rate for a peer.
    pub fn set_loss(&self, peer: PeerId, loss_rate: f64) {
        let mut losses = self.peer_loss.lock().unwrap();
        losses.insert(peer, loss_rate.clamp(0.0, 1.0));
    }

    /// Gets the latency for a peer (default unless set).
    pub fn get_latency(&self, peer: PeerId) -> u64 {
        let latencies = self.peer_latency.lock().unwrap();
        latencies
            .get(&peer)
            .copied()
            .unwrap_or_else(|| *self.default_latency_ms.lock().unwrap())
    }

    /// Gets the loss rate for a peer (default 0.0).
    pub fn get_loss(&self, peer: PeerId) -> f64 {
        let losses = self.peer_loss.lock().unwrap();
        *losses.get(&peer).unwrap_or(&0.0)
    }

    pub fn is_severed(&self, peer: PeerId) -> bool {
        self.severed.lock().unwrap().contains(&peer)
    }

    /// Peers currently severed, in id order.
    pub fn severed_peers(&self) -> BTreeSet<PeerId> {
        self.severed.lock().unwrap().iter().copied().collect()
    }

    /// Moves per-peer latency and loss settings to a peer's new connection.
    pub fn carry_over(&self, from: PeerId, to: PeerId) {
        if let Some(latency) = self.peer_latency.lock().unwrap().remove(&from) {
            self.peer_latency.lock().unwrap().insert(to, latency);
        }
        if let Some(loss) = self.peer_loss.lock().unwrap().remove(&from) {
            self.peer_loss.lock().unwrap().insert(to, loss);
        }
    }

    /// Restores every severed peer.
    pub fn heal_all(&self) {
        self.severed.lock().unwrap().clear();
    }
}

impl NetworkController for SimNetworkController {
    fn sever(&self, peer: PeerId) {
        self.severed.lock().unwrap().insert(peer);
    }

    fn restore(&self, peer: PeerId) {
        self.severed.lock().unwrap().remove(&peer);
    }

    fn set_peer_latency(&self, peer: PeerId, latency_ms: u64) {
        let mut latencies = self.peer_latency.lock().unwrap();
        latencies.insert(peer, latency_ms);
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotBehavior;
    use arena_core::{AgentId, Role};

    fn setup() -> (Arc<SimContext>, SimNetwork) {
        let ctx = SimContext::shared(5);
        let controller = Arc::new(SimNetworkController::new());
        controller.set_default_latency(10);
        let net = SimNetwork::new(Arc::clone(&ctx), controller);
        (ctx, net)
    }

    /// Next event, as the session pump would see it.
    async fn next(ctx: &SimContext, net: &SimNetwork) -> Option<(PeerId, TransportEvent)> {
        tokio::select! {
            biased;
            event = net.recv() => event,
            _ = ctx.sleep(Duration::from_secs(60)) => None,
        }
    }

    fn decode(event: TransportEvent) -> WireMessage {
        match event {
            TransportEvent::Message(envelope) => WireMessage::decode(&envelope).unwrap(),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_network_controller_latency() {
        let controller = SimNetworkController::new();
        let a = PeerId(1);
        let b = PeerId(2);

        assert_eq!(controller.get_latency(a), 0);
        controller.set_default_latency(20);
        controller.set_peer_latency(a, 100);
        assert_eq!(controller.get_latency(a), 100);
        assert_eq!(controller.get_latency(b), 20);
    }

    #[test]
    fn test_network_controller_sever_restore() {
        let controller = SimNetworkController::new();
        controller.sever(PeerId(1));
        controller.sever(PeerId(2));
        assert!(controller.is_severed(PeerId(1)));

        controller.restore(PeerId(1));
        assert!(!controller.is_severed(PeerId(1)));
        assert_eq!(controller.severed_peers().len(), 1);

        controller.heal_all();
        assert!(controller.severed_peers().is_empty());
    }

    #[tokio::test]
    async fn test_join_moves_clock_to_arrival() {
        let (ctx, net) = setup();
        let peer = net.add_bot(SimBot::new("red", 0, BotBehavior::Idle, 1), Duration::from_millis(40));

        assert_eq!(next(&ctx, &net).await, Some((peer, TransportEvent::Connected)));
        let (from, event) = next(&ctx, &net).await.unwrap();
        assert_eq!(from, peer);
        assert_eq!(
            decode(event),
            WireMessage::Hello { username: "red".into(), team: 0, role: Role::Agent }
        );
        assert_eq!(ctx.now(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_empty_queue_lets_sleep_win() {
        let (ctx, net) = setup();
        let deadline = Duration::from_secs(3);
        let timed_out = tokio::select! {
            biased;
            _ = net.recv() => false,
            _ = ctx.sleep_until(deadline) => true,
        };
        assert!(timed_out);
        assert_eq!(ctx.now(), deadline);
    }

    #[tokio::test]
    async fn test_reply_arrives_after_round_trip() {
        let (ctx, net) = setup();
        let peer = net.add_bot(SimBot::new("red", 0, BotBehavior::Idle, 1), Duration::ZERO);
        next(&ctx, &net).await;
        next(&ctx, &net).await;

        let scene = arena_core::SceneDefinition::arena();
        let mut world = scene.build_world().unwrap();
        let entity = scene.spawn_player(&mut world, "red", 0).unwrap();
        let snapshot = world.snapshot(0);
        let welcome = WireMessage::Welcome { agent_id: AgentId(1), entity: Some(entity), tick: 0, snapshot: snapshot.clone() };
        net.send(peer, welcome.encode(0).unwrap()).await.unwrap();
        let ask = WireMessage::AskCommand { tick: 1, snapshot };
        net.send(peer, ask.encode(0).unwrap()).await.unwrap();

        let (_, event) = next(&ctx, &net).await.unwrap();
        assert!(matches!(decode(event), WireMessage::Command { tick: 1, .. }));
        // 10ms out, 5..15ms thinking, 10ms back
        assert!(ctx.now() >= Duration::from_millis(25));
        assert!(ctx.now() < Duration::from_millis(35));
        assert_eq!(net.stats().frames_sent, 2);
    }

    #[tokio::test]
    async fn test_severed_peer_is_reported_and_unreachable() {
        let (ctx, net) = setup();
        let peer = net.add_bot(SimBot::new("red", 0, BotBehavior::Idle, 1), Duration::ZERO);
        next(&ctx, &net).await;
        next(&ctx, &net).await;

        net.controller().sever(peer);
        assert_eq!(next(&ctx, &net).await, Some((peer, TransportEvent::Disconnected)));
        let frame = WireMessage::GameFinished {
            reason: arena_core::EndReason::Quit,
            final_tick: 0,
            result: Default::default(),
        };
        assert!(net.send(peer, frame.encode(0).unwrap()).await.is_err());

        // Restoring lets the bot dial in again on a fresh connection
        net.controller().restore(peer);
        let (new_peer, event) = next(&ctx, &net).await.unwrap();
        assert_ne!(new_peer, peer);
        assert_eq!(event, TransportEvent::Connected);
        assert_eq!(net.peer_of("red"), Some(new_peer));
        assert_eq!(net.stats().reconnects, 1);
    }
}
