//! Network Session (server role) - agents in, commands buffered, snapshots out.
//!
//! The session sits between a [`NetworkTransport`] and the scheduler. It never
//! touches the World: it turns transport events into [`Submission`]s and
//! status changes, and turns snapshots into frames.
//!
//! ```text
//!   transport ──(peer, event)──► NetworkSession ──Submission──► Scheduler
//!                                 │    ▲
//!                 HELLO → accept  │    │ broadcast_snapshot / ask / finish
//!                 COMMAND → buffer│    │
//!                 close → Disconnected
//! ```
//!
//! Waiting is always bounded by a deadline on the injected clock. While one
//! agent is being waited on, frames from every other agent keep being read
//! and buffered.

use crate::action_log::{AgentInfo, EndReason};
use crate::command::Command;
use crate::error::{RejectedReason, Result, SessionError};
use crate::protocol::WireMessage;
use crate::scheduler::{AgentStatus, Submission, TickWindow};
use crate::types::{AgentId, EntityId, Role};
use crate::world::{MatchResult, Snapshot};
use arena_env::{EnvError, NetworkTransport, PeerId, SessionContext, TransportEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct AgentLink {
    info: AgentInfo,
    peer: Option<PeerId>,
}

/// Server side of the agent protocol.
pub struct NetworkSession<Ctx, Net>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
{
    ctx: Arc<Ctx>,
    net: Arc<Net>,

    /// Live connections that completed the handshake
    peers: BTreeMap<PeerId, AgentId>,

    agents: BTreeMap<AgentId, AgentLink>,
    usernames: BTreeMap<String, AgentId>,

    /// Commands received but not yet taken by the scheduler
    pending: Vec<Submission>,

    /// New agents not yet taken by the driver
    joined: Vec<AgentId>,

    status_changes: Vec<(AgentId, AgentStatus)>,

    last_snapshot: Option<Snapshot>,

    /// New `Agent`-role joins are refused once the session has started
    roster_locked: bool,

    next_agent: u32,
    arrival: u64,
    quit_requested: bool,
}

impl<Ctx, Net> NetworkSession<Ctx, Net>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
{
    pub fn new(ctx: Arc<Ctx>, net: Arc<Net>) -> Self {
        Self {
            ctx,
            net,
            peers: BTreeMap::new(),
            agents: BTreeMap::new(),
            usernames: BTreeMap::new(),
            pending: Vec::new(),
            joined: Vec::new(),
            status_changes: Vec::new(),
            last_snapshot: None,
            roster_locked: false,
            next_agent: 1,
            arrival: 0,
            quit_requested: false,
        }
    }

    /// Handshake: binds `peer` to a new or returning agent.
    ///
    /// A known username whose previous connection is gone reattaches to its
    /// old agent id and entity.
    ///
    /// # Errors
    /// `Protocol` for an empty or already-connected username, or a new agent
    /// after the roster was locked.
    pub async fn accept(&mut self, peer: PeerId, username: &str, team: u8, role: Role) -> Result<AgentId> {
        if username.trim().is_empty() {
            return Err(SessionError::protocol("empty username"));
        }

        if let Some(agent) = self.usernames.get(username).copied() {
            let link = self
                .agents
                .get_mut(&agent)
                .ok_or_else(|| SessionError::protocol(format!("dangling username {}", username)))?;
            if link.peer.is_some() {
                return Err(SessionError::protocol(format!(
                    "username '{}' is already connected",
                    username
                )));
            }
            link.peer = Some(peer);
            let entity = link.info.entity;
            self.peers.insert(peer, agent);
            self.status_changes.push((agent, AgentStatus::Connected));
            info!(%agent, %peer, username, "agent reconnected");

            if let Some(snapshot) = self.last_snapshot.clone() {
                let tick = snapshot.tick;
                self.send(agent, &WireMessage::Welcome { agent_id: agent, entity, tick, snapshot })
                    .await;
            }
            return Ok(agent);
        }

        if self.roster_locked && role == Role::Agent {
            return Err(SessionError::protocol("session already started"));
        }

        let agent = AgentId(self.next_agent);
        self.next_agent += 1;
        let info = AgentInfo {
            agent_id: agent,
            username: username.to_string(),
            team,
            role,
            entity: None,
        };
        self.agents.insert(agent, AgentLink { info, peer: Some(peer) });
        self.usernames.insert(username.to_string(), agent);
        self.peers.insert(peer, agent);
        self.joined.push(agent);
        info!(%agent, %peer, username, team, ?role, "agent joined");
        Ok(agent)
    }

    /// Refuses new `Agent`-role joins from now on.
    pub fn lock_roster(&mut self) {
        self.roster_locked = true;
    }

    pub fn agent(&self, agent: AgentId) -> Option<&AgentInfo> {
        self.agents.get(&agent).map(|l| &l.info)
    }

    /// Handshaked agents, connected or not.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Agents of role `Agent` currently connected.
    pub fn connected_players(&self) -> usize {
        self.agents
            .values()
            .filter(|l| l.peer.is_some() && l.info.role == Role::Agent)
            .count()
    }

    pub fn is_connected(&self, agent: AgentId) -> bool {
        self.agents.get(&agent).map(|l| l.peer.is_some()).unwrap_or(false)
    }

    /// Records the player entity spawned for an agent.
    pub fn set_entity(&mut self, agent: AgentId, entity: EntityId) {
        if let Some(link) = self.agents.get_mut(&agent) {
            link.info.entity = Some(entity);
        }
    }

    /// Agents that joined since the last call.
    pub fn take_joined(&mut self) -> Vec<AgentInfo> {
        std::mem::take(&mut self.joined)
            .into_iter()
            .filter_map(|id| self.agents.get(&id).map(|l| l.info.clone()))
            .collect()
    }

    /// Connection changes since the last call.
    pub fn take_status_changes(&mut self) -> Vec<(AgentId, AgentStatus)> {
        std::mem::take(&mut self.status_changes)
    }

    /// Buffered submissions, in arrival order.
    pub fn take_submissions(&mut self) -> Vec<Submission> {
        std::mem::take(&mut self.pending)
    }

    /// True once a controller asked to quit.
    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Sends WELCOME to a freshly accepted agent.
    pub async fn welcome(&mut self, agent: AgentId, snapshot: &Snapshot) {
        let entity = self.agents.get(&agent).and_then(|l| l.info.entity);
        let msg = WireMessage::Welcome {
            agent_id: agent,
            entity,
            tick: snapshot.tick,
            snapshot: snapshot.clone(),
        };
        self.send(agent, &msg).await;
    }

    /// Waits until `count` players have connected or `timeout` passes.
    ///
    /// Returns the number of connected players.
    pub async fn wait_for_agents(&mut self, count: usize, timeout: Duration) -> Result<usize> {
        let deadline = self.ctx.now() + timeout;
        self.pump_until(deadline, |s| s.connected_players() >= count)
            .await?;
        Ok(self.connected_players())
    }

    /// Sends ASK_COMMAND to every connected polled agent and waits until each
    /// has answered, dropped, or run out of think time.
    pub async fn request_commands(&mut self, window: &TickWindow, snapshot: &Snapshot) -> Result<()> {
        let ask = WireMessage::AskCommand {
            tick: window.tick,
            snapshot: snapshot.clone(),
        };
        for agent in window.deadlines.keys() {
            self.send(*agent, &ask).await;
        }

        let tick = window.tick;
        let waiting: BTreeSet<AgentId> = window.deadlines.keys().copied().collect();
        self.pump_until(window.closes_at(), |s| {
            let now = s.ctx.now();
            waiting.iter().all(|agent| {
                !s.is_connected(*agent)
                    || window.deadlines.get(agent).map(|d| now >= *d).unwrap_or(true)
                    || s.pending.iter().any(|p| p.agent_id == *agent && p.tick == tick)
            })
        })
        .await
    }

    /// Waits for one command from `agent`.
    ///
    /// # Returns
    /// * `Ok(Ok(command))` - the agent's oldest buffered command
    /// * `Ok(Err(Timeout))` - nothing arrived before `deadline`
    /// * `Ok(Err(AgentDisconnected))` - the agent is not connected
    pub async fn receive_command(
        &mut self,
        agent: AgentId,
        deadline: Duration,
    ) -> Result<std::result::Result<Command, RejectedReason>> {
        self.pump_until(deadline, |s| {
            !s.is_connected(agent) || s.pending.iter().any(|p| p.agent_id == agent)
        })
        .await?;

        match self.pending.iter().position(|p| p.agent_id == agent) {
            Some(index) => Ok(Ok(self.pending.remove(index).command)),
            None if !self.is_connected(agent) => Ok(Err(RejectedReason::AgentDisconnected)),
            None => Ok(Err(RejectedReason::Timeout)),
        }
    }

    /// Keeps reading frames until `until`, buffering whatever arrives.
    pub async fn service(&mut self, until: Duration) -> Result<()> {
        self.pump_until(until, |_| false).await
    }

    /// Buffers an in-process command as if `agent` had sent it now.
    ///
    /// # Errors
    /// `Protocol` if the agent never completed the handshake.
    pub fn submit(&mut self, agent: AgentId, tick: u64, command: Command) -> Result<()> {
        let role = self
            .agents
            .get(&agent)
            .map(|l| l.info.role)
            .ok_or_else(|| SessionError::protocol(format!("unknown {}", agent)))?;
        if payload_quits(&command, role) {
            self.quit_requested = true;
        }
        self.push_submission(agent, tick, command);
        Ok(())
    }

    /// Sends the synchronized view to every connected peer.
    pub async fn broadcast_snapshot(&mut self, snapshot: &Snapshot) -> usize {
        self.last_snapshot = Some(snapshot.clone());
        let msg = WireMessage::Snapshot {
            snapshot: snapshot.clone(),
        };
        let mut delivered = 0;
        for agent in self.peers.values().copied().collect::<Vec<_>>() {
            if self.send(agent, &msg).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Tells every peer the session is over and closes the connections.
    pub async fn finish(&mut self, reason: EndReason, final_tick: u64, result: MatchResult) {
        let msg = WireMessage::GameFinished {
            reason,
            final_tick,
            result,
        };
        for (peer, agent) in std::mem::take(&mut self.peers) {
            self.send_to_peer(peer, &msg).await;
            self.net.disconnect(peer).await;
            if let Some(link) = self.agents.get_mut(&agent) {
                link.peer = None;
            }
        }
        info!(%reason, final_tick, "session finished, peers notified");
    }

    /// Reads transport events until `done` holds, quit is requested or the
    /// clock reaches `deadline`.
    async fn pump_until<F>(&mut self, deadline: Duration, done: F) -> Result<()>
    where
        F: Fn(&Self) -> bool,
    {
        loop {
            if self.quit_requested || done(self) || self.ctx.now() >= deadline {
                return Ok(());
            }

            let net = Arc::clone(&self.net);
            let ctx = Arc::clone(&self.ctx);
            tokio::select! {
                biased;
                event = net.recv() => match event {
                    Some((peer, event)) => self.handle_event(peer, event).await,
                    None => return Err(EnvError::network("transport closed").into()),
                },
                _ = ctx.sleep_until(deadline) => return Ok(()),
            }
        }
    }

    async fn handle_event(&mut self, peer: PeerId, event: TransportEvent) {
        match event {
            TransportEvent::Connected => debug!(%peer, "connection opened, waiting for HELLO"),
            TransportEvent::Disconnected => {
                if let Some(agent) = self.peers.remove(&peer) {
                    if let Some(link) = self.agents.get_mut(&agent) {
                        link.peer = None;
                    }
                    self.status_changes.push((agent, AgentStatus::Disconnected));
                    warn!(%agent, %peer, "agent disconnected");
                }
            }
            TransportEvent::Message(envelope) => match WireMessage::decode(&envelope) {
                Ok(msg) => self.handle_message(peer, msg).await,
                Err(err) => warn!(%peer, "dropping malformed frame: {}", err),
            },
        }
    }

    async fn handle_message(&mut self, peer: PeerId, msg: WireMessage) {
        match msg {
            WireMessage::Hello { username, team, role } => {
                if let Some(agent) = self.peers.get(&peer) {
                    warn!(%peer, %agent, "duplicate HELLO ignored");
                    return;
                }
                if let Err(err) = self.accept(peer, &username, team, role).await {
                    warn!(%peer, username, "handshake refused: {}", err);
                    let abort = WireMessage::Abort {
                        error: err.to_string(),
                        blame: None,
                    };
                    self.send_to_peer(peer, &abort).await;
                    self.net.disconnect(peer).await;
                }
            }
            WireMessage::Command { agent_id, tick, payload } => {
                let Some(agent) = self.peers.get(&peer).copied() else {
                    warn!(%peer, "COMMAND before HELLO dropped");
                    return;
                };
                if agent_id != agent {
                    warn!(%peer, %agent, claimed = %agent_id, "COMMAND for another agent dropped");
                    return;
                }
                let role = self.agents.get(&agent).map(|l| l.info.role).unwrap_or_default();
                if role == Role::Observer {
                    warn!(%agent, "observers may not submit commands");
                    return;
                }
                if payload_quits(&payload, role) {
                    info!(%agent, "quit requested by controller");
                    self.quit_requested = true;
                }
                self.push_submission(agent, tick, payload);
            }
            other => warn!(%peer, header = other.header(), "unexpected frame from peer"),
        }
    }

    fn push_submission(&mut self, agent: AgentId, tick: u64, command: Command) {
        self.pending.push(Submission {
            agent_id: agent,
            tick,
            command,
            issued_at: self.ctx.now(),
            issued_at_ms: self.ctx.wall_clock_ms(),
            arrival: self.arrival,
        });
        self.arrival += 1;
    }

    /// Sends to an agent's current connection. Returns false if it is gone.
    async fn send(&self, agent: AgentId, msg: &WireMessage) -> bool {
        match self.agents.get(&agent).and_then(|l| l.peer) {
            Some(peer) => self.send_to_peer(peer, msg).await,
            None => false,
        }
    }

    async fn send_to_peer(&self, peer: PeerId, msg: &WireMessage) -> bool {
        let envelope = match msg.encode(self.ctx.wall_clock_ms()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("failed to encode {}: {}", msg.header(), err);
                return false;
            }
        };
        match self.net.send(peer, envelope).await {
            Ok(()) => true,
            Err(err) => {
                debug!(%peer, "send failed: {}", err);
                false
            }
        }
    }
}

fn payload_quits(command: &Command, role: Role) -> bool {
    command.is_control() && role.is_privileged()
}
