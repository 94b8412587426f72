//! Interactive client: connects to a server, predicts locally, reconciles on snapshots.
//!
//! Rendering and input devices are collaborators behind [`Renderer`] and
//! [`InputSource`]; the client only decides what to draw and when to ask.

use super::{Mode, Session, SessionSummary};
use crate::action_log::EndReason;
use crate::command::Command;
use crate::error::{Result, SessionError};
use crate::prediction::Prediction;
use crate::protocol::WireMessage;
use crate::scheduler::SessionState;
use crate::sync_policy::SyncPolicyRegistry;
use crate::types::{AgentId, EntityId, Role};
use crate::world::{MatchResult, Snapshot, World};
use arena_env::{EnvError, NetworkTransport, PeerId, SessionContext, TransportEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Draws the Predicted World.
pub trait Renderer: Send {
    fn render(&mut self, tick: u64, world: &World);

    fn finished(&mut self, _reason: EndReason, _final_tick: u64) {}
}

/// Renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _tick: u64, _world: &World) {}
}

/// Produces the local command: for a player when the server asks, for a
/// controller after every snapshot.
pub trait InputSource: Send {
    fn next_command(&mut self, tick: u64, me: Option<EntityId>, view: &World) -> Option<Command>;
}

impl<F> InputSource for F
where
    F: FnMut(u64, Option<EntityId>, &World) -> Option<Command> + Send,
{
    fn next_command(&mut self, tick: u64, me: Option<EntityId>, view: &World) -> Option<Command> {
        self(tick, me, view)
    }
}

pub struct InteractiveClient<Ctx, Net, R, I>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
    R: Renderer,
    I: InputSource,
{
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    renderer: R,
    input: I,

    username: String,
    team: u8,
    role: Role,

    agent: Option<AgentId>,
    entity: Option<EntityId>,
    prediction: Prediction,

    /// Latest authoritative tick seen
    tick: u64,
    state: SessionState,
    sent: u64,
    result: MatchResult,

    /// Longest silence from the server before giving up
    idle_timeout: Duration,
}

impl<Ctx, Net, R, I> InteractiveClient<Ctx, Net, R, I>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
    R: Renderer,
    I: InputSource,
{
    pub fn new(
        ctx: Arc<Ctx>,
        net: Arc<Net>,
        policy: Arc<SyncPolicyRegistry>,
        username: impl Into<String>,
        team: u8,
        role: Role,
        renderer: R,
        input: I,
    ) -> Self {
        Self {
            ctx,
            net,
            renderer,
            input,
            username: username.into(),
            team,
            role,
            agent: None,
            entity: None,
            prediction: Prediction::new(World::new(policy)),
            tick: 0,
            state: SessionState::Running,
            sent: 0,
            result: MatchResult::default(),
            idle_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn prediction(&self) -> &Prediction {
        &self.prediction
    }

    /// Sends HELLO and waits for WELCOME.
    ///
    /// # Errors
    /// `Protocol` if the server answers with ABORT.
    pub async fn connect(&mut self) -> Result<AgentId> {
        let hello = WireMessage::Hello {
            username: self.username.clone(),
            team: self.team,
            role: self.role,
        };
        self.send(&hello).await?;
        info!(username = %self.username, "HELLO sent");

        while self.agent.is_none() {
            let msg = self.next_message().await?;
            self.handle(msg).await?;
            if !self.state.is_running() {
                return Err(SessionError::protocol("session ended during handshake"));
            }
        }
        self.agent
            .ok_or_else(|| SessionError::protocol("no WELCOME received"))
    }

    async fn next_message(&mut self) -> Result<WireMessage> {
        loop {
            let deadline = self.ctx.now() + self.idle_timeout;
            let net = Arc::clone(&self.net);
            let ctx = Arc::clone(&self.ctx);
            let event = tokio::select! {
                biased;
                event = net.recv() => event,
                _ = ctx.sleep_until(deadline) => {
                    return Err(EnvError::Timeout(self.idle_timeout.as_millis() as u64).into());
                }
            };
            match event {
                Some((_, TransportEvent::Message(envelope))) => match WireMessage::decode(&envelope) {
                    Ok(msg) => return Ok(msg),
                    Err(err) => warn!("dropping malformed frame from server: {}", err),
                },
                Some((_, TransportEvent::Connected)) => debug!("connected to server"),
                Some((_, TransportEvent::Disconnected)) | None => {
                    return Err(EnvError::network("server closed the connection").into());
                }
            }
        }
    }

    async fn handle(&mut self, msg: WireMessage) -> Result<()> {
        match msg {
            WireMessage::Welcome { agent_id, entity, snapshot, .. } => {
                info!(%agent_id, ?entity, "welcomed");
                self.agent = Some(agent_id);
                self.entity = entity;
                self.absorb(&snapshot)?;
            }
            WireMessage::AskCommand { tick, snapshot } => {
                self.absorb(&snapshot)?;
                let command = self
                    .input
                    .next_command(tick, self.entity, self.prediction.predicted());
                if let Some(command) = command {
                    self.submit(tick, command).await?;
                }
            }
            WireMessage::Snapshot { snapshot } => {
                self.absorb(&snapshot)?;
                self.renderer.render(self.tick, self.prediction.predicted());
                // Controllers are never polled; they act between ticks
                if self.role.is_privileged() && self.agent.is_some() {
                    let command = self
                        .input
                        .next_command(snapshot.tick, self.entity, self.prediction.predicted());
                    if let Some(command) = command {
                        self.submit(snapshot.tick + 1, command).await?;
                    }
                }
            }
            WireMessage::GameFinished { reason, final_tick, result } => {
                info!(%reason, final_tick, winner = ?result.winner, "game finished");
                self.state = SessionState::Ended(reason);
                self.result = result;
                self.renderer.finished(reason, final_tick);
            }
            WireMessage::Abort { error, blame } => {
                warn!(%error, ?blame, "server aborted");
                return Err(SessionError::protocol(format!("server aborted: {}", error)));
            }
            other => warn!(header = other.header(), "unexpected frame from server"),
        }
        Ok(())
    }

    fn absorb(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.prediction.reconcile(snapshot)?;
        self.tick = self.tick.max(snapshot.tick);
        Ok(())
    }

    async fn submit(&mut self, tick: u64, command: Command) -> Result<()> {
        let agent_id = self
            .agent
            .ok_or_else(|| SessionError::protocol("not connected"))?;
        let msg = WireMessage::Command {
            agent_id,
            tick,
            payload: command.clone(),
        };
        self.send(&msg).await?;
        self.sent += 1;
        if let Err(reason) = self.prediction.apply_local(tick, command) {
            debug!(tick, %reason, "local prediction rejected the command");
        }
        Ok(())
    }

    async fn send(&mut self, msg: &WireMessage) -> Result<()> {
        let envelope = msg.encode(self.ctx.wall_clock_ms())?;
        self.net.send(PeerId::SERVER, envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl<Ctx, Net, R, I> Session for InteractiveClient<Ctx, Net, R, I>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
    R: Renderer,
    I: InputSource,
{
    fn mode(&self) -> Mode {
        Mode::Interactive
    }

    async fn tick(&mut self) -> Result<u64> {
        if self.agent.is_none() {
            self.connect().await?;
            return Ok(self.tick);
        }
        let msg = self.next_message().await?;
        self.handle(msg).await?;
        Ok(self.tick)
    }

    async fn apply_command(&mut self, agent: AgentId, command: Command) -> Result<()> {
        if self.agent != Some(agent) {
            return Err(SessionError::protocol(format!("this client is not {}", agent)));
        }
        self.submit(self.tick + 1, command).await
    }

    fn snapshot(&self) -> Snapshot {
        self.prediction.predicted().snapshot(self.tick)
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            mode: Mode::Interactive,
            end_reason: self.state.end_reason(),
            ticks: self.tick,
            applied: self.sent,
            rejected: BTreeMap::new(),
            state_hash: self.prediction.base().state_hash(),
            result: self.result.clone(),
            recorded_end: None,
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.state.is_running() {
            self.state = SessionState::Ended(EndReason::Quit);
        }
        Ok(())
    }
}
