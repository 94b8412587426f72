//! Headless server: authoritative World, Scheduler and Network Session.

use super::{Mode, Session, SessionSummary};
use crate::action_log::{ActionLog, EndReason, SessionMetadata, SharedActionLog};
use crate::command::Command;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::network_session::NetworkSession;
use crate::scene::SceneDefinition;
use crate::scheduler::{AgentStatus, Scheduler, SessionState, TickReport};
use crate::types::{AgentId, Role};
use crate::world::Snapshot;
use arena_env::{NetworkTransport, SessionContext, SessionId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lobby and persistence settings of a headless run.
#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    /// Players to wait for before tick 1 (default: 1)
    pub expected_agents: usize,

    /// Longest lobby wait (default: 30s)
    pub lobby_timeout: Duration,

    /// Where to write the action log at the end
    pub log_path: Option<PathBuf>,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            expected_agents: 1,
            lobby_timeout: Duration::from_secs(30),
            log_path: None,
        }
    }
}

pub struct HeadlessServer<Ctx, Net>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
{
    ctx: Arc<Ctx>,
    scene: SceneDefinition,
    scheduler: Scheduler,
    session: NetworkSession<Ctx, Net>,
    log: SharedActionLog,
    options: HeadlessOptions,
    started: bool,
    last_report: Option<TickReport>,
}

impl<Ctx, Net> HeadlessServer<Ctx, Net>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
{
    /// # Errors
    /// `ConfigurationInvalid` for a bad config or scene.
    pub fn new(
        ctx: Arc<Ctx>,
        net: Arc<Net>,
        config: SessionConfig,
        scene: SceneDefinition,
        options: HeadlessOptions,
    ) -> Result<Self> {
        config.validate()?;
        let world = scene.build_world()?;
        let metadata = SessionMetadata {
            session_id: SessionId::from_seed(ctx.seed()),
            game_time_secs: config.game_time_secs,
            think_time_secs: config.think_time_secs,
            commands_per_second: config.commands_per_second,
            tick_rate_hz: config.tick_rate_hz,
            scene: scene.name.clone(),
            agents: Vec::new(),
        };
        let log = SharedActionLog::new(ActionLog::new(metadata));
        let scheduler = Scheduler::new(world, config, Some(log.clone()))?;
        Ok(Self {
            session: NetworkSession::new(Arc::clone(&ctx), net),
            ctx,
            scene,
            scheduler,
            log,
            options,
            started: false,
            last_report: None,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Live handle on the log being written.
    pub fn log(&self) -> &SharedActionLog {
        &self.log
    }

    /// Report of the most recent tick.
    pub fn last_report(&self) -> Option<&TickReport> {
        self.last_report.as_ref()
    }

    /// Waits for the expected players, spawns them and locks the roster.
    ///
    /// Starts with whoever showed up if the lobby times out.
    pub async fn lobby(&mut self) -> Result<usize> {
        info!(
            expected = self.options.expected_agents,
            timeout_ms = self.options.lobby_timeout.as_millis() as u64,
            "waiting for agents"
        );
        let connected = self
            .session
            .wait_for_agents(self.options.expected_agents, self.options.lobby_timeout)
            .await?;
        if connected < self.options.expected_agents {
            warn!(connected, expected = self.options.expected_agents, "lobby timed out, starting anyway");
        }
        self.admit_joined().await?;
        self.session.lock_roster();
        self.started = true;
        info!(players = connected, "session starting");
        Ok(connected)
    }

    /// Registers new agents; players get an entity from the scene template.
    async fn admit_joined(&mut self) -> Result<()> {
        for mut info in self.session.take_joined() {
            if info.role == Role::Agent {
                let entity = self
                    .scene
                    .spawn_player(self.scheduler.world_mut(), &info.username, info.team)?;
                self.session.set_entity(info.agent_id, entity);
                info.entity = Some(entity);
            }
            let agent = info.agent_id;
            self.scheduler.register_agent(info)?;
            let snapshot = self.scheduler.world().snapshot(self.scheduler.tick());
            self.session.welcome(agent, &snapshot).await;
        }
        Ok(())
    }

    fn apply_status_changes(&mut self) {
        for (agent, status) in self.session.take_status_changes() {
            self.scheduler.set_status(agent, status);
        }
    }
}

#[async_trait]
impl<Ctx, Net> Session for HeadlessServer<Ctx, Net>
where
    Ctx: SessionContext,
    Net: NetworkTransport,
{
    fn mode(&self) -> Mode {
        Mode::Headless
    }

    async fn tick(&mut self) -> Result<u64> {
        if !self.started {
            self.lobby().await?;
        }

        let now = self.ctx.now();
        let Some(window) = self.scheduler.open_tick(now) else {
            return Ok(self.scheduler.tick());
        };
        let before = self.scheduler.world().snapshot(self.scheduler.tick());

        self.session.request_commands(&window, &before).await?;
        let tick_end = window.opened_at + self.scheduler.config().tick_duration();
        if !self.session.quit_requested() {
            self.session.service(tick_end).await?;
        }

        // Late observers and controllers; players were locked in at the lobby
        self.admit_joined().await?;
        self.apply_status_changes();

        let submissions = self.session.take_submissions();
        debug!(tick = window.tick, submissions = submissions.len(), "closing tick");
        let report = self.scheduler.close_tick(&window, submissions)?;
        self.session.broadcast_snapshot(&report.snapshot).await;

        if self.session.quit_requested() && self.scheduler.state().is_running() {
            info!(tick = report.tick, "shutdown requested");
            self.scheduler.quit()?;
        }

        let tick = report.tick;
        self.last_report = Some(report);
        Ok(tick)
    }

    async fn apply_command(&mut self, agent: AgentId, command: Command) -> Result<()> {
        if self.scheduler.agent_status(agent) != Some(AgentStatus::Connected) {
            return Err(SessionError::protocol(format!("{} is not an active agent", agent)));
        }
        self.session.submit(agent, self.scheduler.tick() + 1, command)
    }

    fn snapshot(&self) -> Snapshot {
        self.scheduler.world().snapshot(self.scheduler.tick())
    }

    fn state(&self) -> SessionState {
        self.scheduler.state()
    }

    fn summary(&self) -> SessionSummary {
        let stats = self.scheduler.stats();
        SessionSummary {
            mode: Mode::Headless,
            end_reason: self.scheduler.state().end_reason(),
            ticks: self.scheduler.tick(),
            applied: stats.applied,
            rejected: stats.rejected.clone(),
            state_hash: self.scheduler.world().state_hash(),
            result: self.scheduler.world().match_result(),
            recorded_end: None,
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.scheduler.state().is_running() {
            info!(tick = self.scheduler.tick(), "interrupted");
        }
        self.scheduler.quit()
    }

    async fn shutdown(&mut self) -> Result<()> {
        // A fatal error may leave the session running; close the log anyway
        self.scheduler.end(EndReason::Quit)?;
        let reason = self
            .scheduler
            .state()
            .end_reason()
            .unwrap_or(EndReason::Quit);
        let result = self.scheduler.world().match_result();
        info!(%reason, winner = ?result.winner, "match result");
        self.session
            .finish(reason, self.scheduler.tick(), result)
            .await;

        if let Some(path) = &self.options.log_path {
            self.log.save(path)?;
            info!(path = %path.display(), records = self.log.len(), "action log saved");
        }
        Ok(())
    }
}
