//! Scenario runner - plays a scenario against the real session engine, then
//! replays its action log and compares the final World.

use crate::bots::SimBot;
use crate::context::SimContext;
use crate::network::{SimNetwork, SimNetworkController};
use crate::scenarios::{Fault, ScenarioId, ScenarioPlan, ScenarioRun};

use arena_core::{
    run_session, HeadlessOptions, HeadlessServer, RejectedReason, ReplaySession, SceneDefinition,
    Session, SessionError,
};
use arena_env::{NetworkController, PeerId, SessionContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub applied: u64,
    pub rejected: BTreeMap<RejectedReason, u64>,
    pub log_records: usize,

    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub disconnects: u64,
    pub reconnects: u64,

    /// Final World digest of the live run
    pub live_hash: u64,

    /// Final World digest after replaying the log
    pub replay_hash: u64,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of agents (for scenarios that scale)
    num_agents: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Game time in seconds (for scenarios that do not pin it)
    max_duration_secs: f64,
}

impl ScenarioRunner {
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self {
            seed,
            num_agents,
            tick_rate_hz: 60,
            max_duration_secs: 10.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    /// Sets the game time.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Runs a scenario on a fresh single-threaded runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(err) => self.failed(scenario, format!("cannot start runtime: {}", err)),
        }
    }

    /// Runs a scenario on the caller's runtime.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        match self.play(scenario).await {
            Ok(result) => result,
            Err(err) => {
                warn!(scenario = scenario.name(), "session error: {}", err);
                self.failed(scenario, err.to_string())
            }
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn play(&self, scenario: ScenarioId) -> Result<ScenarioResult, SessionError> {
        let plan = scenario.plan(self.num_agents, self.max_duration_secs, self.tick_rate_hz);
        let scene = SceneDefinition::arena();

        let ctx = SimContext::shared(self.seed);
        let controller = Arc::new(SimNetworkController::new());
        controller.set_default_latency(plan.latency_ms);
        let net = Arc::new(
            SimNetwork::new(Arc::clone(&ctx), Arc::clone(&controller)).with_jitter(plan.jitter_ms),
        );

        // Staggered joins: agent ids follow the plan order
        for (i, slot) in plan.bots.iter().enumerate() {
            let bot = SimBot::new(slot.username.clone(), slot.team, slot.behavior, ctx.fork_seed())
                .with_tuning(slot.tuning.clone());
            let peer = net.add_bot(bot, Duration::from_millis(3 * i as u64));
            if let Some(ms) = slot.latency_ms {
                controller.set_peer_latency(peer, ms);
            }
        }

        let options = HeadlessOptions {
            expected_agents: plan.players(),
            lobby_timeout: Duration::from_secs(5),
            log_path: None,
        };
        let mut server = HeadlessServer::new(
            Arc::clone(&ctx),
            Arc::clone(&net),
            plan.config.clone(),
            scene.clone(),
            options,
        )?;

        let played = self.drive(&mut server, &plan, &net).await;
        server.shutdown().await?;
        played?;

        let summary = server.summary();
        let log = server.log().to_log();
        let network = net.stats();
        let final_time_secs = ctx.now().as_secs_f64();

        let mut replay = ReplaySession::new(log.clone(), &scene)?;
        let replayed = run_session(&mut replay).await?;

        let metrics = ScenarioMetrics {
            applied: summary.applied,
            rejected: summary.rejected.clone(),
            log_records: log.len(),
            frames_sent: network.frames_sent,
            frames_dropped: network.frames_dropped,
            disconnects: network.disconnects,
            reconnects: network.reconnects,
            live_hash: summary.state_hash,
            replay_hash: replayed.state_hash,
        };

        let run = ScenarioRun {
            config: plan.config.clone(),
            summary,
            log,
            network,
        };
        let failure = if replayed.state_hash != run.summary.state_hash {
            Some(format!(
                "replay diverged: live {:016x}, replayed {:016x}",
                run.summary.state_hash, replayed.state_hash
            ))
        } else if replayed.ticks != run.summary.ticks {
            Some(format!(
                "replay stopped at tick {}, live run at {}",
                replayed.ticks, run.summary.ticks
            ))
        } else if replayed.recorded_end != run.summary.end_reason {
            Some(format!(
                "log recorded {:?}, live run ended {:?}",
                replayed.recorded_end, run.summary.end_reason
            ))
        } else if replayed.result != run.summary.result {
            Some(format!(
                "replay scored {:?}, live run {:?}",
                replayed.result, run.summary.result
            ))
        } else {
            scenario.verify(&run).err()
        };

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure.is_none(),
            total_ticks: run.summary.ticks,
            final_time_secs,
            failure_reason: failure,
            metrics,
        })
    }

    /// Ticks the server to the end, injecting faults between ticks.
    async fn drive(
        &self,
        server: &mut HeadlessServer<SimContext, SimNetwork>,
        plan: &ScenarioPlan,
        net: &SimNetwork,
    ) -> Result<(), SessionError> {
        let max_ticks = plan.config.limit_ticks() + 1;
        let mut severed: BTreeMap<String, PeerId> = BTreeMap::new();

        while server.state().is_running() {
            let next = server.scheduler().tick() + 1;
            if next > max_ticks {
                return Err(SessionError::protocol(format!(
                    "session still running after tick {}",
                    max_ticks
                )));
            }
            for fault in plan.faults_before(next) {
                self.inject(fault, net, &mut severed);
            }
            let tick = server.tick().await?;
            if tick % 60 == 0 {
                debug!(tick, "scenario progress");
            }
        }
        Ok(())
    }

    fn inject(&self, fault: &Fault, net: &SimNetwork, severed: &mut BTreeMap<String, PeerId>) {
        let controller = net.controller();
        match fault {
            Fault::Sever(username) => match net.peer_of(username) {
                Some(peer) => {
                    info!(%username, %peer, "severing link");
                    controller.sever(peer);
                    severed.insert(username.clone(), peer);
                }
                None => warn!(%username, "cannot sever: not connected"),
            },
            Fault::Restore(username) => {
                if let Some(peer) = severed.remove(username) {
                    info!(%username, %peer, "restoring link");
                    controller.restore(peer);
                }
            }
            Fault::Latency(username, ms) => match net.peer_of(username) {
                Some(peer) => controller.set_peer_latency(peer, *ms),
                None => warn!(%username, "cannot change latency: not connected"),
            },
        }
    }
}
