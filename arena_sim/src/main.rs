//! Arena CLI
//!
//! Runs a headless server, an interactive client, a replay of a recorded
//! action log, or the deterministic simulation scenarios.

use arena_core::modes::{InputSource, Renderer};
use arena_core::{
    run_session_until, Command, ComponentKind, EndReason, EntityId, HeadlessOptions, HeadlessServer,
    InteractiveClient, PropertyValue, ReplaySession, Role, SceneDefinition, SessionConfig,
    SessionError, SessionSummary, World,
};
use arena_env::{TcpClientTransport, TcpServerTransport, TokioContext};
use arena_sim::scenarios::ScenarioId;
use arena_sim::{ScenarioResult, ScenarioRunner};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliMode {
    /// Deterministic simulation scenarios
    Sim,
    /// Authoritative server over TCP
    #[value(alias = "server")]
    Headless,
    /// Re-execute a recorded action log
    Replay,
    /// Connect to a server as a player
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliRole {
    Agent,
    Observer,
    Controller,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Agent => Role::Agent,
            CliRole::Observer => Role::Observer,
            CliRole::Controller => Role::Controller,
        }
    }
}

/// Arena session engine
#[derive(Parser, Debug)]
#[command(name = "arena")]
#[command(about = "Turn-paced agent sessions: serve, play, replay or simulate", long_about = None)]
struct Args {
    /// What to run
    #[arg(value_enum, default_value = "sim")]
    mode: CliMode,

    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Players to wait for (headless) or scale to (sim)
    #[arg(short, long, default_value = "2")]
    agents: usize,

    /// Scenario to run in sim mode (silent_agent, duel, rate_flood, slow_thinker,
    /// flaky_link, partition, controller_quit, brawl, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (sim mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Game time per scenario in seconds (sim mode)
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// Game-time limit in seconds
    #[arg(long, default_value = "60")]
    game_time: f64,

    /// Per-agent think-time bank in seconds
    #[arg(long, default_value = "150")]
    think_time: f64,

    /// Per-agent command-rate limit
    #[arg(long, default_value = "4")]
    commands_per_second: f64,

    /// Fixed tick rate in Hz
    #[arg(long, default_value = "60")]
    tick_rate: u32,

    /// TCP port of the server
    #[arg(short, long, default_value = "2049")]
    port: u16,

    /// Server host (interactive mode)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Action-log file: written by headless, read by replay
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Built-in scene name or path to a scene JSON file
    #[arg(long, default_value = "arena")]
    scene: String,

    /// Longest wait for players before the first tick (seconds)
    #[arg(long, default_value = "30")]
    lobby_timeout: f64,

    /// Player name (interactive mode)
    #[arg(short, long, default_value = "player")]
    username: String,

    /// Team (interactive mode)
    #[arg(long, default_value = "0")]
    team: u8,

    /// Role announced to the server (interactive mode)
    #[arg(long, value_enum, default_value = "agent")]
    role: CliRole,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for scripts and CI
    #[arg(long)]
    json: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            game_time_secs: self.game_time,
            think_time_secs: self.think_time,
            commands_per_second: self.commands_per_second,
            tick_rate_hz: self.tick_rate,
            port: self.port,
        }
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", err);
    }

    let ok = match args.mode {
        CliMode::Sim => run_sim(&args),
        mode => run_session_mode(&args, mode),
    };

    // Exit with proper code for CI
    if !ok {
        std::process::exit(1);
    }
}

fn run_session_mode(args: &Args, mode: CliMode) -> bool {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {}", err);
            return false;
        }
    };

    let outcome = runtime.block_on(async {
        match mode {
            CliMode::Headless => run_headless(args).await,
            CliMode::Replay => run_replay(args).await,
            CliMode::Interactive => run_interactive(args).await,
            CliMode::Sim => Err(SessionError::config("sim mode is not a single session")),
        }
    });

    match outcome {
        Ok(summary) => {
            print_summary(args, &summary);
            true
        }
        Err(err) => {
            error!("Session failed: {}", err);
            false
        }
    }
}

fn print_summary(args: &Args, summary: &SessionSummary) {
    if args.json {
        match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(err) => error!("Failed to encode summary: {}", err),
        }
        return;
    }
    info!(
        "{} session ended ({}) after {} ticks: {} applied, {} rejected, state {:016x}",
        summary.mode,
        summary
            .end_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "running".into()),
        summary.ticks,
        summary.applied,
        summary.rejected.values().sum::<u64>(),
        summary.state_hash
    );
    for (reason, count) in &summary.rejected {
        info!("  {:<20} {}", reason.to_string(), count);
    }
    for team in &summary.result.scores {
        info!("  team {:<15} {:.0}", team.team, team.score);
    }
    match summary.result.winner {
        Some(team) => info!("Winner: team {}", team),
        None if !summary.result.scores.is_empty() => info!("No winner (tie)"),
        None => {}
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, shutting down");
}

async fn run_headless(args: &Args) -> Result<SessionSummary, SessionError> {
    let config = args.session_config();
    let scene = SceneDefinition::resolve(&args.scene)?;
    let ctx = TokioContext::shared();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let net = Arc::new(TcpServerTransport::bind(addr).await?);
    info!("Arena server listening on {}", net.local_addr());

    let options = HeadlessOptions {
        expected_agents: args.agents,
        lobby_timeout: Duration::from_secs_f64(args.lobby_timeout.max(0.0)),
        log_path: args.log.clone(),
    };
    let mut server = HeadlessServer::new(ctx, net, config, scene, options)?;
    run_session_until(&mut server, shutdown_signal()).await
}

async fn run_replay(args: &Args) -> Result<SessionSummary, SessionError> {
    let path = args
        .log
        .as_ref()
        .ok_or_else(|| SessionError::config("replay needs --log <file>"))?;
    let scene = SceneDefinition::resolve(&args.scene)?;
    let mut replay = ReplaySession::from_file(path, &scene)?;
    run_session_until(&mut replay, shutdown_signal()).await
}

async fn run_interactive(args: &Args) -> Result<SessionSummary, SessionError> {
    let scene = SceneDefinition::resolve(&args.scene)?;
    let policy = Arc::new(scene.policy()?);

    let addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| SessionError::config(format!("cannot resolve {}", args.host)))?;
    let net = Arc::new(TcpClientTransport::connect(addr).await?);
    info!("Connected to {}", addr);

    let mut client = InteractiveClient::new(
        TokioContext::shared(),
        net,
        policy,
        args.username.clone(),
        args.team,
        args.role.into(),
        LogRenderer::default(),
        StdinInput::spawn(),
    );
    run_session_until(&mut client, shutdown_signal()).await
}

/// Logs the local player's view once per second of ticks.
#[derive(Debug, Default)]
struct LogRenderer {
    last_logged: u64,
}

impl Renderer for LogRenderer {
    fn render(&mut self, tick: u64, world: &World) {
        if tick < self.last_logged + 60 {
            return;
        }
        self.last_logged = tick;
        let snapshot = world.snapshot(tick);
        for (id, components) in &snapshot.entities {
            let pos = components
                .get(&ComponentKind::Transform)
                .and_then(|p| p.get("pos").copied());
            let health = components
                .get(&ComponentKind::Character)
                .and_then(|p| p.get("health").copied());
            if let (Some(PropertyValue::Vector(p)), Some(PropertyValue::Float(h))) = (pos, health) {
                info!(tick, "{} at ({:.0}, {:.0}, {:.0}) health {:.0}", id, p[0], p[1], p[2], h);
            }
        }
    }

    fn finished(&mut self, reason: EndReason, final_tick: u64) {
        info!("Game finished at tick {}: {}", final_tick, reason);
    }
}

/// Reads commands from stdin, one per line; the latest line wins.
///
/// Players are asked once per poll interval, controllers after every tick.
///
/// `move <x> <y> [z]`, `stop`, `shoot <entity>`, `quit`
struct StdinInput {
    lines: mpsc::UnboundedReceiver<String>,
}

impl StdinInput {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines: rx }
    }
}

impl InputSource for StdinInput {
    fn next_command(&mut self, _tick: u64, me: Option<EntityId>, _view: &World) -> Option<Command> {
        let mut latest = None;
        while let Ok(line) = self.lines.try_recv() {
            latest = Some(line);
        }
        let line = latest?;
        match parse_command(&line, me) {
            Ok(command) => Some(command),
            Err(err) => {
                warn!("{}", err);
                None
            }
        }
    }
}

fn parse_command(line: &str, me: Option<EntityId>) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = words.split_first() else {
        return Err("empty command".into());
    };
    if verb == "quit" {
        return Ok(Command::Quit);
    }
    let entity = me.ok_or_else(|| format!("'{}' needs a player entity", verb))?;
    let numbers: Result<Vec<f32>, _> = rest.iter().map(|w| w.parse::<f32>()).collect();
    let numbers = numbers.map_err(|e| format!("bad number in '{}': {}", line, e))?;

    match (verb, numbers.as_slice()) {
        ("move", [x, y]) => Ok(Command::Move { entity, direction: [*x, *y, 0.0] }),
        ("move", [x, y, z]) => Ok(Command::Move { entity, direction: [*x, *y, *z] }),
        ("stop", []) => Ok(Command::Stop { entity }),
        ("shoot", [target]) if *target >= 0.0 => Ok(Command::Shoot {
            entity,
            target: EntityId(*target as u32),
        }),
        _ => Err(format!("unknown command '{}' (move x y [z] | stop | shoot <id> | quit)", line)),
    }
}

fn run_sim(args: &Args) -> bool {
    if !args.json {
        info!("Arena simulation harness v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(id) => vec![id],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return false;
            }
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.agents)
            .with_tick_rate(args.tick_rate)
            .with_duration(args.duration);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED - {} ticks", scenario.name(), seed, result.total_ticks);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(err) => error!("Failed to encode results: {}", err),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("All {} scenario runs passed", total);
        } else {
            error!("{}/{} scenario runs failed", failed, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    failed == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let me = Some(EntityId(3));
        assert_eq!(
            parse_command("move 1 0", me),
            Ok(Command::Move { entity: EntityId(3), direction: [1.0, 0.0, 0.0] })
        );
        assert_eq!(parse_command("shoot 2", me), Ok(Command::Shoot { entity: EntityId(3), target: EntityId(2) }));
        assert_eq!(parse_command("quit", None), Ok(Command::Quit));
        assert!(parse_command("stop", None).is_err());
        assert!(parse_command("dance", me).is_err());
        assert!(parse_command("move x y", me).is_err());
    }

    #[test]
    fn test_args_parse_modes() {
        let args = Args::parse_from(["arena", "server", "--port", "3000", "--log", "game.json"]);
        assert_eq!(args.mode, CliMode::Headless);
        assert_eq!(args.session_config().port, 3000);

        let args = Args::parse_from(["arena"]);
        assert_eq!(args.mode, CliMode::Sim);
        assert_eq!(args.session_config(), SessionConfig::default());
    }
}
