//! Mode drivers - one simulation core, three ways to run it.
//!
//! ```text
//!                    ┌──────────────────────┐
//!   run_session ───► │   dyn Session        │
//!                    ├──────────────────────┤
//!                    │ HeadlessServer       │  authoritative World + Scheduler + NetworkSession
//!                    │ ReplaySession        │  World + Scheduler fed from an ActionLog
//!                    │ InteractiveClient    │  Prediction + renderer + input, talks to a server
//!                    └──────────────────────┘
//! ```

mod headless;
mod interactive;
mod replay;

pub use headless::{HeadlessOptions, HeadlessServer};
pub use interactive::{InputSource, InteractiveClient, NullRenderer, Renderer};
pub use replay::ReplaySession;

use crate::action_log::EndReason;
use crate::command::Command;
use crate::error::{RejectedReason, Result};
use crate::scheduler::SessionState;
use crate::types::AgentId;
use crate::world::{MatchResult, Snapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::{info, warn};

/// How a session is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Interactive,
    Headless,
    Replay,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Interactive => "interactive",
            Mode::Headless => "headless",
            Mode::Replay => "replay",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interactive" => Ok(Mode::Interactive),
            "headless" | "server" => Ok(Mode::Headless),
            "replay" => Ok(Mode::Replay),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// How a session went, for logs and `--json` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub mode: Mode,
    pub end_reason: Option<EndReason>,

    /// Last tick processed
    pub ticks: u64,

    /// Commands that changed the World (or, for a client, commands sent)
    pub applied: u64,

    pub rejected: BTreeMap<RejectedReason, u64>,

    /// Digest of the final World
    pub state_hash: u64,

    /// Team totals and winner in the final World
    #[serde(default)]
    pub result: MatchResult,

    /// End reason the replayed log was finalized with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_end: Option<EndReason>,
}

/// The capability every mode driver offers to the session loop.
#[async_trait]
pub trait Session: Send {
    fn mode(&self) -> Mode;

    /// Processes one tick (a client: one server frame) and returns the tick reached.
    async fn tick(&mut self) -> Result<u64>;

    /// Injects a command on behalf of `agent`.
    async fn apply_command(&mut self, agent: AgentId, command: Command) -> Result<()>;

    /// Synchronized view of the driver's current World.
    fn snapshot(&self) -> Snapshot;

    fn state(&self) -> SessionState;

    fn summary(&self) -> SessionSummary;

    /// Ends a running session with `Quit` on an outside stop request.
    fn interrupt(&mut self) -> Result<()>;

    /// Runs once after the session ended (notify peers, flush the log).
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives `session` until it ends.
///
/// # Errors
/// The first fatal error of the driver; `shutdown` still runs.
pub async fn run_session<S>(session: &mut S) -> Result<SessionSummary>
where
    S: Session + ?Sized,
{
    info!(mode = %session.mode(), "session loop started");
    let mut outcome = Ok(());
    while session.state().is_running() {
        if let Err(err) = session.tick().await {
            outcome = Err(err);
            break;
        }
    }

    let shutdown = session.shutdown().await;
    outcome?;
    shutdown?;

    let summary = session.summary();
    info!(
        mode = %summary.mode,
        ticks = summary.ticks,
        applied = summary.applied,
        hash = format_args!("{:016x}", summary.state_hash),
        "session loop finished"
    );
    Ok(summary)
}

/// Drives `session` like [`run_session`] until `stop` resolves first.
///
/// On a stop the pending tick is abandoned, the session ends with `Quit`
/// and `shutdown` runs before the summary is returned.
///
/// # Errors
/// The first fatal error of the driver or of its shutdown.
pub async fn run_session_until<S, F>(session: &mut S, stop: F) -> Result<SessionSummary>
where
    S: Session + ?Sized,
    F: Future,
{
    let finished = tokio::select! {
        result = run_session(session) => Some(result),
        _ = stop => None,
    };
    if let Some(result) = finished {
        return result;
    }

    warn!(mode = %session.mode(), "stop requested, ending the session");
    session.interrupt()?;
    session.shutdown().await?;
    Ok(session.summary())
}
