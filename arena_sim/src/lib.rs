//! Arena Deterministic Simulation Harness
//!
//! Runs the real headless session engine against scripted bots on a virtual
//! clock, so every think-time deadline, arrival order and network fault is
//! reproducible from one 64-bit seed.
//!
//! # Core Principle: nothing waits for real time
//!
//! - **Time**: `SimContext` only moves when the session sleeps; a sleep stops
//!   at every queued delivery on the way
//! - **Network**: `SimNetwork` hands frames to in-process bots and queues
//!   their answers with per-peer latency and jitter
//! - **Randomness**: bot reactions and jitter derive from the master seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                         │
//! │                                                              │
//! │  ┌───────────────────┐  frames   ┌────────────────────────┐  │
//! │  │  HeadlessServer   │◄─────────►│      SimNetwork        │  │
//! │  │ (arena_core, real)│           │  queue ─► SimBot × N   │  │
//! │  └────────┬──────────┘           └──────────▲─────────────┘  │
//! │           │ ActionLog                       │ sever/restore  │
//! │           ▼                                 │ latency        │
//! │  ┌───────────────────┐           ┌──────────┴─────────────┐  │
//! │  │   ReplaySession   │           │  SimNetworkController  │  │
//! │  │ (hash must match) │           └────────────────────────┘  │
//! │  └───────────────────┘                                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use arena_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Partition);
//! assert!(result.passed);
//! ```

mod context;
mod network;
pub mod bots;
pub mod runner;
pub mod scenarios;

pub use bots::{BotBehavior, BotTuning, SimBot};
pub use context::SimContext;
pub use network::{NetworkStats, SimNetwork, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
