//! Arena Core - authoritative session engine for turn-paced agent games
//!
//! One process owns the World; remote AI agents submit commands under three
//! budgets (game time, think time, command rate). Everything that happened is
//! written to an action log that replays bit-for-bit.
//!
//! # Data flow
//!
//! ```text
//!   agents ──COMMAND──► NetworkSession ──Submission──► Scheduler ──► World
//!                                                         │            │
//!                                              ActionLog ◄┘            │ snapshot
//!                                                                      ▼
//!   agents ◄───────────────── SNAPSHOT (synchronized properties only) ─┘
//!
//!   replay:      ActionLog ──records──► Scheduler ──► World   (no network)
//!   interactive: input ──► Prediction ──► Predicted World ◄── SNAPSHOT
//! ```
//!
//! The [`SyncPolicyRegistry`] decides which properties cross the network and
//! which ones a client may predict; it is built once and shared read-only.

pub mod action_log;
pub mod command;
pub mod component;
pub mod config;
pub mod error;
pub mod modes;
pub mod network_session;
pub mod prediction;
pub mod protocol;
pub mod rate_limit;
pub mod scene;
pub mod scheduler;
pub mod sync_policy;
pub mod types;
pub mod world;

mod hashing;

// Re-export key types for convenience
pub use action_log::{ActionLog, ActionLogReader, ActionRecord, AgentInfo, EndReason, Outcome, SessionMetadata, SharedActionLog};
pub use command::Command;
pub use component::{ActorState, Component, ComponentKind, PropertyValue};
pub use config::SessionConfig;
pub use error::{RejectedReason, Result, SessionError};
pub use modes::{run_session, run_session_until, HeadlessOptions, HeadlessServer, InteractiveClient, Mode, ReplaySession, Session, SessionSummary};
pub use network_session::NetworkSession;
pub use prediction::Prediction;
pub use protocol::WireMessage;
pub use scene::SceneDefinition;
pub use scheduler::{AgentStatus, Scheduler, SessionState, Submission, TickReport, TickWindow};
pub use sync_policy::{SyncDescriptor, SyncPolicyRegistry};
pub use types::{AgentId, EntityId, Role};
pub use world::{MatchResult, Snapshot, TeamScore, World};
