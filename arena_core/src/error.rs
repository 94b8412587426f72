//! Error taxonomy for the session engine.
//!
//! Two families live here:
//! - [`RejectedReason`]: per-command outcomes. Always recoverable, always logged.
//! - [`SessionError`]: integrity and setup failures. Fatal for the caller.

use arena_env::EnvError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single command had no effect.
///
/// Rejections never abort a session; they are written to the action log next
/// to the command that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectedReason {
    /// The command references an entity or component that does not exist
    #[error("invalid target")]
    InvalidTarget,

    /// A component precondition failed (dead actor, negative health, cooldown)
    #[error("illegal transition")]
    IllegalTransition,

    /// The command arrived after the agent's think window closed, or never arrived
    #[error("think-time window expired")]
    Timeout,

    /// The agent exceeded its commands-per-second budget
    #[error("rate limited")]
    RateLimited,

    /// The agent was not connected when polled
    #[error("agent disconnected")]
    AgentDisconnected,
}

impl RejectedReason {
    /// All reasons, in declaration order.
    pub fn all() -> &'static [RejectedReason] {
        &[
            RejectedReason::InvalidTarget,
            RejectedReason::IllegalTransition,
            RejectedReason::Timeout,
            RejectedReason::RateLimited,
            RejectedReason::AgentDisconnected,
        ]
    }
}

/// Fatal errors raised by the session engine.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An action log failed validation or diverged during replay
    #[error("Corrupt action log: {0}")]
    CorruptActionLog(String),

    /// Missing or inconsistent configuration detected at startup
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Attempted to append to a log that has already been finalized
    #[error("Action log is finalized")]
    LogFinalized,

    /// A peer sent something outside the wire contract
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Filesystem failure while reading or writing logs and scenes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the environment layer (transport, clock)
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl SessionError {
    /// Creates a corrupt-log error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptActionLog(msg.into())
    }

    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;
