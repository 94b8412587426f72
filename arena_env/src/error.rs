//! Transport and clock errors.

use crate::types::PeerId;
use thiserror::Error;

/// Failures of the environment layer. None of them is fatal to a headless
/// session on its own; the caller decides whether the peer or the session
/// is lost.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Socket or queue failure
    #[error("network error: {0}")]
    Network(String),

    /// No live connection to the peer (never joined, left, or severed)
    #[error("{0} is not connected")]
    PeerUnreachable(PeerId),

    /// Frame that is not a valid JSON `WireMessage`
    #[error("malformed frame: {0}")]
    Serialization(String),

    /// Nothing arrived within the allowed silence (ms)
    #[error("no frame within {0}ms")]
    Timeout(u64),
}

impl EnvError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn unreachable(peer: PeerId) -> Self {
        Self::PeerUnreachable(peer)
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}
