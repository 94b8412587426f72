//! Common types for the arena environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-level identifier for one connection.
///
/// Connection ids are allocated by the transport in accept order and are
/// never reused within a process. `PeerId::SERVER` names the authoritative
/// endpoint from a client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The authoritative server endpoint.
    pub const SERVER: PeerId = PeerId(0);

    /// A client endpoint before the server has told it who it is.
    pub const UNASSIGNED: PeerId = PeerId(u64::MAX);
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Unique identifier for a session (recorded in action logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// One framed message as it crosses the transport.
///
/// The payload is opaque to the transport; the session decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// The raw frame bytes (one JSON document, no trailing newline)
    pub payload: Vec<u8>,

    /// Wall-clock milliseconds when the frame was created or received
    pub timestamp_ms: u64,
}

impl WireEnvelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            payload,
            timestamp_ms,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Something that happened on a peer's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new connection was accepted
    Connected,

    /// A complete frame arrived
    Message(WireEnvelope),

    /// The connection closed (remote hang-up, I/O error or severed)
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_seed_is_stable() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(3).to_string(), "peer#3");
        assert_eq!(PeerId::SERVER, PeerId(0));
    }
}
