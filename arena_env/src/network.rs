//! Network transport abstraction between the session and its peers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PeerId, TransportEvent, WireEnvelope};

/// Abstraction for framed message I/O between a session and remote peers.
///
/// # Implementations
///
/// - **Production**: `TcpServerTransport` / `TcpClientTransport`
///   (newline-delimited frames over TCP)
/// - **Simulation**: `SimNetwork` - in-memory peers with scripted replies
///
/// # Event Flow
///
/// ```text
/// Peer                        Transport                       Session
///   |-- connect -------------->|                                |
///   |                          |-- (peer, Connected) ---------->|
///   |-- frame ---------------->|                                |
///   |                          |-- (peer, Message(envelope)) -->|
///   |<-- frame ----------------|<-- send(peer, envelope) -------|
///   |-- close ---------------->|                                |
///   |                          |-- (peer, Disconnected) ------->|
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends one frame to a peer.
    ///
    /// # Returns
    /// * `Ok(())` - Frame queued for delivery
    /// * `Err(EnvError::PeerUnreachable)` - The peer is not connected
    async fn send(&self, target: PeerId, envelope: WireEnvelope) -> Result<(), EnvError>;

    /// Receives the next transport event.
    ///
    /// # Returns
    /// * `Some((peer, event))` - A connection, frame or disconnection
    /// * `None` - The transport was shut down
    ///
    /// # Blocking
    /// This method waits until an event is available. Callers bound the wait
    /// by racing it against `SessionContext::sleep`.
    async fn recv(&self) -> Option<(PeerId, TransportEvent)>;

    /// Sends one frame to every connected peer.
    ///
    /// # Returns
    /// Number of peers the frame was queued for.
    async fn broadcast(&self, envelope: WireEnvelope) -> usize;

    /// Closes the connection to a peer (no-op if already gone).
    async fn disconnect(&self, peer: PeerId);

    /// Returns this endpoint's ID.
    fn local_id(&self) -> PeerId;
}

/// Fault injection for simulated transports.
pub trait NetworkController: Send + Sync {
    /// Cuts a peer off: pending frames are dropped and a disconnection is reported.
    fn sever(&self, peer: PeerId);

    /// Lets a severed peer connect again.
    fn restore(&self, peer: PeerId);

    /// Sets the reply latency for a peer.
    fn set_peer_latency(&self, peer: PeerId, latency_ms: u64);
}
