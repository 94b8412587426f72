//! Production TCP transports.
//!
//! Frames are single-line JSON documents terminated by `\n`, which is what the
//! remote AI agents speak. Each connection gets a reader task and a writer
//! task; the session only ever sees [`TransportEvent`]s through a channel, so
//! a slow socket can never stall the tick loop. Outbound queues are bounded:
//! a peer that stops reading is closed instead of buffered for, and a frame
//! longer than [`MAX_FRAME_BYTES`] ends the connection.

use crate::error::EnvError;
use crate::network::NetworkTransport;
use crate::types::{PeerId, TransportEvent, WireEnvelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capacity of the inbound event queue shared by all connections.
const EVENT_QUEUE_CAPACITY: usize = 4096;

/// Frames waiting for one peer's socket before the peer counts as stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Longest accepted frame, newline excluded.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Outbound side of one server connection.
struct PeerLink {
    frames: mpsc::Sender<Vec<u8>>,

    /// Set to force both socket tasks down without draining
    close: watch::Sender<bool>,
}

type PeerTable = Arc<Mutex<HashMap<PeerId, PeerLink>>>;
type EventSender = mpsc::Sender<(PeerId, TransportEvent)>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolves once the connection is force-closed; pends forever otherwise.
async fn force_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Queues a frame for `peer`. A peer whose queue is full has stopped reading
/// and is closed.
fn queue_frame(
    peers: &mut HashMap<PeerId, PeerLink>,
    peer: PeerId,
    frame: Vec<u8>,
) -> Result<(), EnvError> {
    let link = peers.get(&peer).ok_or_else(|| EnvError::unreachable(peer))?;
    match link.frames.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            warn!(%peer, queued = OUTBOUND_QUEUE_CAPACITY, "peer stopped reading, closing");
            if let Some(link) = peers.remove(&peer) {
                let _ = link.close.send(true);
            }
            Err(EnvError::network(format!("{} stopped reading", peer)))
        }
        Err(TrySendError::Closed(_)) => Err(EnvError::network(format!("{} writer closed", peer))),
    }
}

/// Server-side transport: accepts agent connections on a TCP port.
pub struct TcpServerTransport {
    /// Address actually bound (useful when binding port 0)
    local_addr: SocketAddr,

    /// Outbound queues per connected peer
    peers: PeerTable,

    /// Inbound events from all connections (behind tokio mutex for async)
    events: tokio::sync::Mutex<mpsc::Receiver<(PeerId, TransportEvent)>>,
}

impl TcpServerTransport {
    /// Binds the listener and starts accepting connections in the background.
    pub async fn bind(addr: SocketAddr) -> Result<Self, EnvError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EnvError::network(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EnvError::network(e.to_string()))?;

        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        tokio::spawn(accept_loop(listener, Arc::clone(&peers), event_tx));
        info!(%local_addr, "TCP agent listener ready");

        Ok(Self {
            local_addr,
            peers,
            events: tokio::sync::Mutex::new(event_rx),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer table mutex poisoned").len()
    }
}

async fn accept_loop(listener: TcpListener, peers: PeerTable, events: EventSender) {
    let mut next_peer = 1u64;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let peer = PeerId(next_peer);
                next_peer += 1;
                if let Err(err) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, err);
                }
                info!(%peer, %addr, "agent connection accepted");

                let (reader, writer) = stream.into_split();
                let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
                let (close_tx, close_rx) = watch::channel(false);
                peers.lock().expect("peer table mutex poisoned").insert(
                    peer,
                    PeerLink {
                        frames: out_tx,
                        close: close_tx,
                    },
                );

                if events.send((peer, TransportEvent::Connected)).await.is_err() {
                    // Transport dropped, stop accepting
                    return;
                }
                tokio::spawn(write_loop(writer, out_rx, close_rx.clone()));
                tokio::spawn(read_loop(
                    peer,
                    reader,
                    events.clone(),
                    close_rx,
                    Some(Arc::clone(&peers)),
                ));
            }
            Err(err) => {
                warn!("Error accepting agent connection: {}", err);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn read_loop(
    peer: PeerId,
    reader: OwnedReadHalf,
    events: EventSender,
    mut closed: watch::Receiver<bool>,
    peers: Option<PeerTable>,
) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        // One byte past the cap tells an oversized frame from a full one
        let mut frame_reader = (&mut reader).take(MAX_FRAME_BYTES as u64 + 1);
        let read = tokio::select! {
            read = frame_reader.read_until(b'\n', &mut buffer) => read,
            _ = force_closed(&mut closed) => {
                debug!(%peer, "connection closed locally");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) if buffer.len() > MAX_FRAME_BYTES && buffer.last() != Some(&b'\n') => {
                warn!(%peer, max = MAX_FRAME_BYTES, "frame too long, closing");
                break;
            }
            Ok(_) => {
                let frame = trim_frame(&buffer);
                if frame.is_empty() {
                    continue;
                }
                let envelope = WireEnvelope::new(frame.to_vec(), now_ms());
                if events.send((peer, TransportEvent::Message(envelope))).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(%peer, "read error: {}", err);
                break;
            }
        }
    }

    if let Some(peers) = peers {
        if let Some(link) = peers.lock().expect("peer table mutex poisoned").remove(&peer) {
            let _ = link.close.send(true);
        }
    }
    let _ = events.send((peer, TransportEvent::Disconnected)).await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = force_closed(&mut closed) => break,
        };
        let mut buffer = Vec::with_capacity(frame.len() + 1);
        buffer.extend_from_slice(&frame);
        buffer.push(b'\n');
        let written = tokio::select! {
            written = writer.write_all(&buffer) => written,
            _ = force_closed(&mut closed) => break,
        };
        if let Err(err) = written {
            debug!("dropping writer: {}", err);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl NetworkTransport for TcpServerTransport {
    async fn send(&self, target: PeerId, envelope: WireEnvelope) -> Result<(), EnvError> {
        let mut peers = self.peers.lock().expect("peer table mutex poisoned");
        queue_frame(&mut peers, target, envelope.payload)
    }

    async fn recv(&self) -> Option<(PeerId, TransportEvent)> {
        let mut events = self.events.lock().await;
        events.recv().await
    }

    async fn broadcast(&self, envelope: WireEnvelope) -> usize {
        let mut peers = self.peers.lock().expect("peer table mutex poisoned");
        let targets: Vec<PeerId> = peers.keys().copied().collect();
        targets
            .into_iter()
            .filter(|peer| queue_frame(&mut peers, *peer, envelope.payload.clone()).is_ok())
            .count()
    }

    async fn disconnect(&self, peer: PeerId) {
        // Dropping the outbound queue lets the writer drain it, then shut the socket down.
        self.peers.lock().expect("peer table mutex poisoned").remove(&peer);
    }

    fn local_id(&self) -> PeerId {
        PeerId::SERVER
    }
}

/// Client-side transport: a single connection to the authoritative server.
pub struct TcpClientTransport {
    /// Outbound queue to the server (`None` once disconnected)
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,

    /// Inbound events from the server connection
    events: tokio::sync::Mutex<mpsc::Receiver<(PeerId, TransportEvent)>>,
}

impl TcpClientTransport {
    /// Connects to a server.
    pub async fn connect(addr: SocketAddr) -> Result<Self, EnvError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| EnvError::network(format!("connect {} failed: {}", addr, e)))?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", err);
        }

        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        // The client never force-closes; the sender is dropped right away
        let (_, never_closed) = watch::channel(false);

        event_tx
            .send((PeerId::SERVER, TransportEvent::Connected))
            .await
            .map_err(|_| EnvError::network("event queue closed"))?;
        tokio::spawn(write_loop(writer, out_rx, never_closed.clone()));
        tokio::spawn(read_loop(PeerId::SERVER, reader, event_tx, never_closed, None));

        Ok(Self {
            outbound: Mutex::new(Some(out_tx)),
            events: tokio::sync::Mutex::new(event_rx),
        })
    }
}

#[async_trait]
impl NetworkTransport for TcpClientTransport {
    async fn send(&self, target: PeerId, envelope: WireEnvelope) -> Result<(), EnvError> {
        if target != PeerId::SERVER {
            return Err(EnvError::unreachable(target));
        }
        let outbound = self.outbound.lock().expect("outbound mutex poisoned");
        let queue = outbound
            .as_ref()
            .ok_or_else(|| EnvError::unreachable(target))?;
        queue.try_send(envelope.payload).map_err(|err| match err {
            TrySendError::Full(_) => EnvError::network("server is not reading"),
            TrySendError::Closed(_) => EnvError::network("server connection closed"),
        })
    }

    async fn recv(&self) -> Option<(PeerId, TransportEvent)> {
        let mut events = self.events.lock().await;
        events.recv().await
    }

    async fn broadcast(&self, envelope: WireEnvelope) -> usize {
        match self.send(PeerId::SERVER, envelope).await {
            Ok(()) => 1,
            Err(_) => 0,
        }
    }

    async fn disconnect(&self, _peer: PeerId) {
        self.outbound.lock().expect("outbound mutex poisoned").take();
    }

    fn local_id(&self) -> PeerId {
        PeerId::UNASSIGNED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_round_trip_between_server_and_client() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = TcpClientTransport::connect(server.local_addr()).await.unwrap();

        let (peer, event) = server.recv().await.unwrap();
        assert_eq!(event, TransportEvent::Connected);

        client
            .send(PeerId::SERVER, WireEnvelope::new(b"{\"hello\":1}".to_vec(), 0))
            .await
            .unwrap();
        let (from, event) = server.recv().await.unwrap();
        assert_eq!(from, peer);
        match event {
            TransportEvent::Message(envelope) => assert_eq!(envelope.payload, b"{\"hello\":1}"),
            other => panic!("unexpected event {:?}", other),
        }

        // Client sees its own Connected first, then the server's frame
        let (_, first) = client.recv().await.unwrap();
        assert_eq!(first, TransportEvent::Connected);
        server.send(peer, WireEnvelope::new(b"pong".to_vec(), 0)).await.unwrap();
        let (_, reply) = client.recv().await.unwrap();
        assert!(matches!(reply, TransportEvent::Message(ref e) if e.payload == b"pong"));
    }

    #[tokio::test]
    async fn test_tcp_disconnect_is_reported() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = TcpClientTransport::connect(server.local_addr()).await.unwrap();
        let (peer, _) = server.recv().await.unwrap();

        drop(client);

        let (from, event) = server.recv().await.unwrap();
        assert_eq!(from, peer);
        assert_eq!(event, TransportEvent::Disconnected);
        assert!(server.send(peer, WireEnvelope::new(vec![1], 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_client_rejects_non_server_target() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = TcpClientTransport::connect(server.local_addr()).await.unwrap();
        assert!(client.send(PeerId(9), WireEnvelope::new(vec![], 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_the_connection() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (peer, _) = server.recv().await.unwrap();

        tokio::spawn(async move {
            // The server may hang up before the whole frame is written
            let _ = raw.write_all(&vec![b'x'; MAX_FRAME_BYTES + 16]).await;
            let _ = raw.write_all(b"\n").await;
        });

        let (from, event) = tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .expect("no disconnect")
            .unwrap();
        assert_eq!(from, peer);
        assert_eq!(event, TransportEvent::Disconnected);
        assert_eq!(server.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_frames_are_trimmed_and_blank_lines_skipped() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let _ = server.recv().await.unwrap();

        raw.write_all(b"\n  \r\n {\"a\":1}\r\n").await.unwrap();
        let (_, event) = server.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Message(ref e) if e.payload == b"{\"a\":1}"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_that_stops_reading_is_closed() {
        let server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // Connected but never reads
        let _raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let (peer, _) = server.recv().await.unwrap();

        let chunk = vec![b'y'; 64 * 1024];
        let mut refused = None;
        for sent in 0..20_000 {
            if let Err(err) = server.send(peer, WireEnvelope::new(chunk.clone(), 0)).await {
                refused = Some((sent, err));
                break;
            }
            tokio::task::yield_now().await;
        }
        let (sent, err) = refused.expect("queue never filled");
        assert!(sent >= OUTBOUND_QUEUE_CAPACITY);
        assert!(matches!(err, EnvError::Network(_)));

        let (from, event) = tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .expect("no disconnect")
            .unwrap();
        assert_eq!(from, peer);
        assert_eq!(event, TransportEvent::Disconnected);
        assert!(matches!(
            server.send(peer, WireEnvelope::new(vec![1], 0)).await,
            Err(EnvError::PeerUnreachable(_))
        ));
    }
}
