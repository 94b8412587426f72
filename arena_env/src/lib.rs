//! Arena Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the arena session engine
//! run against a **Production** environment (tokio clock, TCP sockets) or a
//! **Simulation** environment (virtual clock, in-memory peers).
//!
//! # Core Concept: Everything the tick loop waits on is injected
//!
//! The session scheduler never touches the OS directly:
//! - Time (`now()`, `sleep()`) comes from a [`SessionContext`]
//! - Peers (`send()`, `recv()`, `broadcast()`) come from a [`NetworkTransport`]
//!
//! With a virtual clock and scripted peers every think-time deadline and every
//! arrival order becomes reproducible from a single seed.
//!
//! # Example
//!
//! ```ignore
//! use arena_env::{SessionContext, NetworkTransport, TransportEvent};
//!
//! async fn pump<Ctx: SessionContext, Net: NetworkTransport>(ctx: &Ctx, net: &Net) {
//!     loop {
//!         tokio::select! {
//!             biased;
//!             event = net.recv() => handle(event),
//!             _ = ctx.sleep(Duration::from_millis(16)) => break,
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod tcp;

pub use context::SessionContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{PeerId, SessionId, TransportEvent, WireEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use tcp::{TcpClientTransport, TcpServerTransport, MAX_FRAME_BYTES, OUTBOUND_QUEUE_CAPACITY};
