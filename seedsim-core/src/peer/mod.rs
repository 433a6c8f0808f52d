//! BitTorrent peer wire protocol and connection management.
//!
//! Implements BEP 3 framing and the connection lifecycle for a client that
//! only ever seeds synthetic data. [`PeerConnectionManager`] owns the pool,
//! [`PeerProtocolEngine`] drives each socket, and [`PeerListener`] routes
//! inbound peers.

pub mod bitfield;
pub mod engine;
pub mod handshake;
pub mod listener;
pub mod manager;
pub mod messages;
pub mod types;

pub use engine::{
    CloseReason, ConnectionCommand, ConnectionOutcome, ConnectionShared, EngineContext,
    PeerProtocolEngine,
};
pub use handshake::HandshakeCodec;
pub use listener::PeerListener;
pub use manager::{
    AdmitError, CapacityError, ClosingTorrent, ConnectionBehavior, ConnectionSnapshot,
    PeerConnectionManager, TickReport,
};
pub use messages::{FrameLimits, MessageCodec};
pub use types::{
    ConnectionState, Direction, PeerHandshake, PeerId, PeerMessage, PeerProtocolError, ReadPhase,
};
