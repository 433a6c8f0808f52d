//! Minimal mainline DHT (BEP 5).
//!
//! Enough of the protocol to be a well-behaved participant: a k-bucket
//! routing table, the four KRPC queries in both directions, and a single
//! round of `get_peers`/`announce_peer` per torrent lookup.

pub mod krpc;
pub mod node;
pub mod routing;

use std::net::SocketAddr;

pub use krpc::{KrpcBody, KrpcMessage, KrpcQuery, KrpcResponse};
pub use node::DhtNode;
pub use routing::{DhtNodeEntry, InsertOutcome, NodeId, RoutingTable};

/// Errors from DHT queries and datagram decoding.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("DHT socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed KRPC message: {reason}")]
    Malformed { reason: String },

    #[error("Unknown KRPC method '{method}'")]
    UnknownMethod { method: String },

    #[error("DHT query to {addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("DHT node replied with error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Too many DHT queries in flight")]
    Overloaded,

    #[error("DHT node shut down")]
    Shutdown,
}
