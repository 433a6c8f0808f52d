//! Core types and enumerations for the BitTorrent wire protocol

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::random::RandomSource;
use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID with an Azureus-style client prefix.
    ///
    /// The prefix is truncated to 20 bytes; the remainder is filled with
    /// alphanumeric characters drawn from `rng`.
    pub fn generate(prefix: &str, rng: &mut dyn RandomSource) -> Self {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

        let mut id = [0u8; 20];
        let prefix = prefix.as_bytes();
        let prefix_len = prefix.len().min(20);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        for byte in &mut id[prefix_len..] {
            *byte = ALPHABET[rng.below(ALPHABET.len() as u32) as usize];
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// BitTorrent wire protocol messages.
///
/// Complete set of message types defined in BEP 3 for peer communication.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announce that a piece has been acquired
    Have { piece_index: PieceIndex },
    /// Complete piece availability bitmap, most significant bit first
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT port of the sender
    Port { port: u16 },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates handshake with no extension bits set.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Connection lifecycle.
///
/// ```text
/// Connecting -> Handshaking -> BitfieldExchange -> Established <-> Idle
///      any live state -> Closing -> Closed
///      any live state -> Errored -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    BitfieldExchange,
    Established,
    Idle,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    /// Returns true if the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Connecting, Handshaking)
            | (Handshaking, BitfieldExchange)
            | (BitfieldExchange, Established)
            | (Established, Idle)
            | (Idle, Established)
            | (Closing, Closed)
            | (Errored, Closed) => true,
            (from, Closing) | (from, Errored) => from.is_live(),
            _ => false,
        }
    }

    /// States in which the connection may still exchange bytes.
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Errored
        )
    }

    /// States that count as a fully set-up connection.
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::Idle)
    }
}

/// Which part of a frame a timed-out read was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Header,
    Payload,
}

impl fmt::Display for ReadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadPhase::Header => write!(f, "message header"),
            ReadPhase::Payload => write!(f, "message payload"),
        }
    }
}

/// Errors raised by a single peer connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerProtocolError {
    #[error("Handshake info hash mismatch: expected {expected}, received {received}")]
    HandshakeMismatch {
        expected: InfoHash,
        received: InfoHash,
    },

    #[error("Handshake not received within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Timed out after {timeout:?} waiting for {phase}")]
    ReadTimeout { phase: ReadPhase, timeout: Duration },

    #[error("Connection reset: {reason}")]
    ConnectionReset { reason: String },

    #[error("Invalid connection state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn test_peer_id_prefix_and_charset() {
        let mut rng = SeededRandom::from_seed(1);
        let id = PeerId::generate("-SS0100-", &mut rng);

        assert_eq!(&id.as_bytes()[..8], b"-SS0100-");
        assert!(id.as_bytes()[8..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn test_peer_id_reproducible_with_seed() {
        let a = PeerId::generate("-SS0100-", &mut SeededRandom::from_seed(5));
        let b = PeerId::generate("-SS0100-", &mut SeededRandom::from_seed(5));
        let c = PeerId::generate("-SS0100-", &mut SeededRandom::from_seed(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_happy_path_transitions() {
        use ConnectionState::*;
        let path = [Connecting, Handshaking, BitfieldExchange, Established, Idle, Established];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(Established.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Handshaking.can_transition_to(Errored));
        assert!(Errored.can_transition_to(Closed));
    }

    #[test]
    fn test_illegal_transitions() {
        use ConnectionState::*;
        assert!(!Connecting.can_transition_to(Established));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Closing));
        assert!(!Idle.can_transition_to(BitfieldExchange));
        assert!(!Handshaking.can_transition_to(Idle));
    }
}
