//! BitTorrent handshake serialization and deserialization

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{PeerHandshake, PeerId, PeerProtocolError};
use crate::torrent::InfoHash;

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake size: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::MalformedMessage` - Wrong length or protocol string
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, PeerProtocolError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerProtocolError::MalformedMessage {
                reason: format!("handshake must be {HANDSHAKE_LEN} bytes, got {}", data.len()),
            });
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(PeerProtocolError::MalformedMessage {
                reason: "unsupported protocol string in handshake".to_string(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Reads one handshake from `reader`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::HandshakeTimeout` - Nothing complete arrived in time
    /// - `PeerProtocolError::ConnectionReset` - Stream closed mid-handshake
    /// - `PeerProtocolError::MalformedMessage` - Bytes were not a handshake
    pub async fn read_handshake<R>(
        reader: &mut R,
        timeout: Duration,
    ) -> Result<PeerHandshake, PeerProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        match tokio::time::timeout(timeout, reader.read_exact(&mut buf)).await {
            Err(_) => Err(PeerProtocolError::HandshakeTimeout { timeout }),
            Ok(Err(e)) => Err(PeerProtocolError::ConnectionReset {
                reason: format!("reading handshake: {e}"),
            }),
            Ok(Ok(_)) => Self::deserialize_handshake(&buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([0xab; 20]), PeerId::new([0xcd; 20]));
        let bytes = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0xab; 20]);
        assert_eq!(&bytes[48..68], &[0xcd; 20]);

        let parsed = HandshakeCodec::deserialize_handshake(&bytes).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_rejects_foreign_protocol() {
        let handshake = PeerHandshake::new(InfoHash::new([1; 20]), PeerId::new([2; 20]));
        let mut bytes = HandshakeCodec::serialize_handshake(&handshake);
        bytes[1] = b'X';

        assert!(matches!(
            HandshakeCodec::deserialize_handshake(&bytes),
            Err(PeerProtocolError::MalformedMessage { .. })
        ));
        assert!(HandshakeCodec::deserialize_handshake(&bytes[..40]).is_err());
    }

    #[tokio::test]
    async fn test_read_handshake_times_out() {
        let (mut client, _server) = tokio::io::duplex(256);
        let result = HandshakeCodec::read_handshake(&mut client, Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(PeerProtocolError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_handshake_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let handshake = PeerHandshake::new(InfoHash::new([7; 20]), PeerId::new([8; 20]));
        server
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let received = HandshakeCodec::read_handshake(&mut client, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.info_hash, handshake.info_hash);
    }

    #[tokio::test]
    async fn test_read_handshake_across_split_reads() {
        let handshake = PeerHandshake::new(InfoHash::new([3; 20]), PeerId::new([4; 20]));
        let bytes = HandshakeCodec::serialize_handshake(&handshake);
        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes[..10])
            .read(&bytes[10..50])
            .read(&bytes[50..])
            .build();

        let received = HandshakeCodec::read_handshake(&mut stream, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received, handshake);
    }

    #[tokio::test]
    async fn test_truncated_handshake_is_connection_reset() {
        let handshake = PeerHandshake::new(InfoHash::new([3; 20]), PeerId::new([4; 20]));
        let bytes = HandshakeCodec::serialize_handshake(&handshake);
        let mut stream = tokio_test::io::Builder::new().read(&bytes[..30]).build();

        let result = HandshakeCodec::read_handshake(&mut stream, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(PeerProtocolError::ConnectionReset { .. })
        ));
    }
}
