//! BitTorrent wire protocol message serialization and deserialization

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{PeerMessage, PeerProtocolError, ReadPhase};
use crate::torrent::PieceIndex;

/// Bounds applied while reading frames from a peer.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_message_length: u32,
    /// Bounds the length header and message id reads
    pub message_read_timeout: Duration,
    /// Bounds the payload read once the header arrived
    pub data_read_timeout: Duration,
}

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3, length prefix included.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // 1 + 4 + 4 + 4
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3); // 1 + 2
                buf.put_u8(9);
                buf.put_u16(*port);
            }
        }

        buf
    }

    /// Decodes a message body given its id and the payload following it.
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::MalformedMessage` - Unknown id or wrong payload size
    pub fn decode_body(message_id: u8, payload: &[u8]) -> Result<PeerMessage, PeerProtocolError> {
        let expect_len = |name: &str, expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(PeerProtocolError::MalformedMessage {
                    reason: format!(
                        "{name} payload must be {expected} bytes, got {}",
                        payload.len()
                    ),
                })
            }
        };

        let mut buf = payload;
        match message_id {
            0 => expect_len("choke", 0).map(|_| PeerMessage::Choke),
            1 => expect_len("unchoke", 0).map(|_| PeerMessage::Unchoke),
            2 => expect_len("interested", 0).map(|_| PeerMessage::Interested),
            3 => expect_len("not-interested", 0).map(|_| PeerMessage::NotInterested),
            4 => {
                expect_len("have", 4)?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(payload),
            }),
            6 | 8 => {
                expect_len(if message_id == 6 { "request" } else { "cancel" }, 12)?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                if message_id == 6 {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    })
                } else {
                    Ok(PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    })
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerProtocolError::MalformedMessage {
                        reason: format!("piece payload too short: {} bytes", payload.len()),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            9 => {
                expect_len("port", 2)?;
                Ok(PeerMessage::Port {
                    port: buf.get_u16(),
                })
            }
            _ => Err(PeerProtocolError::MalformedMessage {
                reason: format!("disallowed message id {message_id}"),
            }),
        }
    }

    /// Deserializes one complete length-prefixed message.
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::MalformedMessage` - Truncated frame or invalid body
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, PeerProtocolError> {
        if data.len() < 4 {
            return Err(PeerProtocolError::MalformedMessage {
                reason: "message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if buf.len() != length {
            return Err(PeerProtocolError::MalformedMessage {
                reason: format!("length prefix {length} but {} bytes follow", buf.len()),
            });
        }

        let message_id = buf.get_u8();
        Self::decode_body(message_id, buf)
    }

    /// Reads the next frame from `reader` under the given limits.
    ///
    /// A length header above `max_message_length` is rejected before any
    /// payload is read.
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::ReadTimeout` - Header or payload did not arrive in time
    /// - `PeerProtocolError::ConnectionReset` - Stream closed or failed
    /// - `PeerProtocolError::MalformedMessage` - Oversized or invalid message
    pub async fn read_frame<R>(
        reader: &mut R,
        limits: &FrameLimits,
    ) -> Result<PeerMessage, PeerProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        read_bounded(reader, &mut header, ReadPhase::Header, limits.message_read_timeout).await?;

        let length = u32::from_be_bytes(header);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > limits.max_message_length {
            return Err(PeerProtocolError::MalformedMessage {
                reason: format!(
                    "message length {length} exceeds limit {}",
                    limits.max_message_length
                ),
            });
        }

        let mut id = [0u8; 1];
        read_bounded(reader, &mut id, ReadPhase::Header, limits.message_read_timeout).await?;

        let mut payload = vec![0u8; length as usize - 1];
        if !payload.is_empty() {
            read_bounded(reader, &mut payload, ReadPhase::Payload, limits.data_read_timeout)
                .await?;
        }

        Self::decode_body(id[0], &payload)
    }
}

async fn read_bounded<R>(
    reader: &mut R,
    buf: &mut [u8],
    phase: ReadPhase,
    timeout: Duration,
) -> Result<(), PeerProtocolError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, reader.read_exact(buf)).await {
        Err(_) => Err(PeerProtocolError::ReadTimeout { phase, timeout }),
        Ok(Err(e)) => Err(PeerProtocolError::ConnectionReset {
            reason: format!("reading {phase}: {e}"),
        }),
        Ok(Ok(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn limits() -> FrameLimits {
        FrameLimits {
            max_message_length: 1 << 20,
            message_read_timeout: Duration::from_millis(100),
            data_read_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_request_wire_layout() {
        let bytes = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(3),
            offset: 16384,
            length: 16384,
        });
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 3, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_message_parses_back() {
        let original = PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 8,
            data: Bytes::from_static(b"block"),
        };
        let bytes = MessageCodec::serialize_message(&original);
        assert_eq!(MessageCodec::deserialize_message(&bytes).unwrap(), original);
    }

    #[test]
    fn test_keep_alive_is_four_zero_bytes() {
        assert_eq!(
            MessageCodec::serialize_message(&PeerMessage::KeepAlive),
            vec![0, 0, 0, 0]
        );
        assert_eq!(
            MessageCodec::deserialize_message(&[0, 0, 0, 0]).unwrap(),
            PeerMessage::KeepAlive
        );
    }

    #[test]
    fn test_rejects_bad_bodies() {
        assert!(MessageCodec::decode_body(4, &[0, 0, 1]).is_err());
        assert!(MessageCodec::decode_body(6, &[0; 11]).is_err());
        assert!(MessageCodec::decode_body(0, &[1]).is_err());
        assert!(matches!(
            MessageCodec::decode_body(20, &[0, 1]),
            Err(PeerProtocolError::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected_before_payload() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(&(2u32 << 20).to_be_bytes()).await.unwrap();

        let result = MessageCodec::read_frame(&mut reader, &limits()).await;
        assert!(matches!(
            result,
            Err(PeerProtocolError::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_payload_timeout_reports_phase() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        // Header promises 13 bytes, only the id arrives
        writer.write_all(&[0, 0, 0, 13, 6]).await.unwrap();

        let result = MessageCodec::read_frame(&mut reader, &limits()).await;
        assert!(matches!(
            result,
            Err(PeerProtocolError::ReadTimeout {
                phase: ReadPhase::Payload,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_reset() {
        let (mut reader, writer) = tokio::io::duplex(64);
        drop(writer);

        let result = MessageCodec::read_frame(&mut reader, &limits()).await;
        assert!(matches!(
            result,
            Err(PeerProtocolError::ConnectionReset { .. })
        ));
    }
}
