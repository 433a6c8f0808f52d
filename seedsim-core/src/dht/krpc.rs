//! KRPC message encoding (BEP 5).

use std::collections::HashMap;
use std::net::SocketAddr;

use super::DhtError;
use super::routing::{DhtNodeEntry, NodeId};
use crate::bencode::Bencode;
use crate::torrent::InfoHash;
use crate::tracker::http::parse_compact_peers;

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// KRPC error codes.
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_UNKNOWN_METHOD: i64 = 204;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl KrpcQuery {
    pub fn method(&self) -> &'static str {
        match self {
            KrpcQuery::Ping => "ping",
            KrpcQuery::FindNode { .. } => "find_node",
            KrpcQuery::GetPeers { .. } => "get_peers",
            KrpcQuery::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Reply payload. Which fields are present depends on the query answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcResponse {
    pub id: NodeId,
    pub nodes: Vec<DhtNodeEntry>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl KrpcResponse {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            values: Vec::new(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcBody {
    Query { sender: NodeId, query: KrpcQuery },
    Response(KrpcResponse),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    pub transaction_id: Vec<u8>,
    pub body: KrpcBody,
}

impl KrpcMessage {
    pub fn query(transaction_id: Vec<u8>, sender: NodeId, query: KrpcQuery) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Query { sender, query },
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: KrpcResponse) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Response(response),
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let t = Bencode::bytes(&self.transaction_id);
        let message = match &self.body {
            KrpcBody::Query { sender, query } => {
                let mut args = vec![("id", Bencode::bytes(sender.as_bytes()))];
                match query {
                    KrpcQuery::Ping => {}
                    KrpcQuery::FindNode { target } => {
                        args.push(("target", Bencode::bytes(target.as_bytes())));
                    }
                    KrpcQuery::GetPeers { info_hash } => {
                        args.push(("info_hash", Bencode::bytes(info_hash.as_bytes())));
                    }
                    KrpcQuery::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => {
                        args.push(("info_hash", Bencode::bytes(info_hash.as_bytes())));
                        args.push(("port", Bencode::Int(i64::from(*port))));
                        args.push(("token", Bencode::bytes(token)));
                        args.push(("implied_port", Bencode::Int(i64::from(*implied_port))));
                    }
                }
                Bencode::dict([
                    ("t", t),
                    ("y", Bencode::bytes("q")),
                    ("q", Bencode::bytes(query.method())),
                    ("a", Bencode::dict(args)),
                ])
            }
            KrpcBody::Response(response) => {
                let mut fields = vec![("id", Bencode::bytes(response.id.as_bytes()))];
                if !response.nodes.is_empty() {
                    fields.push((
                        "nodes",
                        Bencode::Bytes(DhtNodeEntry::encode_compact(&response.nodes)),
                    ));
                }
                if !response.values.is_empty() {
                    let values = response
                        .values
                        .iter()
                        .filter_map(|addr| match addr {
                            SocketAddr::V4(v4) => {
                                let mut compact = v4.ip().octets().to_vec();
                                compact.extend_from_slice(&v4.port().to_be_bytes());
                                Some(Bencode::Bytes(compact))
                            }
                            SocketAddr::V6(_) => None,
                        })
                        .collect();
                    fields.push(("values", Bencode::List(values)));
                }
                if let Some(token) = &response.token {
                    fields.push(("token", Bencode::bytes(token)));
                }
                Bencode::dict([
                    ("t", t),
                    ("y", Bencode::bytes("r")),
                    ("r", Bencode::dict(fields)),
                ])
            }
            KrpcBody::Error { code, message } => Bencode::dict([
                ("t", t),
                ("y", Bencode::bytes("e")),
                (
                    "e",
                    Bencode::List(vec![Bencode::Int(*code), Bencode::bytes(message)]),
                ),
            ]),
        };
        message.encode()
    }

    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// - `DhtError::Malformed` - Not bencode, missing keys, bad lengths, unknown method
    pub fn decode(data: &[u8]) -> Result<Self, DhtError> {
        let parsed = bencode_rs::Value::parse(data)
            .map_err(|e| malformed(format!("invalid bencode: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(malformed("message is not a dictionary"));
        };

        let transaction_id = get_bytes(dict, b"t")
            .ok_or_else(|| malformed("missing transaction id"))?
            .to_vec();
        let kind = get_bytes(dict, b"y").ok_or_else(|| malformed("missing message type"))?;

        let body = match kind {
            b"q" => decode_query(dict)?,
            b"r" => {
                let Some(bencode_rs::Value::Dictionary(reply)) = dict.get(b"r".as_slice()) else {
                    return Err(malformed("response without body"));
                };
                KrpcBody::Response(decode_response(reply)?)
            }
            b"e" => {
                let Some(bencode_rs::Value::List(error)) = dict.get(b"e".as_slice()) else {
                    return Err(malformed("error without body"));
                };
                let code = match error.first() {
                    Some(bencode_rs::Value::Integer(code)) => *code as i64,
                    _ => ERROR_GENERIC,
                };
                let message = match error.get(1) {
                    Some(bencode_rs::Value::Bytes(message)) => {
                        String::from_utf8_lossy(message).to_string()
                    }
                    _ => String::new(),
                };
                KrpcBody::Error { code, message }
            }
            other => {
                return Err(malformed(format!(
                    "unknown message type {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn malformed(reason: impl Into<String>) -> DhtError {
    DhtError::Malformed {
        reason: reason.into(),
    }
}

fn get_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

fn get_int(dict: &BencodeDict<'_>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Some(*value as i64),
        _ => None,
    }
}

fn get_id(dict: &BencodeDict<'_>, key: &[u8]) -> Result<NodeId, DhtError> {
    get_bytes(dict, key)
        .and_then(NodeId::from_slice)
        .ok_or_else(|| malformed(format!("missing or bad {}", String::from_utf8_lossy(key))))
}

fn decode_query(dict: &BencodeDict<'_>) -> Result<KrpcBody, DhtError> {
    let method = get_bytes(dict, b"q").ok_or_else(|| malformed("query without method"))?;
    let Some(bencode_rs::Value::Dictionary(args)) = dict.get(b"a".as_slice()) else {
        return Err(malformed("query without arguments"));
    };
    let sender = get_id(args, b"id")?;
    let info_hash = || get_id(args, b"info_hash").map(|id| InfoHash::new(*id.as_bytes()));

    let query = match method {
        b"ping" => KrpcQuery::Ping,
        b"find_node" => KrpcQuery::FindNode {
            target: get_id(args, b"target")?,
        },
        b"get_peers" => KrpcQuery::GetPeers {
            info_hash: info_hash()?,
        },
        b"announce_peer" => KrpcQuery::AnnouncePeer {
            info_hash: info_hash()?,
            port: get_int(args, b"port")
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| malformed("announce_peer without valid port"))?,
            token: get_bytes(args, b"token")
                .ok_or_else(|| malformed("announce_peer without token"))?
                .to_vec(),
            implied_port: get_int(args, b"implied_port").unwrap_or(0) != 0,
        },
        other => {
            return Err(DhtError::UnknownMethod {
                method: String::from_utf8_lossy(other).to_string(),
            });
        }
    };
    Ok(KrpcBody::Query { sender, query })
}

fn decode_response(reply: &BencodeDict<'_>) -> Result<KrpcResponse, DhtError> {
    let mut response = KrpcResponse::new(get_id(reply, b"id")?);
    if let Some(nodes) = get_bytes(reply, b"nodes") {
        response.nodes = DhtNodeEntry::decode_compact(nodes);
    }
    if let Some(bencode_rs::Value::List(values)) = reply.get(b"values".as_slice()) {
        for value in values {
            if let bencode_rs::Value::Bytes(compact) = value {
                if let Ok(peers) = parse_compact_peers(compact, 6) {
                    response.values.extend(peers);
                }
            }
        }
    }
    response.token = get_bytes(reply, b"token").map(<[u8]>::to_vec);
    Ok(response)
}
