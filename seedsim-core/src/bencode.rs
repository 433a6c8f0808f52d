//! Bencode encoding.
//!
//! Decoding goes through `bencode_rs`, which borrows from the input. This
//! owned value type covers the messages we build ourselves (KRPC queries
//! and replies).

use std::collections::BTreeMap;

/// Owned bencode value. Dictionary keys are kept sorted as the format requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// Builds a dictionary from `(key, value)` pairs.
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: AsRef<[u8]>,
        I: IntoIterator<Item = (K, Bencode)>,
    {
        Bencode::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_vec(), v))
                .collect(),
        )
    }

    /// Byte string value.
    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        Bencode::Bytes(value.as_ref().to_vec())
    }

    /// Serializes the value.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(Bencode::Int(-42).encode(), b"i-42e");
        assert_eq!(Bencode::bytes("spam").encode(), b"4:spam");
        assert_eq!(Bencode::bytes("").encode(), b"0:");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let value = Bencode::dict([
            ("y", Bencode::bytes("q")),
            ("a", Bencode::List(vec![Bencode::Int(1), Bencode::bytes("x")])),
        ]);
        assert_eq!(value.encode(), b"d1:ali1e1:xe1:y1:qe");
    }

    #[test]
    fn test_decodes_with_bencode_rs() {
        let encoded = Bencode::dict([("interval", Bencode::Int(900))]).encode();
        let parsed = bencode_rs::Value::parse(&encoded).unwrap();
        let bencode_rs::Value::Dictionary(dict) = &parsed[0] else {
            panic!("expected dictionary");
        };
        assert!(matches!(
            dict.get(b"interval".as_slice()),
            Some(bencode_rs::Value::Integer(900))
        ));
    }
}
