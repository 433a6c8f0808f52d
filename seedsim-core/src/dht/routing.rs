//! Node identifiers and the k-bucket routing table.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::random::RandomSource;
use crate::torrent::InfoHash;

/// Nodes per bucket.
pub const K: usize = 8;
const NUM_BUCKETS: usize = 160;
/// Consecutive query failures before a node is evicted.
const MAX_FAILURES: u32 = 3;
/// A node not heard from for this long is questionable.
pub const NODE_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
/// Compact node info: 20-byte id, IPv4 address, port.
pub const COMPACT_NODE_LEN: usize = 26;

/// 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Random identifier drawn from `rng`.
    pub fn random(rng: &mut dyn RandomSource) -> Self {
        let mut id = [0u8; 20];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance, compared lexicographically.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (d, (a, b)) in distance.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *d = a ^ b;
        }
        distance
    }

    /// Bucket holding `other`: the number of leading bits shared with us.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        self.distance(other)
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
            .unwrap_or(NUM_BUCKETS - 1)
    }
}

impl From<InfoHash> for NodeId {
    fn from(info_hash: InfoHash) -> Self {
        Self(*info_hash.as_bytes())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A node known to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNodeEntry {
    pub id: NodeId,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub failures: u32,
}

impl DhtNodeEntry {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) >= NODE_STALE_AFTER
    }

    /// Decodes a list of 26-byte compact node infos, ignoring a ragged tail.
    pub fn decode_compact(data: &[u8]) -> Vec<DhtNodeEntry> {
        data.chunks_exact(COMPACT_NODE_LEN)
            .filter_map(|chunk| {
                let id = NodeId::from_slice(&chunk[..20])?;
                let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
                let port = u16::from_be_bytes([chunk[24], chunk[25]]);
                Some(DhtNodeEntry::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
            })
            .collect()
    }

    /// Encodes IPv4 nodes in compact form; IPv6 nodes are skipped.
    pub fn encode_compact(nodes: &[DhtNodeEntry]) -> Vec<u8> {
        let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
        for node in nodes {
            if let SocketAddr::V4(v4) = node.address {
                out.extend_from_slice(node.id.as_bytes());
                out.extend_from_slice(&v4.ip().octets());
                out.extend_from_slice(&v4.port().to_be_bytes());
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct Bucket {
    nodes: VecDeque<DhtNodeEntry>,
    replacements: VecDeque<DhtNodeEntry>,
}

/// Outcome of offering a node to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Refreshed,
    /// Bucket full of live nodes; parked in the replacement cache
    Cached,
    /// Bucket full and its oldest node stale; it was replaced
    Evicted,
    Ignored,
}

/// 160 k-buckets keyed by shared prefix length with our id.
#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    /// Inserts or refreshes `node`, evicting a stale node from a full bucket.
    pub fn insert(&mut self, node: DhtNodeEntry, now: Instant) -> InsertOutcome {
        if node.id == self.own_id {
            return InsertOutcome::Ignored;
        }
        let bucket = &mut self.buckets[self.own_id.bucket_index(&node.id)];

        if let Some(pos) = bucket.nodes.iter().position(|n| n.id == node.id) {
            if let Some(mut existing) = bucket.nodes.remove(pos) {
                existing.address = node.address;
                existing.last_seen = now;
                existing.failures = 0;
                bucket.nodes.push_back(existing);
            }
            return InsertOutcome::Refreshed;
        }

        if bucket.nodes.len() < K {
            bucket.nodes.push_back(node);
            return InsertOutcome::Added;
        }

        if let Some(pos) = bucket.nodes.iter().position(|n| n.is_stale(now)) {
            bucket.nodes.remove(pos);
            bucket.nodes.push_back(node);
            return InsertOutcome::Evicted;
        }

        bucket.replacements.retain(|n| n.id != node.id);
        if bucket.replacements.len() >= K {
            bucket.replacements.pop_front();
        }
        bucket.replacements.push_back(node);
        InsertOutcome::Cached
    }

    /// Counts a failed query; evicts the node after repeated failures and
    /// promotes the newest replacement into its slot.
    pub fn record_failure(&mut self, id: &NodeId) {
        let bucket = &mut self.buckets[self.own_id.bucket_index(id)];
        let Some(pos) = bucket.nodes.iter().position(|n| n.id == *id) else {
            return;
        };
        bucket.nodes[pos].failures += 1;
        if bucket.nodes[pos].failures >= MAX_FAILURES {
            bucket.nodes.remove(pos);
            if let Some(replacement) = bucket.replacements.pop_back() {
                bucket.nodes.push_back(replacement);
            }
        }
    }

    /// Up to `count` nodes ordered by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtNodeEntry> {
        let mut nodes: Vec<&DhtNodeEntry> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes.iter())
            .collect();
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets[self.own_id.bucket_index(id)]
            .nodes
            .iter()
            .any(|n| n.id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    fn id_with_first(byte: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = byte;
        NodeId::new(id)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_bucket_index() {
        let own = NodeId::new([0; 20]);
        assert_eq!(own.bucket_index(&id_with_first(0x80)), 0);
        assert_eq!(own.bucket_index(&id_with_first(0x01)), 7);
        let mut last = [0u8; 20];
        last[19] = 1;
        assert_eq!(own.bucket_index(&NodeId::new(last)), 159);
        assert_eq!(own.bucket_index(&own), 159);
    }

    #[test]
    fn test_closest_orders_by_xor_distance() {
        let mut table = RoutingTable::new(NodeId::new([0; 20]));
        let now = Instant::now();
        for (i, first) in [0x10u8, 0x80, 0x01, 0x40].into_iter().enumerate() {
            table.insert(DhtNodeEntry::new(id_with_first(first), addr(i as u16 + 1)), now);
        }

        let target = id_with_first(0x11);
        let closest: Vec<u8> = table
            .closest(&target, 3)
            .iter()
            .map(|n| n.id.as_bytes()[0])
            .collect();
        assert_eq!(closest, vec![0x10, 0x01, 0x40]);
    }

    #[test]
    fn test_full_bucket_caches_then_evicts_stale() {
        let mut table = RoutingTable::new(NodeId::new([0; 20]));
        let start = Instant::now();
        let mut rng = SeededRandom::from_seed(5);

        // Every id with the top bit set lands in bucket 0.
        let mut bucket_zero = || {
            let mut id = NodeId::random(&mut rng).0;
            id[0] |= 0x80;
            NodeId::new(id)
        };
        for port in 0..K as u16 {
            let node = DhtNodeEntry {
                last_seen: start,
                ..DhtNodeEntry::new(bucket_zero(), addr(port))
            };
            assert_eq!(table.insert(node, start), InsertOutcome::Added);
        }
        assert_eq!(
            table.insert(DhtNodeEntry::new(bucket_zero(), addr(100)), start),
            InsertOutcome::Cached
        );

        let later = start + NODE_STALE_AFTER;
        let newcomer = bucket_zero();
        assert_eq!(
            table.insert(DhtNodeEntry::new(newcomer, addr(101)), later),
            InsertOutcome::Evicted
        );
        assert!(table.contains(&newcomer));
        assert_eq!(table.len(), K);
    }

    #[test]
    fn test_failures_promote_replacement() {
        let mut table = RoutingTable::new(NodeId::new([0; 20]));
        let now = Instant::now();
        for i in 0..K as u8 {
            table.insert(DhtNodeEntry::new(id_with_first(0x80 | i), addr(i.into())), now);
        }
        let spare = id_with_first(0xff);
        table.insert(DhtNodeEntry::new(spare, addr(99)), now);
        assert!(!table.contains(&spare));

        let victim = id_with_first(0x80);
        for _ in 0..MAX_FAILURES {
            table.record_failure(&victim);
        }
        assert!(!table.contains(&victim));
        assert!(table.contains(&spare));
    }

    #[test]
    fn test_compact_nodes() {
        let nodes = vec![
            DhtNodeEntry::new(id_with_first(1), "10.0.0.1:6881".parse().unwrap()),
            DhtNodeEntry::new(id_with_first(2), "[::1]:6881".parse().unwrap()),
        ];
        let encoded = DhtNodeEntry::encode_compact(&nodes);
        assert_eq!(encoded.len(), COMPACT_NODE_LEN);

        let decoded = DhtNodeEntry::decode_compact(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, id_with_first(1));
        assert_eq!(decoded[0].address, "10.0.0.1:6881".parse().unwrap());
    }
}
