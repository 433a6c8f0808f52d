//! Property tests for scheduling and routing invariants.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use proptest::prelude::*;
use seedsim_core::config::TrackerConfig;
use seedsim_core::dht::{DhtNodeEntry, NodeId, RoutingTable};
use seedsim_core::shaper::TokenBucket;
use seedsim_core::tracker::{AnnounceResponse, TrackerEndpoint, TrackerError};

const URL: &str = "udp://tracker.example:6969/announce";

fn tracker_config(min_secs: u64, base_secs: u64) -> TrackerConfig {
    TrackerConfig {
        min_announce_interval: Duration::from_secs(min_secs),
        retry_base_delay: Duration::from_secs(base_secs),
        retry_max_delay: Duration::from_secs(3600),
        failure_threshold: 3,
        ..TrackerConfig::default()
    }
}

fn node(id: [u8; 20], port: u16) -> DhtNodeEntry {
    DhtNodeEntry::new(
        NodeId::new(id),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)), port),
    )
}

proptest! {
    /// Whatever the mix of successes and failures, no two requests to one
    /// endpoint are ever closer together than the minimum interval.
    #[test]
    fn announces_never_closer_than_min_interval(
        min_secs in 1u64..600,
        base_secs in 1u64..120,
        outcomes in proptest::collection::vec(any::<bool>(), 1..20),
        tracker_min in proptest::option::of(0u32..900),
    ) {
        let config = tracker_config(min_secs, base_secs);
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();
        let mut now = start;
        let mut last_request: Option<Instant> = None;

        for success in outcomes {
            let ticket = endpoint.begin_announce(now);
            let ticket = match ticket {
                Some(ticket) => ticket,
                None => {
                    now = endpoint.next_announce_at().max(now + Duration::from_secs(1));
                    continue;
                }
            };
            if let Some(previous) = last_request {
                prop_assert!(now.duration_since(previous) >= config.min_announce_interval);
            }
            last_request = Some(now);

            let result = if success {
                Ok(AnnounceResponse {
                    interval: 1,
                    min_interval: tracker_min,
                    ..AnnounceResponse::default()
                })
            } else {
                Err(TrackerError::Timeout { url: URL.to_string() })
            };
            endpoint.complete_announce(ticket.seq, result, None, &config, now);
            prop_assert!(endpoint.next_announce_at().duration_since(now) >= endpoint.min_interval());
            prop_assert!(endpoint.min_interval() >= config.min_announce_interval);

            // Try again as early as the schedule allows
            now = endpoint.next_announce_at();
        }
    }

    /// Closest-node queries come back sorted by XOR distance and never
    /// longer than asked for.
    #[test]
    fn closest_nodes_sorted_by_distance(
        own in any::<[u8; 20]>(),
        target in any::<[u8; 20]>(),
        ids in proptest::collection::vec(any::<[u8; 20]>(), 0..64),
        count in 1usize..16,
    ) {
        let mut table = RoutingTable::new(NodeId::new(own));
        let now = Instant::now();
        for (port, id) in ids.iter().enumerate() {
            table.insert(node(*id, 1000 + port as u16), now);
        }

        let target = NodeId::new(target);
        let closest = table.closest(&target, count);
        prop_assert!(closest.len() <= count);
        prop_assert!(closest.len() <= table.len());
        for pair in closest.windows(2) {
            prop_assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
        for entry in &closest {
            prop_assert!(table.contains(&entry.id));
        }
    }

    /// Over any run of whole ticks a capped bucket hands out no more than
    /// its rate allows, with one allotment of head start.
    #[test]
    fn token_bucket_respects_rate(
        rate in 1u64..1_000_000,
        tick_ms in 10u64..1000,
        requests in proptest::collection::vec(0u64..200_000, 1..50),
    ) {
        let tick = Duration::from_millis(tick_ms);
        let mut bucket = TokenBucket::new(rate, tick);
        let mut consumed = 0u64;
        for requested in &requests {
            consumed += bucket.consume(*requested);
            bucket.refill(tick, tick);
        }

        let allotment = (rate as f64 * tick.as_secs_f64()).max(1.0);
        let ceiling = allotment * requests.len() as f64;
        prop_assert!(consumed as f64 <= ceiling.ceil());
    }
}
