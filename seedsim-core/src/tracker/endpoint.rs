//! Per-tracker announce schedule and failure accounting.
//!
//! Every announce to an endpoint goes through [`TrackerEndpoint::begin_announce`]
//! and its result through [`TrackerEndpoint::complete_announce`]. The endpoint
//! refuses to start a request before `min_interval` has passed since the
//! previous one, whatever the reason for the request.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::types::{AnnounceEvent, AnnounceResponse, ScrapeStats, TrackerError, TrackerProtocol};
use crate::config::TrackerConfig;

/// Health of a tracker endpoint as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    /// Never contacted
    Idle,
    /// Request in flight
    Updating,
    /// Last request succeeded
    Working,
    /// Recent failures, retrying with backoff
    Failing,
    /// Failed at least `failure_threshold` times in a row
    Deprioritized,
}

/// Swarm figures from the last successful exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub seeders: u32,
    pub leechers: u32,
    pub peer_count: u32,
    /// From the last scrape, when one succeeded
    pub completed: Option<u32>,
}

/// Announce ticket handed out by [`TrackerEndpoint::begin_announce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceTicket {
    pub seq: u64,
    pub event: AnnounceEvent,
}

/// One tracker URL of one torrent.
#[derive(Debug, Clone)]
pub struct TrackerEndpoint {
    url: String,
    protocol: TrackerProtocol,
    interval: Duration,
    min_interval: Duration,
    next_announce_at: Instant,
    last_request_at: Option<Instant>,
    next_scrape_at: Instant,
    stats: EndpointStats,
    consecutive_failures: u32,
    status: EndpointStatus,
    in_flight: Option<AnnounceTicket>,
    scrape_in_flight: bool,
    next_seq: u64,
    last_error: Option<String>,
    started_sent: bool,
    tracker_id: Option<String>,
}

impl TrackerEndpoint {
    /// Creates an endpoint due immediately.
    ///
    /// # Errors
    ///
    /// - `TrackerError::InvalidUrl` - URL unparseable or neither HTTP nor UDP
    pub fn new(url: &str, config: &TrackerConfig, now: Instant) -> Result<Self, TrackerError> {
        let protocol = TrackerProtocol::from_url(url)?;
        Ok(Self {
            url: url.to_string(),
            protocol,
            interval: config.default_announce_interval,
            min_interval: config.min_announce_interval,
            next_announce_at: now,
            last_request_at: None,
            next_scrape_at: now + config.scrape_interval,
            stats: EndpointStats::default(),
            consecutive_failures: 0,
            status: EndpointStatus::Idle,
            in_flight: None,
            scrape_in_flight: false,
            next_seq: 0,
            last_error: None,
            started_sent: false,
            tracker_id: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> TrackerProtocol {
        self.protocol
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn next_announce_at(&self) -> Instant {
        self.next_announce_at
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn started_sent(&self) -> bool {
        self.started_sent
    }

    pub fn tracker_id(&self) -> Option<&str> {
        self.tracker_id.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Earliest instant another request may be sent.
    pub fn earliest_request_at(&self) -> Option<Instant> {
        self.last_request_at.map(|last| last + self.min_interval)
    }

    fn min_interval_elapsed(&self, now: Instant) -> bool {
        self.earliest_request_at()
            .is_none_or(|earliest| now >= earliest)
    }

    /// Whether a regular announce should go out at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.in_flight.is_none() && now >= self.next_announce_at && self.min_interval_elapsed(now)
    }

    /// Starts a regular announce if due; `started` is sent until a tracker
    /// acknowledges one.
    pub fn begin_announce(&mut self, now: Instant) -> Option<AnnounceTicket> {
        if !self.is_due(now) {
            return None;
        }
        let event = if self.started_sent {
            AnnounceEvent::None
        } else {
            AnnounceEvent::Started
        };
        Some(self.issue(event, now))
    }

    /// Whether a `stopped` announce may go out now.
    ///
    /// Only endpoints that saw `started` need one, and `min_interval` still
    /// applies.
    pub fn can_send_stopped(&self, now: Instant) -> bool {
        self.started_sent && self.in_flight.is_none() && self.min_interval_elapsed(now)
    }

    /// Starts a `stopped` announce, or returns `None` when not allowed yet.
    pub fn begin_stopped(&mut self, now: Instant) -> Option<AnnounceTicket> {
        if !self.can_send_stopped(now) {
            return None;
        }
        Some(self.issue(AnnounceEvent::Stopped, now))
    }

    fn issue(&mut self, event: AnnounceEvent, now: Instant) -> AnnounceTicket {
        self.next_seq += 1;
        let ticket = AnnounceTicket {
            seq: self.next_seq,
            event,
        };
        self.in_flight = Some(ticket);
        self.last_request_at = Some(now);
        self.status = EndpointStatus::Updating;
        ticket
    }

    /// Applies an announce result.
    ///
    /// `announce_interval` is the session's preferred re-announce interval;
    /// the next announce is scheduled no sooner than the tracker's
    /// `min_interval`. Returns the peers of a successful, current response;
    /// results for a stale sequence number are ignored and return `None`.
    pub fn complete_announce(
        &mut self,
        seq: u64,
        result: Result<AnnounceResponse, TrackerError>,
        announce_interval: Option<Duration>,
        config: &TrackerConfig,
        now: Instant,
    ) -> Option<Vec<SocketAddr>> {
        let ticket = match self.in_flight {
            Some(ticket) if ticket.seq == seq => ticket,
            _ => {
                tracing::debug!("Ignoring stale announce result #{seq} from {}", self.url);
                return None;
            }
        };
        self.in_flight = None;

        match result {
            Ok(response) => {
                self.consecutive_failures = 0;
                self.last_error = None;
                self.status = EndpointStatus::Working;

                if response.interval > 0 {
                    self.interval = Duration::from_secs(u64::from(response.interval));
                }
                self.min_interval = response
                    .min_interval
                    .map(|secs| Duration::from_secs(u64::from(secs)))
                    .unwrap_or_default()
                    .max(config.min_announce_interval);
                if response.tracker_id.is_some() {
                    self.tracker_id = response.tracker_id.clone();
                }
                self.stats.seeders = response.complete;
                self.stats.leechers = response.incomplete;
                self.stats.peer_count = u32::try_from(response.peers.len()).unwrap_or(u32::MAX);

                match ticket.event {
                    AnnounceEvent::Started => self.started_sent = true,
                    AnnounceEvent::Stopped => self.started_sent = false,
                    _ => {}
                }

                let delay = announce_interval.unwrap_or(self.interval).max(self.min_interval);
                self.next_announce_at = now + delay;
                tracing::debug!(
                    "Tracker {} ok: {} seeders, {} leechers, {} peers, next in {delay:?}",
                    self.url,
                    response.complete,
                    response.incomplete,
                    response.peers.len()
                );
                Some(response.peers)
            }
            Err(error) => {
                self.consecutive_failures += 1;
                let mut delay = backoff_delay(self.consecutive_failures, config);
                if self.consecutive_failures >= config.failure_threshold {
                    self.status = EndpointStatus::Deprioritized;
                    delay = delay.saturating_mul(config.deprioritized_backoff_factor.max(1));
                } else {
                    self.status = EndpointStatus::Failing;
                }
                let delay = delay.max(self.min_interval);
                self.next_announce_at = now + delay;

                tracing::warn!(
                    "Tracker {} failed ({} in a row), retrying in {delay:?}: {error}",
                    self.url,
                    self.consecutive_failures
                );
                self.last_error = Some(error.to_string());
                None
            }
        }
    }

    /// Forgets any in-flight request so its result will be discarded.
    pub fn abandon_in_flight(&mut self) {
        if self.in_flight.take().is_some() && self.status == EndpointStatus::Updating {
            self.status = if self.consecutive_failures > 0 {
                EndpointStatus::Failing
            } else {
                EndpointStatus::Idle
            };
        }
    }

    /// Resets the announce cycle so `started` is sent again, as after resume.
    pub fn restart(&mut self, now: Instant) {
        self.abandon_in_flight();
        self.started_sent = false;
        self.next_announce_at = now;
    }

    /// Whether a best-effort scrape should be sent.
    pub fn scrape_due(&self, now: Instant) -> bool {
        !self.scrape_in_flight && now >= self.next_scrape_at
    }

    pub fn begin_scrape(&mut self, config: &TrackerConfig, now: Instant) -> bool {
        if !self.scrape_due(now) {
            return false;
        }
        self.scrape_in_flight = true;
        self.next_scrape_at = now + config.scrape_interval;
        true
    }

    /// Records a scrape result; failures never touch the announce schedule.
    pub fn complete_scrape(&mut self, result: Result<ScrapeStats, TrackerError>) {
        self.scrape_in_flight = false;
        match result {
            Ok(stats) => {
                self.stats.seeders = stats.complete;
                self.stats.leechers = stats.incomplete;
                self.stats.completed = Some(stats.downloaded);
            }
            Err(e) => tracing::debug!("Scrape of {} failed: {e}", self.url),
        }
    }
}

/// Exponential retry delay: `retry_base_delay * 2^(failures - 1)`, capped.
pub fn backoff_delay(failures: u32, config: &TrackerConfig) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    config
        .retry_base_delay
        .saturating_mul(1u32 << exponent)
        .min(config.retry_max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://t.example/announce";

    fn config() -> TrackerConfig {
        TrackerConfig {
            min_announce_interval: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(15),
            retry_max_delay: Duration::from_secs(600),
            failure_threshold: 3,
            deprioritized_backoff_factor: 4,
            ..TrackerConfig::default()
        }
    }

    fn ok(interval: u32, min_interval: Option<u32>) -> Result<AnnounceResponse, TrackerError> {
        Ok(AnnounceResponse {
            interval,
            min_interval,
            complete: 5,
            incomplete: 2,
            peers: vec!["10.0.0.1:6881".parse().unwrap()],
            ..AnnounceResponse::default()
        })
    }

    fn timeout() -> Result<AnnounceResponse, TrackerError> {
        Err(TrackerError::Timeout {
            url: URL.to_string(),
        })
    }

    #[test]
    fn test_started_then_regular() {
        let config = config();
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();
        assert_eq!(endpoint.status(), EndpointStatus::Idle);

        let ticket = endpoint.begin_announce(start).unwrap();
        assert_eq!(ticket.event, AnnounceEvent::Started);
        assert!(endpoint.begin_announce(start).is_none());

        let peers = endpoint.complete_announce(ticket.seq, ok(1800, None), None, &config, start);
        assert_eq!(peers.unwrap().len(), 1);
        assert!(endpoint.started_sent());
        assert_eq!(endpoint.status(), EndpointStatus::Working);
        assert_eq!(endpoint.next_announce_at(), start + Duration::from_secs(1800));
        assert_eq!(endpoint.stats().seeders, 5);

        let later = start + Duration::from_secs(1800);
        assert_eq!(
            endpoint.begin_announce(later).unwrap().event,
            AnnounceEvent::None
        );
    }

    #[test]
    fn test_session_interval_overrides_tracker_interval() {
        let config = config();
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();

        let ticket = endpoint.begin_announce(start).unwrap();
        endpoint.complete_announce(
            ticket.seq,
            ok(1800, Some(300)),
            Some(Duration::from_secs(120)),
            &config,
            start,
        );
        assert_eq!(endpoint.min_interval(), Duration::from_secs(300));
        assert_eq!(endpoint.next_announce_at(), start + Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_grows_then_deprioritizes() {
        let config = config();
        let mut now = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, now).unwrap();

        let expected = [60, 60, 60 * 4, 120 * 4, 240 * 4];
        for (attempt, secs) in expected.into_iter().enumerate() {
            let ticket = endpoint.begin_announce(now).unwrap();
            assert!(endpoint
                .complete_announce(ticket.seq, timeout(), None, &config, now)
                .is_none());
            assert_eq!(
                endpoint.next_announce_at() - now,
                Duration::from_secs(secs),
                "attempt {attempt}"
            );
            now = endpoint.next_announce_at();
        }
        assert_eq!(endpoint.status(), EndpointStatus::Deprioritized);
        assert_eq!(endpoint.consecutive_failures(), 5);
        assert!(!endpoint.started_sent());

        let ticket = endpoint.begin_announce(now).unwrap();
        assert_eq!(ticket.event, AnnounceEvent::Started);
        endpoint.complete_announce(ticket.seq, ok(900, None), None, &config, now);
        assert_eq!(endpoint.consecutive_failures(), 0);
        assert_eq!(endpoint.status(), EndpointStatus::Working);
    }

    #[test]
    fn test_stale_result_ignored() {
        let config = config();
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();

        let first = endpoint.begin_announce(start).unwrap();
        endpoint.abandon_in_flight();
        assert!(endpoint
            .complete_announce(first.seq, ok(1800, None), None, &config, start)
            .is_none());
        assert!(!endpoint.started_sent());
    }

    #[test]
    fn test_stopped_respects_min_interval() {
        let config = config();
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();
        assert!(!endpoint.can_send_stopped(start));

        let ticket = endpoint.begin_announce(start).unwrap();
        endpoint.complete_announce(ticket.seq, ok(1800, None), None, &config, start);

        assert!(endpoint.begin_stopped(start + Duration::from_secs(30)).is_none());
        let stopped = endpoint.begin_stopped(start + Duration::from_secs(60)).unwrap();
        assert_eq!(stopped.event, AnnounceEvent::Stopped);
        endpoint.complete_announce(
            stopped.seq,
            ok(1800, None),
            None,
            &config,
            start + Duration::from_secs(60),
        );
        assert!(!endpoint.started_sent());
    }

    #[test]
    fn test_scrape_cadence_independent_of_failures() {
        let config = TrackerConfig {
            scrape_interval: Duration::from_secs(300),
            ..config()
        };
        let start = Instant::now();
        let mut endpoint = TrackerEndpoint::new(URL, &config, start).unwrap();
        assert!(!endpoint.scrape_due(start));

        let at = start + Duration::from_secs(300);
        assert!(endpoint.begin_scrape(&config, at));
        assert!(!endpoint.begin_scrape(&config, at));
        endpoint.complete_scrape(Ok(ScrapeStats {
            complete: 9,
            downloaded: 40,
            incomplete: 1,
        }));
        assert_eq!(endpoint.stats().completed, Some(40));
        assert_eq!(endpoint.consecutive_failures(), 0);
    }

    #[test]
    fn test_backoff_delay_caps() {
        let config = config();
        assert_eq!(backoff_delay(1, &config), Duration::from_secs(15));
        assert_eq!(backoff_delay(3, &config), Duration::from_secs(60));
        assert_eq!(backoff_delay(40, &config), Duration::from_secs(600));
    }
}
