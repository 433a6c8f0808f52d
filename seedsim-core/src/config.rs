//! Centralized configuration for SeedSim.
//!
//! All tunable parameters (timeouts, limits, shaping and scheduling knobs) are
//! defined here to avoid hard-coded values scattered throughout the codebase.
//! Components never read these through globals; they receive a snapshot from a
//! [`SettingsProvider`](crate::settings::SettingsProvider) at construction.

use std::time::Duration;

/// Errors raised when a configuration or profile fails validation.
///
/// Configuration errors are surfaced at apply time and the whole change is
/// rejected; the previously active configuration stays in effect.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidRange { field: &'static str, reason: String },
}

/// Central configuration for all SeedSim components.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedSimConfig {
    pub torrent: TorrentConfig,
    pub tracker: TrackerConfig,
    pub peer: PeerConfig,
    pub shaper: ShaperConfig,
    pub scheduler: SchedulerConfig,
    pub dht: DhtConfig,
    pub simulation: SimulationConfig,
}

/// Client identity as presented to trackers and peers.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentConfig {
    /// Azureus-style client prefix placed in front of generated peer ids
    pub client_id: String,
    /// TCP port announced to trackers and used by the inbound listener
    pub listen_port: u16,
    /// Number of peers requested per announce
    pub numwant: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-SS0100-".to_string(),
            listen_port: 6881,
            numwant: 50,
        }
    }
}

/// Tracker communication and backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Bounded timeout for a whole HTTP announce or scrape
    pub http_timeout: Duration,
    /// Timeout for a single UDP connect exchange attempt
    pub udp_connect_timeout: Duration,
    /// Timeout for a single UDP announce or scrape exchange attempt
    pub udp_announce_timeout: Duration,
    /// Attempts per UDP phase before the exchange fails
    pub udp_max_retries: u32,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Interval used until a tracker tells us otherwise
    pub default_announce_interval: Duration,
    /// Floor for min_interval when the tracker does not send one
    pub min_announce_interval: Duration,
    /// First retry delay after a failed announce
    pub retry_base_delay: Duration,
    /// Ceiling for the exponential retry delay
    pub retry_max_delay: Duration,
    /// Consecutive failures after which an endpoint is deprioritized
    pub failure_threshold: u32,
    /// Multiplier applied to the retry delay of deprioritized endpoints
    pub deprioritized_backoff_factor: u32,
    /// How often scrape statistics are refreshed
    pub scrape_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(15),
            udp_connect_timeout: Duration::from_secs(5),
            udp_announce_timeout: Duration::from_secs(10),
            udp_max_retries: 3,
            user_agent: "seedsim/0.1.0".to_string(),
            default_announce_interval: Duration::from_secs(1800), // 30 minutes
            min_announce_interval: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(3600),
            failure_threshold: 5,
            deprioritized_backoff_factor: 4,
            scrape_interval: Duration::from_secs(900),
        }
    }
}

/// Peer wire protocol, connection pool and rotation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Maximum simultaneous connections across all torrents
    pub global_max_connections: usize,
    /// Default per-torrent connection cap (profiles may override)
    pub per_torrent_max_connections: usize,
    /// TCP connect timeout for outbound peers
    pub connect_timeout: Duration,
    /// Time allowed for the remote handshake to arrive
    pub handshake_timeout: Duration,
    /// Bound on reading a message length header and id
    pub message_read_timeout: Duration,
    /// Bound on reading a message payload once the header arrived
    pub data_read_timeout: Duration,
    /// Outbound silence after which we emit a keep-alive
    pub keep_alive_interval: Duration,
    /// Maximum lifetime of a single connection
    pub connection_duration: Duration,
    /// How often rotation runs
    pub rotation_interval: Duration,
    /// Percentage (0-100) of eligible connections rotated per pass
    pub connection_rotation_percentage: f64,
    /// Age after establishment before a connection may be rotated
    pub rotation_min_age: Duration,
    /// Cadence of the manager tick
    pub peer_update_interval: Duration,
    /// Inbound silence after which the manager force-closes a connection
    pub cleanup_timeout: Duration,
    /// Wait for the remote bitfield before declaring the connection established
    pub bitfield_grace_period: Duration,
    /// Largest block served in one piece message, in KiB
    pub fake_piece_data_size_kb: u32,
    /// Largest accepted message length header
    pub max_message_length: u32,
    /// Largest accepted request length
    pub max_request_length: u32,
    /// Maximum queued candidates waiting for a free slot
    pub candidate_queue_limit: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            global_max_connections: 200,
            per_torrent_max_connections: 50,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            message_read_timeout: Duration::from_secs(180),
            data_read_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(90),
            connection_duration: Duration::from_secs(3600),
            rotation_interval: Duration::from_secs(300),
            connection_rotation_percentage: 10.0,
            rotation_min_age: Duration::from_secs(600),
            peer_update_interval: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(300),
            bitfield_grace_period: Duration::from_secs(3),
            fake_piece_data_size_kb: 16,
            max_message_length: 1 << 20, // 1 MiB
            max_request_length: 128 * 1024,
            candidate_queue_limit: 200,
        }
    }
}

/// Throughput shaping configuration. Caps are bytes per second, 0 = unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaperConfig {
    pub global_upload_cap: u64,
    pub global_download_cap: u64,
    /// Lower bound of the multiplicative jitter applied to reported speeds
    pub speed_variation_min: f64,
    /// Upper bound of the multiplicative jitter applied to reported speeds
    pub speed_variation_max: f64,
    /// Probability per tick of a reported burst
    pub burst_probability: f64,
    /// Multiplier applied to reported speed during a burst
    pub burst_multiplier: f64,
    /// Baseline upload speed reported when uncapped and idle
    pub nominal_upload_speed: u64,
    /// Baseline download speed reported when uncapped and idle
    pub nominal_download_speed: u64,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            global_upload_cap: 0,
            global_download_cap: 0,
            speed_variation_min: 0.85,
            speed_variation_max: 1.10,
            burst_probability: 0.05,
            burst_multiplier: 1.5,
            nominal_upload_speed: 512 * 1024,
            nominal_download_speed: 0,
        }
    }
}

/// Scheduler loop and worker pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Period of the cooperative scheduler tick
    pub tick_resolution: Duration,
    /// Concurrent network operations allowed in flight
    pub worker_pool_size: usize,
    /// How often telemetry snapshots are published
    pub stats_interval: Duration,
    /// Time given to connections and tracker calls to finish on close
    pub shutdown_grace: Duration,
    /// Hard ceiling for global shutdown
    pub shutdown_hard_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_resolution: Duration::from_millis(250),
            worker_pool_size: 16,
            stats_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(3),
            shutdown_hard_timeout: Duration::from_secs(10),
        }
    }
}

/// Minimal DHT participation.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtConfig {
    pub enabled: bool,
    /// UDP port for KRPC traffic
    pub port: u16,
    /// `host:port` entries contacted on startup
    pub bootstrap_nodes: Vec<String>,
    /// Timeout for a single KRPC query
    pub query_timeout: Duration,
    /// How often each torrent is looked up and announced
    pub lookup_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 6881,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],
            query_timeout: Duration::from_secs(5),
            lookup_interval: Duration::from_secs(900),
        }
    }
}

/// Randomness and default behavior selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Seed for session random sources; None draws one from the OS
    pub deterministic_seed: Option<u64>,
    /// Profile applied to newly added torrents
    pub default_profile: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            default_profile: "balanced".to_string(),
        }
    }
}

pub(crate) fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigurationError::InvalidRange {
            field,
            reason: format!("probability must be within [0, 1], got {value}"),
        });
    }
    Ok(())
}

pub(crate) fn check_non_zero(field: &'static str, value: u64) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(ConfigurationError::InvalidRange {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl SeedSimConfig {
    /// Validates every section, returning the first violation found.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::InvalidRange` - A value is outside its allowed range
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.torrent.client_id.len() > 20 {
            return Err(ConfigurationError::InvalidRange {
                field: "torrent.client_id",
                reason: "client prefix must fit in a 20-byte peer id".to_string(),
            });
        }

        check_non_zero("tracker.udp_max_retries", self.tracker.udp_max_retries.into())?;
        check_non_zero(
            "tracker.min_announce_interval",
            self.tracker.min_announce_interval.as_secs(),
        )?;
        if self.tracker.retry_base_delay > self.tracker.retry_max_delay {
            return Err(ConfigurationError::InvalidRange {
                field: "tracker.retry_base_delay",
                reason: "base delay exceeds maximum delay".to_string(),
            });
        }

        check_non_zero(
            "peer.global_max_connections",
            self.peer.global_max_connections as u64,
        )?;
        check_non_zero(
            "peer.per_torrent_max_connections",
            self.peer.per_torrent_max_connections as u64,
        )?;
        check_non_zero(
            "peer.fake_piece_data_size_kb",
            self.peer.fake_piece_data_size_kb.into(),
        )?;
        if !(0.0..=100.0).contains(&self.peer.connection_rotation_percentage) {
            return Err(ConfigurationError::InvalidRange {
                field: "peer.connection_rotation_percentage",
                reason: format!(
                    "percentage must be within [0, 100], got {}",
                    self.peer.connection_rotation_percentage
                ),
            });
        }
        if self.peer.max_request_length > self.peer.max_message_length {
            return Err(ConfigurationError::InvalidRange {
                field: "peer.max_request_length",
                reason: "requests larger than the message limit could never be served"
                    .to_string(),
            });
        }

        let shaper = &self.shaper;
        if shaper.speed_variation_min <= 0.0 || shaper.speed_variation_min > shaper.speed_variation_max
        {
            return Err(ConfigurationError::InvalidRange {
                field: "shaper.speed_variation_min",
                reason: format!(
                    "expected 0 < min <= max, got min={} max={}",
                    shaper.speed_variation_min, shaper.speed_variation_max
                ),
            });
        }
        check_probability("shaper.burst_probability", shaper.burst_probability)?;
        if shaper.burst_multiplier < 1.0 {
            return Err(ConfigurationError::InvalidRange {
                field: "shaper.burst_multiplier",
                reason: format!("must be >= 1.0, got {}", shaper.burst_multiplier),
            });
        }

        check_non_zero(
            "scheduler.tick_resolution",
            self.scheduler.tick_resolution.as_millis() as u64,
        )?;
        check_non_zero(
            "scheduler.worker_pool_size",
            self.scheduler.worker_pool_size as u64,
        )?;

        Ok(())
    }

    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("SEEDSIM_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.tracker.http_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_peers) = std::env::var("SEEDSIM_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.peer.global_max_connections = count;
        }

        if let Ok(max_peers) = std::env::var("SEEDSIM_PER_TORRENT_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.peer.per_torrent_max_connections = count;
        }

        if let Ok(cap) = std::env::var("SEEDSIM_UPLOAD_CAP")
            && let Ok(bytes) = cap.parse::<u64>()
        {
            config.shaper.global_upload_cap = bytes;
        }

        if let Ok(port) = std::env::var("SEEDSIM_LISTEN_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.torrent.listen_port = port;
        }

        if let Ok(enabled) = std::env::var("SEEDSIM_DHT") {
            config.dht.enabled = enabled.parse().unwrap_or(false);
        }

        if let Ok(seed) = std::env::var("SEEDSIM_SEED")
            && let Ok(seed_value) = seed.parse::<u64>()
        {
            config.simulation.deterministic_seed = Some(seed_value);
        }

        if let Ok(profile) = std::env::var("SEEDSIM_PROFILE") {
            config.simulation.default_profile = profile;
        }

        config
    }

    /// Creates a configuration suited to fast, reproducible tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.simulation.deterministic_seed = Some(42);
        config.tracker.http_timeout = Duration::from_secs(2);
        config.tracker.udp_connect_timeout = Duration::from_millis(200);
        config.tracker.udp_announce_timeout = Duration::from_millis(200);
        config.peer.handshake_timeout = Duration::from_secs(2);
        config.peer.bitfield_grace_period = Duration::from_millis(100);
        config.scheduler.tick_resolution = Duration::from_millis(50);
        config.scheduler.shutdown_grace = Duration::from_millis(200);
        config.scheduler.shutdown_hard_timeout = Duration::from_secs(1);
        config
    }
}
