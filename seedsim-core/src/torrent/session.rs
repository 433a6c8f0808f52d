//! Per-torrent seeding session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use super::{FakePieceStore, InfoHash, PieceIndex, TorrentMetadata};
use crate::config::{PeerConfig, SeedSimConfig};
use crate::peer::{EngineContext, PeerId};
use crate::peer::bitfield::{present_pieces, synthetic_bitfield};
use crate::profile::SeedingProfile;
use crate::random::{RandomSource, SeededRandom};
use crate::shaper::{SpeedReading, SpeedShaper};
use crate::telemetry::{TorrentSnapshot, TrackerSnapshot};
use crate::tracker::{AnnounceEvent, AnnounceRequest, TrackerEndpoint, TrackerError};

/// Transfer counters shared with every connection of a session.
///
/// Only ever incremented; the resume base is fixed at construction.
#[derive(Debug, Default)]
pub struct SessionCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    base_uploaded: u64,
    base_downloaded: u64,
}

impl SessionCounters {
    /// Counters continuing from totals saved by a previous run.
    pub fn resumed(uploaded: u64, downloaded: u64) -> Self {
        Self {
            base_uploaded: uploaded,
            base_downloaded: downloaded,
            ..Self::default()
        }
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes uploaded in this session.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Bytes uploaded including the resumed total.
    pub fn total_uploaded(&self) -> u64 {
        self.base_uploaded + self.uploaded()
    }

    pub fn total_downloaded(&self) -> u64 {
        self.base_downloaded + self.downloaded()
    }
}

/// Lifecycle of a torrent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Added, not yet ticked
    Checking,
    Active,
    Paused,
    /// No usable peer source
    Error,
}

/// Totals carried over from a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeData {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Aggregate state of one seeded torrent.
pub struct TorrentSession {
    metadata: Arc<TorrentMetadata>,
    peer_id: PeerId,
    key: u32,
    counters: Arc<SessionCounters>,
    trackers: Vec<TrackerEndpoint>,
    state: SessionState,
    profile: SeedingProfile,
    rng: SeededRandom,
    bitfield: Bytes,
    pieces: Arc<FakePieceStore>,
    left: u64,
    error: Option<String>,
    next_dht_lookup: Option<Instant>,
}

impl TorrentSession {
    /// Creates a session in `Checking`.
    ///
    /// Everything random about the session (peer id, announce key,
    /// advertised bitfield, later activity rolls) derives from `seed`.
    /// Tracker URLs that cannot be parsed are skipped with a warning.
    pub fn new(
        metadata: Arc<TorrentMetadata>,
        profile: SeedingProfile,
        config: &SeedSimConfig,
        seed: u64,
        resume: ResumeData,
        now: Instant,
    ) -> Self {
        let mut rng = SeededRandom::from_seed(seed);
        let peer_id = PeerId::generate(&config.torrent.client_id, &mut rng);
        let key = rng.next_u32();
        let bitfield = synthetic_bitfield(metadata.piece_count, profile.completion, &mut rng);
        let left = Self::bytes_missing(&metadata, &bitfield);
        let pieces = Arc::new(FakePieceStore::new(&metadata, seed));

        let trackers = metadata
            .announce_urls
            .iter()
            .filter_map(|url| match TrackerEndpoint::new(url, &config.tracker, now) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::warn!(info_hash = %metadata.info_hash, "Skipping tracker: {e}");
                    None
                }
            })
            .collect();

        tracing::info!(
            info_hash = %metadata.info_hash,
            peer_id = %peer_id,
            "Session created for '{}' ({} pieces, profile '{}')",
            metadata.name,
            metadata.piece_count,
            profile.name
        );

        Self {
            metadata,
            peer_id,
            key,
            counters: Arc::new(SessionCounters::resumed(resume.uploaded, resume.downloaded)),
            trackers,
            state: SessionState::Checking,
            profile,
            rng,
            bitfield,
            pieces,
            left,
            error: None,
            next_dht_lookup: None,
        }
    }

    fn bytes_missing(metadata: &TorrentMetadata, bitfield: &[u8]) -> u64 {
        let have: u64 = present_pieces(bitfield, metadata.piece_count)
            .into_iter()
            .filter_map(|index| metadata.piece_size(PieceIndex::new(index)))
            .map(u64::from)
            .sum();
        metadata.total_size.saturating_sub(have)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.metadata
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    pub fn pieces(&self) -> &Arc<FakePieceStore> {
        &self.pieces
    }

    pub fn bitfield(&self) -> &Bytes {
        &self.bitfield
    }

    /// Bytes remaining, 0 for a seeder.
    pub fn left(&self) -> u64 {
        self.left
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &SeedingProfile {
        &self.profile
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The session's random source; all activity rolls go through it.
    pub fn rng(&mut self) -> &mut dyn RandomSource {
        &mut self.rng
    }

    pub fn trackers(&self) -> &[TrackerEndpoint] {
        &self.trackers
    }

    pub fn trackers_mut(&mut self) -> &mut [TrackerEndpoint] {
        &mut self.trackers
    }

    pub fn tracker_mut(&mut self, url: &str) -> Option<&mut TrackerEndpoint> {
        self.trackers.iter_mut().find(|t| t.url() == url)
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.counters.record_uploaded(bytes);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.counters.record_downloaded(bytes);
    }

    /// Statistics for an announce to `endpoint`.
    pub fn announce_request(
        &self,
        endpoint: &TrackerEndpoint,
        event: AnnounceEvent,
        port: u16,
        numwant: u32,
    ) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            port,
            uploaded: self.counters.total_uploaded(),
            downloaded: self.counters.total_downloaded(),
            left: self.left,
            event,
            numwant: if event == AnnounceEvent::Stopped { 0 } else { numwant },
            key: self.key,
            tracker_id: endpoint.tracker_id().map(str::to_string),
        }
    }

    /// Replaces the profile; the next announce schedule uses its interval.
    pub fn set_profile(&mut self, profile: SeedingProfile) {
        self.profile = profile;
    }

    /// Whether the session can find peers at all.
    pub fn has_peer_source(&self, dht_enabled: bool) -> bool {
        dht_enabled || !self.trackers.is_empty()
    }

    /// `Checking -> Active` on the first tick, or `Error` without a peer source.
    pub fn activate(&mut self, dht_enabled: bool) -> SessionState {
        if self.state == SessionState::Checking {
            if self.has_peer_source(dht_enabled) {
                self.state = SessionState::Active;
                tracing::info!(info_hash = %self.info_hash(), "Session active");
            } else {
                self.fail("no trackers and DHT disabled");
            }
        }
        self.state
    }

    pub fn fail(&mut self, reason: &str) {
        tracing::warn!(info_hash = %self.info_hash(), "Session error: {reason}");
        self.state = SessionState::Error;
        self.error = Some(reason.to_string());
    }

    /// `Active -> Paused`. Returns whether the state changed.
    pub fn pause(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.state = SessionState::Paused;
        for tracker in &mut self.trackers {
            tracker.abandon_in_flight();
        }
        true
    }

    /// `Paused -> Active` (or out of `Error` once a peer source exists);
    /// every tracker gets a fresh `started`.
    pub fn resume(&mut self, dht_enabled: bool, now: Instant) -> bool {
        let resumable = match self.state {
            SessionState::Paused => true,
            SessionState::Error => self.has_peer_source(dht_enabled),
            _ => false,
        };
        if !resumable {
            return false;
        }
        self.state = SessionState::Active;
        self.error = None;
        for tracker in &mut self.trackers {
            tracker.restart(now);
        }
        true
    }

    /// Adds a tracker URL. Returns false if it was already present.
    ///
    /// # Errors
    ///
    /// - `TrackerError::InvalidUrl` - URL unparseable or unsupported scheme
    pub fn add_tracker(
        &mut self,
        url: &str,
        config: &SeedSimConfig,
        now: Instant,
    ) -> Result<bool, TrackerError> {
        if self.trackers.iter().any(|t| t.url() == url) {
            return Ok(false);
        }
        self.trackers
            .push(TrackerEndpoint::new(url, &config.tracker, now)?);
        Ok(true)
    }

    pub fn remove_tracker(&mut self, url: &str) -> Option<TrackerEndpoint> {
        let position = self.trackers.iter().position(|t| t.url() == url)?;
        Some(self.trackers.remove(position))
    }

    /// What every connection of this session is served from.
    pub fn engine_context(
        &self,
        shaper: Arc<SpeedShaper>,
        config: PeerConfig,
        serve_interval: Duration,
    ) -> EngineContext {
        EngineContext {
            info_hash: self.info_hash(),
            local_peer_id: self.peer_id,
            piece_count: self.metadata.piece_count,
            pieces: Arc::clone(&self.pieces),
            bitfield: self.bitfield.clone(),
            counters: Arc::clone(&self.counters),
            shaper,
            config,
            serve_interval,
        }
    }

    pub fn dht_lookup_due(&self, now: Instant) -> bool {
        self.next_dht_lookup.is_none_or(|at| now >= at)
    }

    pub fn schedule_dht_lookup(&mut self, at: Instant) {
        self.next_dht_lookup = Some(at);
    }

    /// Statistics for telemetry; connection figures come from the manager.
    pub fn snapshot(
        &self,
        speed: SpeedReading,
        connections: usize,
        queued_candidates: usize,
        now: Instant,
    ) -> TorrentSnapshot {
        TorrentSnapshot {
            info_hash: self.info_hash().to_string(),
            name: self.metadata.name.clone(),
            state: self.state,
            profile: self.profile.name.clone(),
            uploaded: self.counters.uploaded(),
            downloaded: self.counters.downloaded(),
            total_uploaded: self.counters.total_uploaded(),
            total_downloaded: self.counters.total_downloaded(),
            upload_speed: speed.upload,
            download_speed: speed.download,
            left: self.left,
            connections,
            queued_candidates,
            trackers: self
                .trackers
                .iter()
                .map(|tracker| {
                    let stats = tracker.stats();
                    TrackerSnapshot {
                        url: tracker.url().to_string(),
                        status: tracker.status(),
                        seeders: stats.seeders,
                        leechers: stats.leechers,
                        peer_count: stats.peer_count,
                        completed: stats.completed,
                        consecutive_failures: tracker.consecutive_failures(),
                        last_error: tracker.last_error().map(str::to_string),
                        next_announce_in: tracker
                            .next_announce_at()
                            .saturating_duration_since(now)
                            .as_secs(),
                    }
                })
                .collect(),
            peers: Vec::new(),
            error: self.error.clone(),
        }
    }
}
