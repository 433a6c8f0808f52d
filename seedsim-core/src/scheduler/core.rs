//! Scheduler state and the cooperative tick.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Semaphore, mpsc};

use super::SchedulerError;
use super::commands::TrackerEdit;
use crate::SeedSimError;
use crate::config::{ConfigurationError, SeedSimConfig};
use crate::dht::DhtNode;
use crate::peer::{Direction, PeerConnectionManager};
use crate::profile::{SeedingProfile, SeedingProfileEngine};
use crate::random::SeededRandom;
use crate::settings::SettingsChange;
use crate::shaper::SpeedShaper;
use crate::telemetry::{PeerSnapshot, TelemetrySink, TelemetrySnapshot};
use crate::torrent::{InfoHash, ResumeData, SessionState, TorrentMetadata, TorrentSession};
use crate::tracker::{
    AnnounceRequest, AnnounceResponse, AnnounceTicket, ScrapeStats, TrackerClient, TrackerError,
    TrackerProtocol,
};

const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Collaborators the scheduler drives but does not construct.
pub struct SchedulerDeps {
    pub tracker: Arc<dyn TrackerClient>,
    pub sink: Arc<dyn TelemetrySink>,
    /// Running DHT node; lookups are skipped without one
    pub dht: Option<Arc<DhtNode>>,
    pub settings: Option<mpsc::UnboundedReceiver<SettingsChange>>,
}

impl SchedulerDeps {
    pub fn new(tracker: Arc<dyn TrackerClient>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            tracker,
            sink,
            dht: None,
            settings: None,
        }
    }

    pub fn with_dht(mut self, dht: Arc<DhtNode>) -> Self {
        self.dht = Some(dht);
        self
    }

    pub fn with_settings(mut self, changes: mpsc::UnboundedReceiver<SettingsChange>) -> Self {
        self.settings = Some(changes);
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub results_applied: usize,
    pub activated: usize,
    pub announces: usize,
    pub scrapes: usize,
    pub dht_lookups: usize,
    pub rotated: usize,
    pub published: bool,
}

enum WorkerJob {
    Announce {
        info_hash: InfoHash,
        url: String,
        seq: u64,
        request: AnnounceRequest,
    },
    Scrape {
        info_hash: InfoHash,
        url: String,
    },
    DhtLookup {
        info_hash: InfoHash,
        announce_port: u16,
    },
}

enum WorkerResult {
    Announce {
        info_hash: InfoHash,
        url: String,
        seq: u64,
        result: Result<AnnounceResponse, TrackerError>,
    },
    Scrape {
        info_hash: InfoHash,
        url: String,
        result: Result<ScrapeStats, TrackerError>,
    },
    DhtLookup {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    },
}

/// Owns every session and drives all time-based behavior.
///
/// All methods take the current instant explicitly so tests can drive the
/// scheduler through simulated time with [`SessionScheduler::tick`].
pub struct SessionScheduler {
    config: SeedSimConfig,
    sessions: BTreeMap<InfoHash, TorrentSession>,
    tracker: Arc<dyn TrackerClient>,
    sink: Arc<dyn TelemetrySink>,
    dht: Option<Arc<DhtNode>>,
    settings: Option<mpsc::UnboundedReceiver<SettingsChange>>,
    shaper: Arc<SpeedShaper>,
    connections: Arc<PeerConnectionManager>,
    profiles: SeedingProfileEngine,
    workers: Arc<Semaphore>,
    results_tx: mpsc::UnboundedSender<WorkerResult>,
    results_rx: mpsc::UnboundedReceiver<WorkerResult>,
    in_flight: usize,
    rng: SeededRandom,
    last_tick: Option<Instant>,
    next_peer_update: Instant,
    next_rotation: Instant,
    next_stats: Instant,
    next_token_rotation: Instant,
}

impl SessionScheduler {
    /// Builds the shaper, connection manager and profile engine from `config`.
    ///
    /// # Errors
    ///
    /// - `SeedSimError::Configuration` - Invalid config or unknown default profile
    pub fn new(
        config: SeedSimConfig,
        deps: SchedulerDeps,
        now: Instant,
    ) -> Result<Self, SeedSimError> {
        config.validate()?;
        let default_profile = SeedingProfile::by_name(&config.simulation.default_profile)?;

        let shaper = Arc::new(SpeedShaper::new(
            config.shaper.clone(),
            config.scheduler.tick_resolution,
        ));
        let workers = Arc::new(Semaphore::new(config.scheduler.worker_pool_size));
        let connections = Arc::new(PeerConnectionManager::new(
            config.peer.clone(),
            Arc::clone(&workers),
        ));
        let profiles = SeedingProfileEngine::new(
            Arc::clone(&shaper),
            Arc::clone(&connections),
            default_profile,
        )?;
        let rng = config
            .simulation
            .deterministic_seed
            .map_or_else(SeededRandom::from_entropy, SeededRandom::from_seed);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Ok(Self {
            next_peer_update: now,
            next_rotation: now + config.peer.rotation_interval,
            next_stats: now + config.scheduler.stats_interval,
            next_token_rotation: now + TOKEN_ROTATION_INTERVAL,
            config,
            sessions: BTreeMap::new(),
            tracker: deps.tracker,
            sink: deps.sink,
            dht: deps.dht,
            settings: deps.settings,
            shaper,
            connections,
            profiles,
            workers,
            results_tx,
            results_rx,
            in_flight: 0,
            rng,
            last_tick: None,
        })
    }

    pub fn config(&self) -> &SeedSimConfig {
        &self.config
    }

    pub fn shaper(&self) -> &Arc<SpeedShaper> {
        &self.shaper
    }

    /// The connection manager, for wiring an inbound listener.
    pub fn connections(&self) -> &Arc<PeerConnectionManager> {
        &self.connections
    }

    pub fn session(&self, info_hash: &InfoHash) -> Option<&TorrentSession> {
        self.sessions.get(info_hash)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn default_profile(&self) -> &SeedingProfile {
        self.profiles.default_profile()
    }

    /// Network operations dispatched whose results have not been applied.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn dht_enabled(&self) -> bool {
        self.config.dht.enabled && self.dht.is_some()
    }

    /// Adds a session in `Checking`; it activates on the next tick.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::DuplicateTorrent` - Info hash already seeded
    /// - `ConfigurationError` - The supplied profile is invalid
    pub fn add_torrent(
        &mut self,
        metadata: TorrentMetadata,
        profile: Option<SeedingProfile>,
        resume: ResumeData,
        now: Instant,
    ) -> Result<InfoHash, SeedSimError> {
        let info_hash = metadata.info_hash;
        if self.sessions.contains_key(&info_hash) {
            return Err(SchedulerError::DuplicateTorrent { info_hash }.into());
        }
        let profile = match profile {
            Some(profile) => {
                profile.validate()?;
                profile
            }
            None => self.profiles.default_profile().clone(),
        };

        let seed = self.session_seed(&info_hash);
        let session = TorrentSession::new(
            Arc::new(metadata),
            profile,
            &self.config,
            seed,
            resume,
            now,
        );
        let profile = session.profile();
        self.shaper
            .register_torrent(info_hash, profile.upload_speed, profile.download_speed);
        self.register_connections(&session);
        self.sessions.insert(info_hash, session);
        Ok(info_hash)
    }

    /// Per-session seed; with a deterministic seed configured it depends only
    /// on the info hash, not on the order torrents were added.
    fn session_seed(&self, info_hash: &InfoHash) -> u64 {
        match self.config.simulation.deterministic_seed {
            Some(seed) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&info_hash.as_bytes()[..8]);
                seed ^ u64::from_be_bytes(prefix)
            }
            None => rand::random(),
        }
    }

    fn register_connections(&self, session: &TorrentSession) {
        let ctx = session.engine_context(
            Arc::clone(&self.shaper),
            self.config.peer.clone(),
            self.config.scheduler.tick_resolution,
        );
        self.connections
            .register_torrent(ctx, session.profile().max_connections);
    }

    /// Sends `stopped` where allowed, closes every connection and drops
    /// the session.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    pub fn remove_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), SeedSimError> {
        let mut session = self
            .sessions
            .remove(info_hash)
            .ok_or(SchedulerError::TorrentNotFound {
                info_hash: *info_hash,
            })?;
        let jobs = stop_jobs(&mut session, &self.config, now);
        self.spawn_all(jobs);

        self.close_connections(info_hash);
        self.shaper.unregister_torrent(info_hash);
        tracing::info!(info_hash = %info_hash, "Session removed");
        Ok(())
    }

    /// `Active -> Paused`: in-flight announces are abandoned, `stopped` is
    /// sent where allowed and connections are closed.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `SchedulerError::InvalidState` - Session is not active
    pub fn pause_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), SeedSimError> {
        let session = find_session(&mut self.sessions, info_hash)?;
        if !session.pause() {
            return Err(invalid_state(session, "pause"));
        }
        let jobs = stop_jobs(session, &self.config, now);
        self.spawn_all(jobs);

        self.close_connections(info_hash);
        tracing::info!(info_hash = %info_hash, "Session paused");
        Ok(())
    }

    /// `Paused -> Active` (or out of `Error` once a peer source exists).
    /// Every tracker receives a fresh `started` on the next tick.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `SchedulerError::InvalidState` - Nothing to resume from
    pub fn resume_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), SeedSimError> {
        let dht_enabled = self.dht_enabled();
        let session = find_session(&mut self.sessions, info_hash)?;
        if !session.resume(dht_enabled, now) {
            return Err(invalid_state(session, "resume"));
        }
        if let Some(session) = self.sessions.get(info_hash) {
            self.register_connections(session);
        }
        tracing::info!(info_hash = %info_hash, "Session resumed");
        Ok(())
    }

    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `ConfigurationError` - Invalid profile; nothing changed
    pub fn apply_profile(
        &mut self,
        info_hash: &InfoHash,
        profile: SeedingProfile,
    ) -> Result<(), SeedSimError> {
        let session = find_session(&mut self.sessions, info_hash)?;
        self.profiles.apply(session, profile)?;
        Ok(())
    }

    /// Applies `profile` to every session and to sessions added later.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` - Invalid profile; nothing changed
    pub fn apply_global_profile(&mut self, profile: SeedingProfile) -> Result<usize, SeedSimError> {
        let name = profile.name.clone();
        let applied = self
            .profiles
            .apply_global(self.sessions.values_mut(), profile)?;
        self.config.simulation.default_profile = name;
        Ok(applied)
    }

    /// Adds and removes tracker URLs. Removed trackers that saw `started`
    /// get a `stopped` when `min_interval` allows.
    ///
    /// Every added URL is checked before anything changes. A session left
    /// without any peer source moves to `Error`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `TrackerError::InvalidUrl` - An added URL is unusable; nothing changed
    pub fn edit_trackers(
        &mut self,
        info_hash: &InfoHash,
        edit: TrackerEdit,
        now: Instant,
    ) -> Result<(), SeedSimError> {
        for url in &edit.add {
            TrackerProtocol::from_url(url)?;
        }
        let dht_enabled = self.dht_enabled();
        let port = self.config.torrent.listen_port;
        let session = find_session(&mut self.sessions, info_hash)?;

        let mut jobs = Vec::new();
        for url in &edit.remove {
            let Some(mut endpoint) = session.remove_tracker(url) else {
                continue;
            };
            if let Some(ticket) = endpoint.begin_stopped(now) {
                jobs.push(WorkerJob::Announce {
                    info_hash: *info_hash,
                    url: url.clone(),
                    seq: ticket.seq,
                    request: session.announce_request(&endpoint, ticket.event, port, 0),
                });
            }
            tracing::info!(info_hash = %info_hash, "Tracker removed: {url}");
        }
        for url in &edit.add {
            if session.add_tracker(url, &self.config, now)? {
                tracing::info!(info_hash = %info_hash, "Tracker added: {url}");
            }
        }

        let orphaned =
            session.state() == SessionState::Active && !session.has_peer_source(dht_enabled);
        if orphaned {
            session.fail("no trackers and DHT disabled");
        }
        self.spawn_all(jobs);
        if orphaned {
            self.close_connections(info_hash);
        }
        Ok(())
    }

    /// Replaces the configuration for every component that reads it.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` - Invalid config; the previous one stays active
    pub fn apply_config(&mut self, config: SeedSimConfig) -> Result<(), ConfigurationError> {
        config.validate()?;
        self.shaper.update_config(config.shaper.clone());
        self.connections.update_config(config.peer.clone());

        let old_pool = self.config.scheduler.worker_pool_size;
        let new_pool = config.scheduler.worker_pool_size;
        if new_pool > old_pool {
            self.workers.add_permits(new_pool - old_pool);
        } else if new_pool < old_pool {
            self.workers.forget_permits(old_pool - new_pool);
        }
        self.config = config;
        Ok(())
    }

    fn apply_settings_changes(&mut self) {
        let Some(changes) = self.settings.as_mut() else {
            return;
        };
        let mut latest = None;
        while let Ok(change) = changes.try_recv() {
            latest = Some(change);
        }
        if let Some(change) = latest {
            match self.apply_config(change.config) {
                Ok(()) => tracing::info!("Applied settings revision {}", change.revision),
                Err(e) => tracing::warn!("Rejected settings revision {}: {e}", change.revision),
            }
        }
    }

    /// Runs one scheduler tick at `now`.
    ///
    /// Order: settings changes, worker results, shaper refill, session
    /// activation and announce/scrape/DHT dispatch, connection maintenance,
    /// rotation, telemetry.
    pub fn tick(&mut self, now: Instant) -> TickSummary {
        let mut summary = TickSummary::default();
        self.apply_settings_changes();
        summary.results_applied = self.drain_results(now);

        let elapsed = self
            .last_tick
            .map_or(self.config.scheduler.tick_resolution, |last| {
                now.saturating_duration_since(last)
            });
        self.last_tick = Some(now);
        self.shaper.tick(elapsed);

        let dht_enabled = self.dht_enabled();
        let mut jobs = Vec::new();
        for (info_hash, session) in self.sessions.iter_mut() {
            if session.state() == SessionState::Checking
                && session.activate(dht_enabled) == SessionState::Active
            {
                summary.activated += 1;
            }
            if session.state() != SessionState::Active {
                continue;
            }

            jobs.extend(announce_jobs(session, &self.config, now));
            if dht_enabled && session.dht_lookup_due(now) {
                session.schedule_dht_lookup(now + self.config.dht.lookup_interval);
                jobs.push(WorkerJob::DhtLookup {
                    info_hash: *info_hash,
                    announce_port: self.config.torrent.listen_port,
                });
            }
        }
        for job in &jobs {
            match job {
                WorkerJob::Announce { .. } => summary.announces += 1,
                WorkerJob::Scrape { .. } => summary.scrapes += 1,
                WorkerJob::DhtLookup { .. } => summary.dht_lookups += 1,
            }
        }
        self.spawn_all(jobs);

        if now >= self.next_peer_update {
            self.next_peer_update = now + self.config.peer.peer_update_interval;
            for (info_hash, session) in self.sessions.iter_mut() {
                if session.state() == SessionState::Active {
                    let behavior = session.profile().connection_behavior();
                    self.connections.tick(info_hash, &behavior, session.rng());
                }
            }
        }

        if now >= self.next_rotation {
            self.next_rotation = now + self.config.peer.rotation_interval;
            let percentage = self.config.peer.connection_rotation_percentage;
            for (info_hash, session) in &self.sessions {
                if session.state() == SessionState::Active {
                    summary.rotated += self.connections.rotate(info_hash, percentage);
                }
            }
        }

        if let Some(dht) = &self.dht
            && now >= self.next_token_rotation
        {
            self.next_token_rotation = now + TOKEN_ROTATION_INTERVAL;
            dht.rotate_token_secret(&mut self.rng);
        }

        if now >= self.next_stats {
            self.next_stats = now + self.config.scheduler.stats_interval;
            let snapshot = self.snapshot(now);
            self.sink.publish(&snapshot);
            summary.published = true;
        }

        summary
    }

    /// Applies every worker result already delivered.
    fn drain_results(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok(result) = self.results_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.apply_result(result, now);
            applied += 1;
        }
        applied
    }

    /// Waits until every dispatched operation has reported back and applies
    /// the results.
    pub async fn settle(&mut self, now: Instant) {
        while self.in_flight > 0 {
            let Some(result) = self.results_rx.recv().await else {
                break;
            };
            self.in_flight -= 1;
            self.apply_result(result, now);
        }
    }

    fn apply_result(&mut self, result: WorkerResult, now: Instant) {
        match result {
            WorkerResult::Announce {
                info_hash,
                url,
                seq,
                result,
            } => {
                let Some(session) = self.sessions.get_mut(&info_hash) else {
                    tracing::debug!(info_hash = %info_hash, "Dropping announce result for removed session");
                    return;
                };
                let accepting = session.state() == SessionState::Active;
                let interval = session.profile().announce_interval;
                let Some(endpoint) = session.tracker_mut(&url) else {
                    return;
                };
                let peers = endpoint.complete_announce(
                    seq,
                    result,
                    Some(interval),
                    &self.config.tracker,
                    now,
                );
                if let Some(peers) = peers
                    && accepting
                    && !peers.is_empty()
                {
                    let started = self.connections.add_candidates(&info_hash, &peers);
                    tracing::debug!(
                        info_hash = %info_hash,
                        "{} peers from {url}, {started} connections started",
                        peers.len()
                    );
                }
            }
            WorkerResult::Scrape {
                info_hash,
                url,
                result,
            } => {
                if let Some(endpoint) = self
                    .sessions
                    .get_mut(&info_hash)
                    .and_then(|session| session.tracker_mut(&url))
                {
                    endpoint.complete_scrape(result);
                }
            }
            WorkerResult::DhtLookup { info_hash, peers } => {
                let active = self
                    .sessions
                    .get(&info_hash)
                    .is_some_and(|session| session.state() == SessionState::Active);
                if active && !peers.is_empty() {
                    self.connections.add_candidates(&info_hash, &peers);
                }
            }
        }
    }

    /// Stops admissions at once; the close grace runs on its own task so
    /// the tick loop keeps serving other torrents.
    fn close_connections(&self, info_hash: &InfoHash) {
        let Some(closing) = self.connections.begin_close(info_hash) else {
            return;
        };
        let connections = Arc::clone(&self.connections);
        let grace = self.config.scheduler.shutdown_grace;
        let info_hash = *info_hash;
        tokio::spawn(async move {
            connections.finish_close(&info_hash, closing, grace).await;
        });
    }

    fn spawn_all(&mut self, jobs: Vec<WorkerJob>) {
        for job in jobs {
            self.spawn_worker(job);
        }
    }

    fn spawn_worker(&mut self, job: WorkerJob) {
        let permits = Arc::clone(&self.workers);
        let results = self.results_tx.clone();

        match job {
            WorkerJob::Announce {
                info_hash,
                url,
                seq,
                request,
            } => {
                let client = Arc::clone(&self.tracker);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let result = client.announce(&url, &request).await;
                    let _ = results.send(WorkerResult::Announce {
                        info_hash,
                        url,
                        seq,
                        result,
                    });
                });
            }
            WorkerJob::Scrape { info_hash, url } => {
                let client = Arc::clone(&self.tracker);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let result = client.scrape(&url, info_hash).await;
                    let _ = results.send(WorkerResult::Scrape {
                        info_hash,
                        url,
                        result,
                    });
                });
            }
            WorkerJob::DhtLookup {
                info_hash,
                announce_port,
            } => {
                let Some(dht) = self.dht.clone() else {
                    return;
                };
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let peers = dht.lookup_peers(info_hash, Some(announce_port)).await;
                    let _ = results.send(WorkerResult::DhtLookup { info_hash, peers });
                });
            }
        }
        self.in_flight += 1;
    }

    /// Aggregated statistics for every session.
    pub fn snapshot(&mut self, now: Instant) -> TelemetrySnapshot {
        let mut torrents = Vec::with_capacity(self.sessions.len());
        for (info_hash, session) in self.sessions.iter_mut() {
            let burst_probability = session.profile().burst_probability;
            let speed = self
                .shaper
                .reported(info_hash, burst_probability, session.rng());
            let mut snapshot = session.snapshot(
                speed,
                self.connections.connection_count(info_hash),
                self.connections.queued_candidates(info_hash),
                now,
            );
            snapshot.peers = self
                .connections
                .snapshot(info_hash)
                .into_iter()
                .map(|connection| PeerSnapshot {
                    address: connection.address.to_string(),
                    inbound: connection.direction == Direction::Inbound,
                    state: connection.state,
                    uploaded: connection.uploaded,
                    downloaded: connection.downloaded,
                })
                .collect();
            torrents.push(snapshot);
        }

        TelemetrySnapshot {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default(),
            total_connections: self.connections.total_connections(),
            upload_speed: torrents.iter().map(|t| t.upload_speed).sum(),
            download_speed: torrents.iter().map(|t| t.download_speed).sum(),
            torrents,
        }
    }

    /// Stops everything: `stopped` announces, pending results, connections.
    ///
    /// Tracker results get `shutdown_grace`, connections get the same grace
    /// before being aborted, and the whole sequence is bounded by
    /// `shutdown_hard_timeout`.
    pub async fn shutdown(&mut self, now: Instant) {
        tracing::info!("Shutting down {} sessions", self.sessions.len());
        let grace = self.config.scheduler.shutdown_grace;
        let hard_timeout = self.config.scheduler.shutdown_hard_timeout;

        let mut jobs = Vec::new();
        for session in self.sessions.values_mut() {
            for endpoint in session.trackers_mut() {
                endpoint.abandon_in_flight();
            }
            jobs.extend(stop_jobs(session, &self.config, now));
        }
        self.spawn_all(jobs);

        let stopping = async {
            if tokio::time::timeout(grace, self.settle(now)).await.is_err() {
                tracing::debug!("{} tracker requests still pending at shutdown", self.in_flight);
            }
            self.connections.close_all(grace).await;
        };
        if tokio::time::timeout(hard_timeout, stopping).await.is_err() {
            tracing::warn!("Shutdown exceeded {hard_timeout:?}, abandoning remaining work");
        }

        if let Some(dht) = &self.dht {
            dht.shutdown();
        }
        for info_hash in self.sessions.keys() {
            self.shaper.unregister_torrent(info_hash);
        }
        self.sessions.clear();
        tracing::info!("Scheduler stopped");
    }

    pub fn tick_resolution(&self) -> Duration {
        self.config.scheduler.tick_resolution
    }
}

fn find_session<'a>(
    sessions: &'a mut BTreeMap<InfoHash, TorrentSession>,
    info_hash: &InfoHash,
) -> Result<&'a mut TorrentSession, SchedulerError> {
    sessions
        .get_mut(info_hash)
        .ok_or(SchedulerError::TorrentNotFound {
            info_hash: *info_hash,
        })
}

fn invalid_state(session: &TorrentSession, action: &'static str) -> SeedSimError {
    SchedulerError::InvalidState {
        info_hash: session.info_hash(),
        action,
        state: format!("{:?}", session.state()),
    }
    .into()
}

/// Regular announces and scrapes due for one session.
fn announce_jobs(session: &mut TorrentSession, config: &SeedSimConfig, now: Instant) -> Vec<WorkerJob> {
    let info_hash = session.info_hash();
    let mut tickets = Vec::new();
    let mut jobs = Vec::new();
    for endpoint in session.trackers_mut() {
        if let Some(ticket) = endpoint.begin_announce(now) {
            tickets.push((endpoint.url().to_string(), ticket));
        } else if endpoint.started_sent() && endpoint.begin_scrape(&config.tracker, now) {
            jobs.push(WorkerJob::Scrape {
                info_hash,
                url: endpoint.url().to_string(),
            });
        }
    }
    jobs.extend(ticket_jobs(session, tickets, config));
    jobs
}

/// `stopped` announces for every tracker of a session that allows one.
fn stop_jobs(session: &mut TorrentSession, config: &SeedSimConfig, now: Instant) -> Vec<WorkerJob> {
    let tickets: Vec<(String, AnnounceTicket)> = session
        .trackers_mut()
        .iter_mut()
        .filter_map(|endpoint| {
            let ticket = endpoint.begin_stopped(now)?;
            Some((endpoint.url().to_string(), ticket))
        })
        .collect();
    ticket_jobs(session, tickets, config)
}

fn ticket_jobs(
    session: &TorrentSession,
    tickets: Vec<(String, AnnounceTicket)>,
    config: &SeedSimConfig,
) -> Vec<WorkerJob> {
    tickets
        .into_iter()
        .filter_map(|(url, ticket)| {
            let endpoint = session.trackers().iter().find(|t| t.url() == url)?;
            let request = session.announce_request(
                endpoint,
                ticket.event,
                config.torrent.listen_port,
                config.torrent.numwant,
            );
            Some(WorkerJob::Announce {
                info_hash: session.info_hash(),
                url,
                seq: ticket.seq,
                request,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::AdmitError;
    use crate::settings::{InMemorySettings, SettingsProvider};
    use crate::telemetry::ChannelSink;
    use crate::tracker::test_mocks::MockTrackerClient;
    use crate::tracker::{AnnounceEvent, EndpointStatus};

    const TRACKER: &str = "http://tracker.example/announce";

    fn metadata(byte: u8, trackers: &[&str]) -> TorrentMetadata {
        TorrentMetadata::new(
            InfoHash::new([byte; 20]),
            format!("torrent-{byte}"),
            16384,
            16384 * 8,
            vec![trackers.iter().map(|url| url.to_string()).collect()],
        )
        .unwrap()
    }

    fn scheduler(
        tracker: Arc<MockTrackerClient>,
    ) -> (
        SessionScheduler,
        mpsc::UnboundedReceiver<TelemetrySnapshot>,
        Instant,
    ) {
        let (sink, snapshots) = ChannelSink::new();
        let now = Instant::now();
        let scheduler = SessionScheduler::new(
            SeedSimConfig::for_testing(),
            SchedulerDeps::new(tracker, Arc::new(sink)),
            now,
        )
        .unwrap();
        (scheduler, snapshots, now)
    }

    #[tokio::test]
    async fn test_first_tick_activates_and_announces_started() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(1, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        assert_eq!(
            scheduler.session(&info_hash).unwrap().state(),
            SessionState::Checking
        );

        let summary = scheduler.tick(now);
        assert_eq!(summary.activated, 1);
        assert_eq!(summary.announces, 1);
        scheduler.settle(now).await;

        let requests = tracker.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.event, AnnounceEvent::Started);
        assert_eq!(requests[0].1.port, 6881);
        let endpoint = &scheduler.session(&info_hash).unwrap().trackers()[0];
        assert_eq!(endpoint.status(), EndpointStatus::Working);
        assert!(endpoint.started_sent());
        // Profile interval decides the next announce
        assert_eq!(
            endpoint.next_announce_at(),
            now + scheduler.default_profile().announce_interval
        );
    }

    #[tokio::test]
    async fn test_duplicate_torrent_rejected() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(tracker);
        scheduler
            .add_torrent(metadata(1, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        let duplicate =
            scheduler.add_torrent(metadata(1, &[TRACKER]), None, ResumeData::default(), now);
        assert!(matches!(
            duplicate,
            Err(SeedSimError::Scheduler(SchedulerError::DuplicateTorrent { .. }))
        ));
    }

    #[tokio::test]
    async fn test_no_peer_source_moves_to_error() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(2, &[]), None, ResumeData::default(), now)
            .unwrap();

        let summary = scheduler.tick(now);
        assert_eq!(summary.announces, 0);
        let session = scheduler.session(&info_hash).unwrap();
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.error().is_some());
        assert_eq!(tracker.announce_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_announce_never_retries_before_min_interval() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        tracker.push_result(Err(TrackerError::Timeout {
            url: TRACKER.to_string(),
        }));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(3, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();

        scheduler.tick(now);
        scheduler.settle(now).await;
        let endpoint = &scheduler.session(&info_hash).unwrap().trackers()[0];
        assert_eq!(endpoint.status(), EndpointStatus::Failing);
        assert_eq!(endpoint.consecutive_failures(), 1);

        for seconds in [1, 10, 59] {
            let summary = scheduler.tick(now + Duration::from_secs(seconds));
            assert_eq!(summary.announces, 0, "re-announced after {seconds}s");
        }
        let summary = scheduler.tick(now + Duration::from_secs(60));
        assert_eq!(summary.announces, 1);
        scheduler.settle(now + Duration::from_secs(60)).await;
        assert_eq!(tracker.announce_count(), 2);
        // Still Started: the first one was never acknowledged
        assert_eq!(tracker.requests()[1].1.event, AnnounceEvent::Started);
    }

    #[tokio::test]
    async fn test_result_after_pause_is_ignored() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        tracker.set_delay(Duration::from_millis(50));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(4, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();

        scheduler.tick(now);
        scheduler.pause_torrent(&info_hash, now).unwrap();
        scheduler.settle(now).await;

        let session = scheduler.session(&info_hash).unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        assert_ne!(session.trackers()[0].status(), EndpointStatus::Working);
        assert!(!session.trackers()[0].started_sent());

        scheduler.resume_torrent(&info_hash, now).unwrap();
        let summary = scheduler.tick(now + Duration::from_secs(61));
        assert_eq!(summary.announces, 1);
    }

    #[tokio::test]
    async fn test_remove_sends_stopped_once_min_interval_passed() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(5, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        scheduler.tick(now);
        scheduler.settle(now).await;

        let later = now + Duration::from_secs(120);
        scheduler.remove_torrent(&info_hash, later).unwrap();
        scheduler.settle(later).await;

        let requests = tracker.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1.event, AnnounceEvent::Stopped);
        assert_eq!(requests[1].1.numwant, 0);
        assert_eq!(scheduler.session_count(), 0);
        assert!(matches!(
            scheduler.remove_torrent(&info_hash, later),
            Err(SeedSimError::Scheduler(SchedulerError::TorrentNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_remove_within_min_interval_skips_stopped() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(6, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        scheduler.tick(now);
        scheduler.settle(now).await;

        scheduler
            .remove_torrent(&info_hash, now + Duration::from_secs(5))
            .unwrap();
        scheduler.settle(now).await;
        assert_eq!(tracker.announce_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_does_not_wait_for_connection_grace() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let mut config = SeedSimConfig::for_testing();
        config.peer.handshake_timeout = Duration::from_secs(5);
        config.scheduler.shutdown_grace = Duration::from_secs(5);
        let (sink, _snapshots) = ChannelSink::new();
        let now = Instant::now();
        let mut scheduler = SessionScheduler::new(
            config,
            SchedulerDeps::new(tracker.clone(), Arc::new(sink)),
            now,
        )
        .unwrap();
        let paused = scheduler
            .add_torrent(metadata(10, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        let running = scheduler
            .add_torrent(metadata(11, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        scheduler.tick(now);
        scheduler.settle(now).await;

        // The remote never answers, so the connection only ends on abort
        let (local, remote) = tokio::io::duplex(1024);
        scheduler
            .connections()
            .attach(
                paused,
                SocketAddr::from(([10, 0, 0, 1], 6881)),
                Direction::Outbound,
                local,
                None,
            )
            .unwrap();

        let started = Instant::now();
        scheduler.pause_torrent(&paused, now).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            scheduler.session(&paused).unwrap().state(),
            SessionState::Paused
        );
        assert_eq!(scheduler.connections().connection_count(&paused), 1);
        let (late, _late_remote) = tokio::io::duplex(1024);
        assert!(matches!(
            scheduler.connections().attach(
                paused,
                SocketAddr::from(([10, 0, 0, 2], 6881)),
                Direction::Outbound,
                late,
                None,
            ),
            Err(AdmitError::UnknownTorrent { .. })
        ));

        let later = now + Duration::from_secs(4000);
        assert_eq!(scheduler.tick(later).announces, 1);
        scheduler.settle(later).await;
        let last = tracker.requests().last().cloned().unwrap();
        assert_eq!(last.1.info_hash, running);

        drop(remote);
        let deadline = Instant::now() + Duration::from_secs(2);
        while scheduler.connections().total_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.connections().total_connections(), 0);
    }

    #[tokio::test]
    async fn test_invalid_profile_changes_nothing() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(tracker);
        let info_hash = scheduler
            .add_torrent(metadata(7, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();

        let broken = SeedingProfile {
            idle_probability: 2.0,
            ..SeedingProfile::aggressive()
        };
        assert!(scheduler.apply_profile(&info_hash, broken.clone()).is_err());
        assert!(scheduler.apply_global_profile(broken).is_err());
        assert_eq!(
            scheduler.session(&info_hash).unwrap().profile().name,
            "balanced"
        );

        assert_eq!(
            scheduler
                .apply_global_profile(SeedingProfile::aggressive())
                .unwrap(),
            1
        );
        assert_eq!(scheduler.default_profile().name, "aggressive");
        assert_eq!(
            scheduler.session(&info_hash).unwrap().profile().max_connections,
            80
        );
    }

    #[tokio::test]
    async fn test_edit_trackers() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, _snapshots, now) = scheduler(Arc::clone(&tracker));
        let info_hash = scheduler
            .add_torrent(metadata(8, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();
        scheduler.tick(now);
        scheduler.settle(now).await;

        let rejected = scheduler
            .edit_trackers(
                &info_hash,
                TrackerEdit {
                    add: vec!["udp://second.example:6969".to_string(), "gopher://x".to_string()],
                    remove: vec![TRACKER.to_string()],
                },
                now,
            );
        assert!(matches!(rejected, Err(SeedSimError::Tracker(_))));
        assert_eq!(scheduler.session(&info_hash).unwrap().trackers().len(), 1);

        scheduler
            .edit_trackers(
                &info_hash,
                TrackerEdit {
                    add: vec![],
                    remove: vec![TRACKER.to_string()],
                },
                now,
            )
            .unwrap();
        let session = scheduler.session(&info_hash).unwrap();
        assert!(session.trackers().is_empty());
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_stats_published_on_interval() {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (mut scheduler, mut snapshots, now) = scheduler(tracker);
        scheduler
            .add_torrent(metadata(9, &[TRACKER]), None, ResumeData::default(), now)
            .unwrap();

        assert!(!scheduler.tick(now).published);
        let stats_interval = scheduler.config().scheduler.stats_interval;
        assert!(scheduler.tick(now + stats_interval).published);

        let snapshot = snapshots.try_recv().unwrap();
        assert_eq!(snapshot.torrents.len(), 1);
        assert_eq!(snapshot.torrents[0].state, SessionState::Active);
        assert_eq!(snapshot.torrents[0].trackers.len(), 1);
    }

    #[tokio::test]
    async fn test_settings_change_applied_on_tick() {
        let settings = InMemorySettings::new(SeedSimConfig::for_testing()).unwrap();
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (sink, _snapshots) = ChannelSink::new();
        let now = Instant::now();
        let mut scheduler = SessionScheduler::new(
            settings.current(),
            SchedulerDeps::new(tracker, Arc::new(sink)).with_settings(settings.subscribe()),
            now,
        )
        .unwrap();

        settings
            .modify(|config| config.torrent.numwant = 7)
            .unwrap();
        scheduler.tick(now);
        assert_eq!(scheduler.config().torrent.numwant, 7);
    }

    #[tokio::test]
    async fn test_unknown_default_profile_rejected() {
        let mut config = SeedSimConfig::for_testing();
        config.simulation.default_profile = "turbo".to_string();
        let (sink, _snapshots) = ChannelSink::new();
        let result = SessionScheduler::new(
            config,
            SchedulerDeps::new(
                Arc::new(MockTrackerClient::with_interval(1800)),
                Arc::new(sink),
            ),
            Instant::now(),
        );
        assert!(matches!(result, Err(SeedSimError::Configuration(_))));
    }
}
