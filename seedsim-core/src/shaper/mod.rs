//! Upload and download throughput shaping.
//!
//! Every byte served to a peer is granted by [`SpeedShaper::request_upload`],
//! which draws from the torrent bucket and the global bucket together under
//! one lock. Buckets refill once per scheduler tick. Reported speeds are the
//! measured rates with multiplicative jitter and occasional bursts, clamped
//! so a capped scope never reports more than its cap.

pub mod token_bucket;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

pub use token_bucket::TokenBucket;

use crate::config::ShaperConfig;
use crate::random::RandomSource;
use crate::torrent::InfoHash;

/// Upload/download rate pair in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeedReading {
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug)]
struct Scope {
    upload: TokenBucket,
    download: TokenBucket,
    uploaded_this_window: u64,
    downloaded_this_window: u64,
    measured: SpeedReading,
}

impl Scope {
    fn new(upload_cap: u64, download_cap: u64, tick: Duration) -> Self {
        Self {
            upload: TokenBucket::new(upload_cap, tick),
            download: TokenBucket::new(download_cap, tick),
            uploaded_this_window: 0,
            downloaded_this_window: 0,
            measured: SpeedReading::default(),
        }
    }

    fn roll_window(&mut self, elapsed: Duration, tick: Duration) {
        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.measured = SpeedReading {
                upload: (self.uploaded_this_window as f64 / seconds) as u64,
                download: (self.downloaded_this_window as f64 / seconds) as u64,
            };
        }
        self.uploaded_this_window = 0;
        self.downloaded_this_window = 0;
        self.upload.refill(elapsed, tick);
        self.download.refill(elapsed, tick);
    }
}

#[derive(Debug)]
struct ShaperState {
    config: ShaperConfig,
    tick: Duration,
    global: Scope,
    torrents: HashMap<InfoHash, Scope>,
}

/// Shared byte-granting authority for all connections.
#[derive(Debug)]
pub struct SpeedShaper {
    state: Mutex<ShaperState>,
}

impl SpeedShaper {
    /// Creates a shaper whose buckets refill every `tick`.
    pub fn new(config: ShaperConfig, tick: Duration) -> Self {
        let global = Scope::new(config.global_upload_cap, config.global_download_cap, tick);
        Self {
            state: Mutex::new(ShaperState {
                config,
                tick,
                global,
                torrents: HashMap::new(),
            }),
        }
    }

    /// Creates buckets for a torrent. Re-registering resets its caps.
    pub fn register_torrent(&self, info_hash: InfoHash, upload_cap: u64, download_cap: u64) {
        let mut state = self.state.lock();
        let tick = state.tick;
        state
            .torrents
            .insert(info_hash, Scope::new(upload_cap, download_cap, tick));
    }

    /// Drops a torrent's buckets; later grants for it return zero.
    pub fn unregister_torrent(&self, info_hash: &InfoHash) {
        self.state.lock().torrents.remove(info_hash);
    }

    /// Stages new caps for a torrent, effective from the next tick.
    pub fn set_torrent_caps(&self, info_hash: &InfoHash, upload_cap: u64, download_cap: u64) {
        if let Some(scope) = self.state.lock().torrents.get_mut(info_hash) {
            scope.upload.set_rate(upload_cap);
            scope.download.set_rate(download_cap);
        }
    }

    /// Stages new global settings, effective from the next tick.
    pub fn update_config(&self, config: ShaperConfig) {
        let mut state = self.state.lock();
        state.global.upload.set_rate(config.global_upload_cap);
        state.global.download.set_rate(config.global_download_cap);
        state.config = config;
    }

    /// Grants up to `requested` upload bytes for `info_hash`.
    ///
    /// The grant is the minimum of what the torrent and global buckets hold
    /// and is deducted from both. Returns 0 when either bucket is empty or
    /// the torrent is unknown.
    pub fn request_upload(&self, info_hash: &InfoHash, requested: u64) -> u64 {
        let mut state = self.state.lock();
        let ShaperState {
            global, torrents, ..
        } = &mut *state;
        let Some(scope) = torrents.get_mut(info_hash) else {
            return 0;
        };

        let granted = requested
            .min(scope.upload.available())
            .min(global.upload.available());
        if granted == 0 {
            return 0;
        }
        scope.upload.consume(granted);
        global.upload.consume(granted);
        scope.uploaded_this_window += granted;
        global.uploaded_this_window += granted;
        granted
    }

    /// Accounts bytes received from a peer.
    ///
    /// Remote peers decide what they send, so download is measured and
    /// drained from the buckets but never refused.
    pub fn record_download(&self, info_hash: &InfoHash, bytes: u64) {
        let mut state = self.state.lock();
        let ShaperState {
            global, torrents, ..
        } = &mut *state;
        if let Some(scope) = torrents.get_mut(info_hash) {
            scope.download.consume(bytes);
            scope.downloaded_this_window += bytes;
        }
        global.download.consume(bytes);
        global.downloaded_this_window += bytes;
    }

    /// Refills every bucket and closes the measurement window.
    ///
    /// Staged cap changes take effect here.
    pub fn tick(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        let tick = state.tick;
        state.global.roll_window(elapsed, tick);
        for scope in state.torrents.values_mut() {
            scope.roll_window(elapsed, tick);
        }
    }

    /// Measured speed for a torrent over the last window, without jitter.
    pub fn measured(&self, info_hash: &InfoHash) -> SpeedReading {
        self.state
            .lock()
            .torrents
            .get(info_hash)
            .map(|scope| scope.measured)
            .unwrap_or_default()
    }

    /// Speed reported to the outside world for a torrent.
    ///
    /// `burst_probability` comes from the torrent's seeding profile.
    pub fn reported(
        &self,
        info_hash: &InfoHash,
        burst_probability: f64,
        rng: &mut dyn RandomSource,
    ) -> SpeedReading {
        let state = self.state.lock();
        let Some(scope) = state.torrents.get(info_hash) else {
            return SpeedReading::default();
        };

        let config = &state.config;
        let global_up = state.global.upload.rate();
        let global_down = state.global.download.rate();
        let upload = report_one(
            scope.measured.upload,
            effective_cap(scope.upload.rate(), global_up),
            config.nominal_upload_speed,
            config,
            burst_probability,
            rng,
        );
        let download = report_one(
            scope.measured.download,
            effective_cap(scope.download.rate(), global_down),
            config.nominal_download_speed,
            config,
            burst_probability,
            rng,
        );
        SpeedReading { upload, download }
    }

    /// Measured totals across all torrents over the last window.
    pub fn global_measured(&self) -> SpeedReading {
        self.state.lock().global.measured
    }
}

fn effective_cap(torrent_cap: u64, global_cap: u64) -> u64 {
    match (torrent_cap, global_cap) {
        (0, global) => global,
        (torrent, 0) => torrent,
        (torrent, global) => torrent.min(global),
    }
}

fn report_one(
    measured: u64,
    cap: u64,
    nominal: u64,
    config: &ShaperConfig,
    burst_probability: f64,
    rng: &mut dyn RandomSource,
) -> u64 {
    let base = if cap == 0 && measured == 0 {
        nominal
    } else {
        measured
    };
    if base == 0 {
        return 0;
    }

    let mut factor = rng.range_f64(config.speed_variation_min, config.speed_variation_max);
    if rng.chance(burst_probability) {
        factor *= config.burst_multiplier;
    }

    let reported = (base as f64 * factor) as u64;
    if cap > 0 { reported.min(cap) } else { reported }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{ScriptedRandom, SeededRandom};

    const TICK: Duration = Duration::from_millis(100);

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn shaper_with(global_up: u64) -> SpeedShaper {
        let config = ShaperConfig {
            global_upload_cap: global_up,
            ..ShaperConfig::default()
        };
        SpeedShaper::new(config, TICK)
    }

    #[test]
    fn test_grant_is_minimum_of_both_buckets() {
        let shaper = shaper_with(5_000); // 500 bytes per tick globally
        shaper.register_torrent(hash(1), 10_000, 0); // 1000 per tick

        assert_eq!(shaper.request_upload(&hash(1), 800), 500);
        assert_eq!(shaper.request_upload(&hash(1), 800), 0);
    }

    #[test]
    fn test_global_cap_shared_between_torrents() {
        let shaper = shaper_with(10_000);
        shaper.register_torrent(hash(1), 0, 0);
        shaper.register_torrent(hash(2), 0, 0);

        let a = shaper.request_upload(&hash(1), 700);
        let b = shaper.request_upload(&hash(2), 700);
        assert_eq!(a + b, 1_000);
    }

    #[test]
    fn test_unknown_torrent_gets_nothing() {
        let shaper = shaper_with(0);
        assert_eq!(shaper.request_upload(&hash(9), 100), 0);
    }

    #[test]
    fn test_cap_change_applies_next_tick() {
        let shaper = shaper_with(0);
        shaper.register_torrent(hash(1), 10_000, 0);
        shaper.set_torrent_caps(&hash(1), 20_000, 0);

        assert_eq!(shaper.request_upload(&hash(1), 5_000), 1_000);
        shaper.tick(TICK);
        assert_eq!(shaper.request_upload(&hash(1), 5_000), 2_000);
    }

    #[test]
    fn test_measured_speed_from_window() {
        let shaper = shaper_with(0);
        shaper.register_torrent(hash(1), 0, 0);
        shaper.request_upload(&hash(1), 1_000);
        shaper.record_download(&hash(1), 500);
        shaper.tick(TICK);

        assert_eq!(
            shaper.measured(&hash(1)),
            SpeedReading {
                upload: 10_000,
                download: 5_000
            }
        );
        assert_eq!(shaper.global_measured().upload, 10_000);
    }

    #[test]
    fn test_reported_never_exceeds_cap() {
        let shaper = shaper_with(0);
        shaper.register_torrent(hash(1), 10_000, 0);
        for _ in 0..5 {
            shaper.request_upload(&hash(1), u64::MAX);
            shaper.tick(TICK);
        }

        let mut rng = SeededRandom::from_seed(11);
        for _ in 0..200 {
            let reading = shaper.reported(&hash(1), 1.0, &mut rng);
            assert!(reading.upload <= 10_000, "reported {}", reading.upload);
        }
    }

    #[test]
    fn test_uncapped_idle_reports_nominal_with_jitter() {
        let shaper = shaper_with(0);
        shaper.register_torrent(hash(1), 0, 0);

        // range draw 0.5 -> factor in the middle, then no burst
        let mut rng = ScriptedRandom::new([0.5, 0.99], 0.99);
        let reading = shaper.reported(&hash(1), 0.05, &mut rng);
        let nominal = ShaperConfig::default().nominal_upload_speed as f64;
        let expected = (nominal * (0.85 + 0.5 * (1.10 - 0.85))) as u64;
        assert_eq!(reading.upload, expected);
        assert_eq!(reading.download, 0);
    }
}
