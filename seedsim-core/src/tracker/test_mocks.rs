//! Scripted tracker client for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::{AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError};
use crate::torrent::InfoHash;

/// Tracker client that replays queued results and records every request.
///
/// Once the queue is empty it answers with the default response.
pub struct MockTrackerClient {
    default_response: AnnounceResponse,
    queued: Mutex<VecDeque<Result<AnnounceResponse, TrackerError>>>,
    announces: Mutex<Vec<(String, AnnounceRequest)>>,
    scrapes: Mutex<Vec<String>>,
    scrape_stats: ScrapeStats,
    delay: Mutex<Duration>,
}

impl MockTrackerClient {
    pub fn new(default_response: AnnounceResponse) -> Self {
        Self {
            default_response,
            queued: Mutex::new(VecDeque::new()),
            announces: Mutex::new(Vec::new()),
            scrapes: Mutex::new(Vec::new()),
            scrape_stats: ScrapeStats {
                complete: 7,
                downloaded: 70,
                incomplete: 3,
            },
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Default response with the given interval and no peers.
    pub fn with_interval(interval: u32) -> Self {
        Self::new(AnnounceResponse {
            interval,
            ..AnnounceResponse::default()
        })
    }

    /// Queues a result for the next announce.
    pub fn push_result(&self, result: Result<AnnounceResponse, TrackerError>) {
        self.queued.lock().push_back(result);
    }

    /// Delays every answer, simulating a slow tracker.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn announce_count(&self) -> usize {
        self.announces.lock().len()
    }

    pub fn scrape_count(&self) -> usize {
        self.scrapes.lock().len()
    }

    /// Every announce seen so far, oldest first.
    pub fn requests(&self) -> Vec<(String, AnnounceRequest)> {
        self.announces.lock().clone()
    }
}

#[async_trait]
impl TrackerClient for MockTrackerClient {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.announces
            .lock()
            .push((url.to_string(), request.clone()));
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queued.lock().pop_front();
        queued.unwrap_or_else(|| Ok(self.default_response.clone()))
    }

    async fn scrape(&self, url: &str, _info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        self.scrapes.lock().push(url.to_string());
        Ok(self.scrape_stats)
    }
}
