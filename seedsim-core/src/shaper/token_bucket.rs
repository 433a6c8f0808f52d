//! Tick-driven token bucket.
//!
//! Tokens are bytes. Refill happens only when the scheduler tick calls
//! [`TokenBucket::refill`], so a bucket never holds more than one tick's
//! allotment and consumption over any window of whole ticks stays within
//! `rate * window`.

use std::time::Duration;

/// Byte budget for one direction of one scope (torrent or global).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    /// Rate taking effect at the next refill
    pending_rate: Option<u64>,
    capacity: f64,
    /// Fractional so that rates below one byte per tick still accumulate
    tokens: f64,
}

impl TokenBucket {
    /// Creates a full bucket holding one tick's allotment at `rate`.
    pub fn new(rate: u64, tick: Duration) -> Self {
        let capacity = Self::allotment(rate, tick);
        Self {
            rate,
            pending_rate: None,
            capacity,
            tokens: capacity,
        }
    }

    fn allotment(rate: u64, tick: Duration) -> f64 {
        if rate == 0 {
            return 0.0;
        }
        (rate as f64 * tick.as_secs_f64()).max(1.0)
    }

    /// True when no cap is configured.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Currently enforced rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Stages a new rate; it applies at the next refill.
    pub fn set_rate(&mut self, rate: u64) {
        self.pending_rate = Some(rate);
    }

    /// Adds tokens for `elapsed`, capped at one allotment of `tick`.
    pub fn refill(&mut self, elapsed: Duration, tick: Duration) {
        if let Some(rate) = self.pending_rate.take() {
            self.rate = rate;
        }
        self.capacity = Self::allotment(self.rate, tick);
        if self.is_unlimited() {
            self.tokens = 0.0;
            return;
        }

        let added = self.rate as f64 * elapsed.as_secs_f64();
        self.tokens = (self.tokens + added).min(self.capacity);
    }

    /// Tokens available right now; `u64::MAX` when unlimited.
    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.tokens as u64
        }
    }

    /// Removes up to `requested` tokens, returning how many were taken.
    pub fn consume(&mut self, requested: u64) -> u64 {
        if self.is_unlimited() {
            return requested;
        }
        let consumed = requested.min(self.tokens as u64);
        self.tokens -= consumed as f64;
        consumed
    }
}
