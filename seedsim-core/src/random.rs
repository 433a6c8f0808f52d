//! Randomness sources for realism decisions.
//!
//! Every probabilistic choice (idle toggles, `have` emission, bitfield
//! patterns, speed jitter, peer ids) draws from a [`RandomSource`]. Each
//! torrent session owns one, so a seeded run is reproducible and tests can
//! swap in [`ScriptedRandom`] to force specific outcomes.

use std::collections::VecDeque;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Uniform random values in the shapes the simulation needs.
pub trait RandomSource: Send {
    /// Returns a value in `[0, 1)`.
    fn next_f64(&mut self) -> f64;

    /// Returns a uniformly distributed 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// Fills `dest` with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.next_u32() as u8;
        }
    }

    /// Returns true with the given probability.
    fn chance(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        self.next_f64() < probability
    }

    /// Returns a value in `[min, max)`; returns `min` for an empty range.
    fn range_f64(&mut self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        min + self.next_f64() * (max - min)
    }

    /// Returns an index in `[0, upper)`; `upper` must be non-zero.
    fn below(&mut self, upper: u32) -> u32 {
        debug_assert!(upper > 0);
        ((self.next_f64() * upper as f64) as u32).min(upper.saturating_sub(1))
    }
}

/// ChaCha8-backed source, reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: ChaCha8Rng,
    seed: u64,
}

impl SeededRandom {
    /// Creates a source from a fixed seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Creates a source seeded from the thread RNG.
    pub fn from_entropy() -> Self {
        Self::from_seed(rand::random())
    }

    /// Returns the seed this source started from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        // 53 random mantissa bits keep the result strictly below 1.0
        (self.rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

/// Deterministic stub that replays a fixed script of values.
///
/// When the script runs out the fallback value is returned forever.
#[derive(Debug, Clone)]
pub struct ScriptedRandom {
    script: VecDeque<f64>,
    fallback: f64,
}

impl ScriptedRandom {
    /// Creates a stub returning `values` in order, then `fallback`.
    pub fn new(values: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            script: values.into_iter().collect(),
            fallback,
        }
    }

    /// Stub that always returns the same value.
    pub fn constant(value: f64) -> Self {
        Self::new([], value)
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&mut self) -> f64 {
        self.script.pop_front().unwrap_or(self.fallback)
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_f64() * u32::MAX as f64) as u32
    }
}
