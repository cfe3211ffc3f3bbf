//! Backward-path ACK relay.
//!
//! ACKs travelling from the receiver back to the sender see a simpler fault
//! model than data: they may be dropped, delayed or duplicated, but never
//! corrupted or reordered.  There are no forced rules on this path.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{dup_delay, exponential};

/// Probabilistic knobs of the backward path.
#[derive(Debug, Clone)]
pub struct BackwardConfig {
    pub p_drop: f64,
    pub p_dup: f64,
    pub delay_mean: Duration,
}

impl Default for BackwardConfig {
    fn default() -> Self {
        Self {
            p_drop: 0.02,
            p_dup: 0.03,
            delay_mean: Duration::from_millis(10),
        }
    }
}

impl BackwardConfig {
    pub fn transparent() -> Self {
        Self {
            p_drop: 0.0,
            p_dup: 0.0,
            delay_mean: Duration::ZERO,
        }
    }
}

/// Counters for the backward path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardStats {
    pub received: u64,
    pub dropped: u64,
    pub delayed: u64,
    pub forwarded: u64,
    pub duplicated: u64,
    /// ACKs discarded because no sender address was known yet.
    pub unroutable: u64,
}

/// What to do with one ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Drop,
    Forward {
        delay: Duration,
        /// Gap before a duplicate, if one is due.
        duplicate: Option<Duration>,
    },
}

/// Decision engine for the backward path.
#[derive(Debug)]
pub struct AckRelay {
    config: BackwardConfig,
    rng: StdRng,
}

impl AckRelay {
    pub fn new(config: BackwardConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }

    pub fn decide(&mut self) -> Relay {
        if self.config.p_drop > 0.0 && self.rng.random::<f64>() < self.config.p_drop {
            return Relay::Drop;
        }
        let delay = exponential(&mut self.rng, self.config.delay_mean);
        let duplicate = (self.config.p_dup > 0.0 && self.rng.random::<f64>() < self.config.p_dup)
            .then(|| dup_delay(&mut self.rng));
        Relay::Forward { delay, duplicate }
    }
}

/// Printable preview of an ACK datagram for the log.
pub(crate) fn preview(datagram: &[u8]) -> String {
    let text = String::from_utf8_lossy(datagram);
    text.trim().chars().take(60).collect()
}
