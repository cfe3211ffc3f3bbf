//! Forward-path channel emulator.
//!
//! Real networks drop, reorder, duplicate and corrupt packets.  The router
//! runs every datagram travelling from the sender to the receiver through a
//! [`ChannelEmulator`], which applies a fault model in a fixed order:
//!
//! | Step      | Effect                                                    |
//! |-----------|-----------------------------------------------------------|
//! | Drop      | Discard the datagram.                                     |
//! | Corrupt   | Scramble the payload bytes (header left intact).          |
//! | Delay     | Hold the datagram for an exponentially distributed time.  |
//! | Reorder   | Park the datagram in the reorder buffer, release an old one. |
//! | Duplicate | Send the same bytes a second time shortly after.          |
//!
//! Every step first consults the [`ForcedRules`] for the datagram's sequence
//! number; a forced hit replaces the probabilistic roll for that step.
//! Datagrams shorter than the 4-byte header have no sequence number, so they
//! skip forced rules and corruption but are still subject to the random
//! drop, delay, reorder and duplicate rolls.
//!
//! The emulator itself is synchronous and owns a seeded RNG; the async
//! forward loop in [`crate::router`] drives it and performs the sleeps and
//! socket sends.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::packet::{self, HEADER_LEN};
use crate::rules::{ForcedRules, ImpairmentKind};

/// How a corrupted datagram's payload is scrambled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CorruptionMode {
    /// Random permutation of the payload bytes.
    #[default]
    Shuffle,
    /// Every byte XORed with one random non-zero key.
    Xor,
    /// One to three single-bit flips.
    Bitflip,
}

impl fmt::Display for CorruptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CorruptionMode::Shuffle => "shuffle",
            CorruptionMode::Xor => "xor",
            CorruptionMode::Bitflip => "bitflip",
        })
    }
}

/// Probabilistic knobs of the forward path.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub p_drop: f64,
    pub p_corrupt: f64,
    pub p_dup: f64,
    /// Only used when `reorder_window > 0`.
    pub p_reorder: f64,
    /// Mean of the exponential per-datagram delay; zero disables it.
    pub delay_mean: Duration,
    pub corrupt_mode: CorruptionMode,
    /// Capacity of the reorder buffer.
    pub reorder_window: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            p_drop: 0.05,
            p_corrupt: 0.20,
            p_dup: 0.05,
            p_reorder: 0.20,
            delay_mean: Duration::from_millis(20),
            corrupt_mode: CorruptionMode::Shuffle,
            reorder_window: 3,
        }
    }
}

impl ForwardConfig {
    /// A channel that forwards everything untouched.
    pub fn transparent() -> Self {
        Self {
            p_drop: 0.0,
            p_corrupt: 0.0,
            p_dup: 0.0,
            p_reorder: 0.0,
            delay_mean: Duration::ZERO,
            corrupt_mode: CorruptionMode::Shuffle,
            reorder_window: 0,
        }
    }
}

/// Counters for the forward path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub received: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub delayed: u64,
    pub held: u64,
    pub released: u64,
    pub forwarded: u64,
    pub duplicated: u64,
}

/// State shared between the forward loop and the control plane.
///
/// The forced rules and the reorder buffer sit behind one mutex so rule
/// changes never race with the forward pipeline.
#[derive(Debug, Default)]
pub struct ForwardState {
    pub rules: ForcedRules,
    pub reorder: VecDeque<Vec<u8>>,
    pub stats: ForwardStats,
}

impl ForwardState {
    pub fn new(rules: ForcedRules) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }
}

/// Outcome of the drop and corrupt steps.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingress {
    Dropped,
    Pass(Vec<u8>),
}

/// Outcome of the reorder step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Staged {
    /// The current datagram, unless it was parked in the reorder buffer.
    pub send_now: Option<Vec<u8>>,
    /// An older datagram released from the reorder buffer, sent first.
    pub released: Option<Vec<u8>>,
}

/// Decision engine for the forward path.
#[derive(Debug)]
pub struct ChannelEmulator {
    config: ForwardConfig,
    rng: StdRng,
}

impl ChannelEmulator {
    /// `seed` makes every random decision reproducible.
    pub fn new(config: ForwardConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random::<f64>() < p
    }

    /// Forced hit if `seq` is known and in the rule set, else a random roll.
    fn decide(
        &mut self,
        rules: &mut ForcedRules,
        kind: ImpairmentKind,
        seq: Option<u16>,
        p: f64,
    ) -> bool {
        match seq {
            Some(seq) if rules.take(kind, seq) => true,
            _ => self.roll(p),
        }
    }

    /// Steps 1 and 2: drop, then corrupt.
    pub fn ingress(&mut self, datagram: Vec<u8>, state: &mut ForwardState) -> Ingress {
        let seq = packet::peek_seq(&datagram);
        state.stats.received += 1;

        let p_drop = self.config.p_drop;
        if self.decide(&mut state.rules, ImpairmentKind::Drop, seq, p_drop) {
            log::info!("[router→] DROP seq={}", show_seq(seq));
            state.stats.dropped += 1;
            return Ingress::Dropped;
        }

        let p_corrupt = self.config.p_corrupt;
        if seq.is_some() && self.decide(&mut state.rules, ImpairmentKind::Corrupt, seq, p_corrupt) {
            let mode = self.config.corrupt_mode;
            let corrupted = corrupt(&datagram, mode, &mut self.rng);
            log::info!(
                "[router→] CORRUPT seq={} mode={mode} (len={})",
                show_seq(seq),
                datagram.len() - HEADER_LEN
            );
            state.stats.corrupted += 1;
            return Ingress::Pass(corrupted);
        }

        Ingress::Pass(datagram)
    }

    /// Step 3: how long to hold the datagram before moving on.
    pub fn delay(&mut self) -> Duration {
        exponential(&mut self.rng, self.config.delay_mean)
    }

    /// Step 4: maybe park the datagram, maybe release the oldest parked one.
    pub fn stage(&mut self, datagram: Vec<u8>, state: &mut ForwardState) -> Staged {
        let seq = packet::peek_seq(&datagram);
        let window = self.config.reorder_window;
        let mut staged = Staged::default();

        let forced = matches!(seq, Some(seq) if state.rules.take(ImpairmentKind::Reorder, seq));
        let p_reorder = self.config.p_reorder;
        if forced || (window > 0 && self.roll(p_reorder)) {
            state.reorder.push_back(datagram);
            state.stats.held += 1;
            log::info!(
                "[router→] HOLD seq={} (buffer={})",
                show_seq(seq),
                state.reorder.len()
            );
        } else {
            staged.send_now = Some(datagram);
        }

        if !state.reorder.is_empty() && (state.reorder.len() >= window || self.rng.random_bool(0.5)) {
            staged.released = state.reorder.pop_front();
            state.stats.released += 1;
            log::info!(
                "[router→] RELEASE held datagram (buffer={})",
                state.reorder.len()
            );
        }
        staged
    }

    /// Step 5: after sending, the delay before a duplicate, if one is due.
    pub fn duplicate(&mut self, seq: Option<u16>, state: &mut ForwardState) -> Option<Duration> {
        let p_dup = self.config.p_dup;
        if self.decide(&mut state.rules, ImpairmentKind::Duplicate, seq, p_dup) {
            state.stats.duplicated += 1;
            Some(dup_delay(&mut self.rng))
        } else {
            None
        }
    }
}

/// Scramble everything after the header; `datagram` itself is left untouched.
///
/// Datagrams without a payload come back unchanged.
pub fn corrupt<R: Rng + ?Sized>(datagram: &[u8], mode: CorruptionMode, rng: &mut R) -> Vec<u8> {
    let mut out = datagram.to_vec();
    if out.len() <= HEADER_LEN {
        return out;
    }
    let payload = &mut out[HEADER_LEN..];
    match mode {
        CorruptionMode::Shuffle => payload.shuffle(rng),
        CorruptionMode::Xor => {
            let key: u8 = rng.random_range(1..=255);
            for b in payload.iter_mut() {
                *b ^= key;
            }
        }
        CorruptionMode::Bitflip => {
            let flips = rng.random_range(1..=3);
            for _ in 0..flips {
                let i = rng.random_range(0..payload.len());
                payload[i] ^= 1 << rng.random_range(0..8);
            }
        }
    }
    out
}

/// Sample an exponential delay with the given mean.
pub(crate) fn exponential<R: Rng + ?Sized>(rng: &mut R, mean: Duration) -> Duration {
    if mean.is_zero() {
        return Duration::ZERO;
    }
    let u: f64 = rng.random();
    let scale = -(1.0 - u).ln();
    if scale > 0.0 {
        mean.mul_f64(scale)
    } else {
        Duration::ZERO
    }
}

/// Gap between a datagram and its duplicate: 10 to 60 ms.
pub(crate) fn dup_delay<R: Rng + ?Sized>(rng: &mut R) -> Duration {
    Duration::from_millis(10) + Duration::from_secs_f64(rng.random::<f64>() * 0.05)
}

pub(crate) fn show_seq(seq: Option<u16>) -> String {
    seq.map_or_else(|| "-".to_string(), |s| s.to_string())
}
