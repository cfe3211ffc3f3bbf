//! Go-Back-N send-side state machine.
//!
//! [`SenderWindow`] maintains a sliding window of up to `N` in-flight packets.
//! Unlike stop-and-wait, multiple packets may be outstanding simultaneously.
//!
//! # Protocol contract
//!
//! - At most `window_size` packets may be in flight at once.
//! - ACKs are **cumulative**: `ack_num = K` means the receiver has accepted
//!   every sequence number up to and **including** `K`.
//! - On timeout, the caller retransmits **all** unacked packets from `base`
//!   onwards (go back to N).
//! - Sequence numbers count packets, not bytes.  They are `u64` here and are
//!   truncated to 16 bits on the wire; see [`crate::seq`] for how ACKs are
//!   mapped back.
//!
//! This module only manages state; all socket I/O and the timer itself are the
//! caller's responsibility.  Every method reports what the caller must do with
//! the retransmission timer.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::packet::{self, MAX_DATA_SIZE};
use crate::seq;

/// Default Go-Back-N window (N).
pub const WINDOW_SIZE: usize = 5;

/// Errors returned by window operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window full: {in_flight} of {window_size} slots in flight")]
    WindowFull { in_flight: usize, window_size: usize },
    #[error("chunk of {len} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { len: usize, max: usize },
}

/// Result of admitting one chunk into the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Sequence number assigned to the chunk.
    pub seq: u64,
    /// Encoded datagram, ready to hand to the socket.
    pub datagram: Vec<u8>,
    /// The window was empty before this admission: arm the timer.
    pub arm_timer: bool,
}

/// What an ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Stale, duplicate or out-of-range ACK.  Leave the timer alone.
    Ignored,
    /// `base` moved forward and packets remain in flight: restart the timer.
    Advanced { base: u64 },
    /// `base` caught up with `next_seq`: cancel the timer.
    Drained { base: u64 },
}

// ---------------------------------------------------------------------------
// SenderWindow
// ---------------------------------------------------------------------------

/// Go-Back-N send-side state for one transfer.
///
/// # Sequence-number layout
///
/// ```text
///    base             next_seq
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///  acked│ <── in flight ──▶│ <── unsent ──────▶
/// ```
#[derive(Debug)]
pub struct SenderWindow {
    /// Oldest unacknowledged sequence number (left window edge).
    base: u64,

    /// Sequence number to use for the next new packet.
    next_seq: u64,

    /// Maximum number of packets that may be in flight simultaneously (N).
    window_size: usize,

    /// Largest payload a single packet may carry.
    max_chunk: usize,

    /// Encoded in-flight packets keyed by sequence number.
    window: BTreeMap<u64, Vec<u8>>,
}

impl Default for SenderWindow {
    fn default() -> Self {
        Self::new(WINDOW_SIZE, MAX_DATA_SIZE)
    }
}

impl SenderWindow {
    /// Create an empty window starting at sequence number 0.
    ///
    /// # Panics
    ///
    /// Panics if `window_size` or `max_chunk` is zero.
    pub fn new(window_size: usize, max_chunk: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        assert!(max_chunk >= 1, "max_chunk must be at least 1");
        Self {
            base: 0,
            next_seq: 0,
            window_size,
            max_chunk,
            window: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of packets sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        (self.next_seq - self.base) as usize
    }

    /// `true` when nothing is awaiting acknowledgement.
    pub fn is_drained(&self) -> bool {
        self.base == self.next_seq
    }

    /// `true` while `next_seq < base + window_size`.
    pub fn can_admit(&self) -> bool {
        self.next_seq < self.base + self.window_size as u64
    }

    /// Split application data into chunks no larger than `max_chunk`.
    pub fn chunks<'a>(&self, data: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        data.chunks(self.max_chunk)
    }

    /// Place one chunk into the window and advance `next_seq`.
    ///
    /// The caller transmits [`Admission::datagram`] and arms the timer when
    /// [`Admission::arm_timer`] is set.
    pub fn admit(&mut self, chunk: &[u8]) -> Result<Admission, WindowError> {
        if chunk.len() > self.max_chunk {
            return Err(WindowError::ChunkTooLarge {
                len: chunk.len(),
                max: self.max_chunk,
            });
        }
        if !self.can_admit() {
            return Err(WindowError::WindowFull {
                in_flight: self.in_flight(),
                window_size: self.window_size,
            });
        }

        let seq = self.next_seq;
        let arm_timer = self.is_drained();
        let datagram = packet::encode(seq::wire(seq), chunk);
        self.window.insert(seq, datagram.clone());
        self.next_seq += 1;

        Ok(Admission {
            seq,
            datagram,
            arm_timer,
        })
    }

    /// Process a cumulative ACK as reported by the receiver.
    ///
    /// Applied only when it strictly advances `base`; everything else is
    /// [`AckOutcome::Ignored`].
    pub fn on_ack(&mut self, ack_num: i64) -> AckOutcome {
        let Some(acked) = seq::unwrap_ack(ack_num, self.next_seq) else {
            return AckOutcome::Ignored;
        };
        if acked < self.base {
            return AckOutcome::Ignored;
        }

        self.base = acked + 1;
        // Keep only entries at or above the new base.
        self.window = self.window.split_off(&self.base);

        if self.is_drained() {
            AckOutcome::Drained { base: self.base }
        } else {
            AckOutcome::Advanced { base: self.base }
        }
    }

    /// Every buffered packet in `[base, next_seq)`, ascending.
    ///
    /// The caller retransmits them in order and unconditionally rearms the
    /// timer.
    pub fn on_timeout(&self) -> Vec<Vec<u8>> {
        self.window
            .range(self.base..self.next_seq)
            .map(|(_, datagram)| datagram.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
