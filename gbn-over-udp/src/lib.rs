//! `gbn-over-udp`: a Go-Back-N reliable sender and an impairing UDP router.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  data   ┌──────────────────────┐  data   ┌──────────┐
//!  │  Sender  │────────▶│ Router: forward path │────────▶│ Receiver │
//!  │  (GBN)   │         │  drop/corrupt/delay/ │         │ (extern) │
//!  │          │         │  reorder/duplicate   │         │          │
//!  │          │  ACKs   ├──────────────────────┤  ACKs   │          │
//!  │          │◀────────│ Router: backward path│◀────────│          │
//!  └──────────┘         │  drop/delay/dup      │         └──────────┘
//!                       └──────────▲───────────┘
//!                                  │ forced rules
//!                            ControlPlane
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      data packet wire format and checksum
//! - [`ack`]         ACK message wire format
//! - [`seq`]         16-bit wire sequence numbers vs. unbounded sender ones
//! - [`gbn_sender`]  Go-Back-N window state machine
//! - [`timer`]       the single retransmission timer
//! - [`sender`]      async sender driving window, timer and socket
//! - [`rules`]       forced per-sequence-number impairments
//! - [`channel`]     forward-path fault model
//! - [`relay`]       backward-path fault model
//! - [`control`]     runtime rule changes and the operator console
//! - [`router`]      the two-socket router
//! - [`socket`]      async UDP socket abstraction

pub mod ack;
pub mod channel;
pub mod control;
pub mod gbn_sender;
pub mod packet;
pub mod relay;
pub mod router;
pub mod rules;
pub mod sender;
pub mod seq;
pub mod socket;
pub mod timer;
