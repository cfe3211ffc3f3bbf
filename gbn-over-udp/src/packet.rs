//! Wire-format definitions for data packets.
//!
//! Every datagram the sender emits is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (sequence number, checksum, payload).
//! - Serialising a sequence number and payload into a datagram.
//! - Deserialising a raw byte slice back into a [`Packet`], refusing input too
//!   short to hold a header.
//! - The one's-complement checksum shared with the receiver.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |            Checksum           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Payload (0..=50 bytes)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 4 bytes.
//!
//! The checksum covers `seq || payload` with the checksum field itself left
//! out.  Because the field sits on a 16-bit boundary, a receiver can verify a
//! packet by summing the whole datagram: an intact packet folds to `0xFFFF`
//! (see [`verify`]).

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload carried by one packet.
pub const MAX_DATA_SIZE: usize = 50;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_CHECKSUM: usize = 2;

/// A decoded data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 16-bit wire sequence number.
    pub seq: u16,
    /// Checksum as carried on the wire.
    ///
    /// [`Packet::new`] computes it; [`Packet::decode`] copies it verbatim and
    /// does **not** validate it.
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet for `seq` carrying `payload`, computing its checksum.
    pub fn new(seq: u16, payload: Vec<u8>) -> Self {
        let checksum = packet_checksum(seq, &payload);
        Self {
            seq,
            checksum,
            payload,
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The stored `checksum` is written unchanged, so a packet decoded from a
    /// corrupted datagram re-encodes to the same corrupted bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`PacketError::MalformedPacket`] if `buf` is shorter than
    /// [`HEADER_LEN`].  Checksum validity is the receiver's concern; use
    /// [`Packet::is_intact`] or [`verify`] to check it.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::MalformedPacket { len: buf.len() });
        }
        Ok(Self {
            seq: u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]),
            checksum: u16::from_be_bytes([buf[OFF_CHECKSUM], buf[OFF_CHECKSUM + 1]]),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// `true` when the carried checksum matches `seq || payload`.
    pub fn is_intact(&self) -> bool {
        self.checksum == packet_checksum(self.seq, &self.payload)
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("malformed packet: {len} byte(s), header needs {HEADER_LEN}")]
    MalformedPacket { len: usize },
}

/// Encode `seq` and `payload` straight into wire bytes.
pub fn encode(seq: u16, payload: &[u8]) -> Vec<u8> {
    Packet::new(seq, payload.to_vec()).encode()
}

/// Decode a datagram; see [`Packet::decode`].
pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
    Packet::decode(buf)
}

/// Sequence number of `buf` when a full header is present.
///
/// Datagrams shorter than [`HEADER_LEN`] are not interpreted at all, even if
/// they hold two bytes that could pass for a sequence number.
pub fn peek_seq(buf: &[u8]) -> Option<u16> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]))
}

/// Compute the 16-bit one's-complement checksum over `data`.
///
/// Odd-length input is padded with a single zero byte on the right.
pub fn checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// `true` when a full datagram (checksum field populated) folds to `0xFFFF`.
pub fn verify(datagram: &[u8]) -> bool {
    datagram.len() >= HEADER_LEN && ones_complement_sum(datagram) == 0xFFFF
}

/// Checksum of `seq || payload`, i.e. the packet with its checksum field
/// left out.
fn packet_checksum(seq: u16, payload: &[u8]) -> u16 {
    let mut scratch = Vec::with_capacity(2 + payload.len());
    scratch.extend_from_slice(&seq.to_be_bytes());
    scratch.extend_from_slice(payload);
    checksum(&scratch)
}

/// Sum consecutive 16-bit big-endian words with end-around carry.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);

    for word in &mut words {
        sum = fold(sum + u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = words.remainder() {
        sum = fold(sum + (u32::from(*last) << 8));
    }

    sum as u16
}

/// End-around carry; keeps the running sum within 16 bits.
fn fold(sum: u32) -> u32 {
    (sum & 0xffff) + (sum >> 16)
}
