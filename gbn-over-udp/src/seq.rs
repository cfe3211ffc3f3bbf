//! Sequence-number space helpers.
//!
//! The sender counts packets with an unbounded `u64`; the wire carries only
//! the low 16 bits.  ACK numbers coming back from the receiver are therefore
//! ambiguous modulo 2^16 and have to be mapped back into the sender's space.
//!
//! # Wraparound rule
//!
//! An ACK number refers to the **newest** already-sent sequence number with
//! the same low 16 bits.  With a window far smaller than 2^15 every
//! legitimate (possibly stale) ACK maps to the packet it was generated for.
//! An ACK for a sequence number that has not been sent yet maps 65536
//! positions back and is treated as stale by the window.

/// Low 16 bits of `seq`, as carried in the packet header.
#[inline]
pub fn wire(seq: u64) -> u16 {
    seq as u16
}

/// Map a receiver ACK number back into the sender's sequence space.
///
/// Returns `None` when the ACK acknowledges nothing at all: a negative value
/// (the receiver's "nothing yet"), nothing sent so far, or no candidate at or
/// above zero.
pub fn unwrap_ack(ack_num: i64, next_seq: u64) -> Option<u64> {
    if ack_num < 0 || next_seq == 0 {
        return None;
    }
    let newest = next_seq - 1;
    let diff = u64::from(wire(newest).wrapping_sub(ack_num as u16));
    newest.checked_sub(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_truncates() {
        assert_eq!(wire(0), 0);
        assert_eq!(wire(65_535), 65_535);
        assert_eq!(wire(65_536), 0);
        assert_eq!(wire(65_537 + 4), 5);
    }

    #[test]
    fn ack_within_sent_range_maps_to_itself() {
        assert_eq!(unwrap_ack(3, 4), Some(3));
        assert_eq!(unwrap_ack(0, 4), Some(0));
    }

    #[test]
    fn negative_or_premature_acks_map_to_nothing() {
        assert_eq!(unwrap_ack(-1, 4), None);
        assert_eq!(unwrap_ack(0, 0), None);
        // Acknowledges seq 5, but only 0..4 were sent.
        assert_eq!(unwrap_ack(5, 4), None);
    }

    #[test]
    fn ack_after_wire_wrap() {
        let next = 65_536 + 10;
        // Receiver echoes the 16-bit value of seq 65_540.
        assert_eq!(unwrap_ack(4, next), Some(65_540));
        // Stale ACK from just before the wrap.
        assert_eq!(unwrap_ack(65_534, next), Some(65_534));
    }

    #[test]
    fn receiver_with_wide_counter_is_masked() {
        assert_eq!(unwrap_ack(70_000, 70_001), Some(70_000));
    }
}
