//! Comparison and widening of counters that wrap around on the wire.
//!
//! Frame ids are 32-bit in memory but travel as their low 8 bits, packet ids
//! and sequence numbers are 16-bit and RTP timestamps are 32-bit. All of them
//! are compared modulo their width: `a` is newer than `b` when `a - b`,
//! computed with wrapping arithmetic, lies in the lower half of the range.

/// An unsigned counter compared with modular arithmetic.
pub trait WrapCounter: Copy + Eq {
    /// Width of the counter in bits.
    const BITS: u32;

    fn to_u32(self) -> u32;

    fn mask() -> u32 {
        if Self::BITS >= 32 {
            u32::MAX
        } else {
            (1u32 << Self::BITS) - 1
        }
    }

    /// `self - other` modulo the counter width.
    fn wrapping_distance(self, other: Self) -> u32 {
        self.to_u32().wrapping_sub(other.to_u32()) & Self::mask()
    }
}

macro_rules! impl_wrap_counter {
    ($($t:ty),*) => {
        $(
            impl WrapCounter for $t {
                const BITS: u32 = <$t>::BITS;

                fn to_u32(self) -> u32 {
                    self as u32
                }
            }
        )*
    };
}

impl_wrap_counter!(u8, u16, u32);

/// Returns true if `a` comes strictly after `b`.
pub fn is_newer<T: WrapCounter>(a: T, b: T) -> bool {
    a != b && a.wrapping_distance(b) < (1u32 << (T::BITS - 1))
}

/// Returns true if `a` comes strictly before `b`.
pub fn is_older<T: WrapCounter>(a: T, b: T) -> bool {
    is_newer(b, a)
}

/// Returns true if `a` is `b` or comes after it.
pub fn is_newer_or_equal<T: WrapCounter>(a: T, b: T) -> bool {
    a == b || is_newer(a, b)
}

pub fn is_newer_frame_id(frame_id: u32, prev_frame_id: u32) -> bool {
    is_newer(frame_id, prev_frame_id)
}

pub fn is_older_frame_id(frame_id: u32, prev_frame_id: u32) -> bool {
    is_older(frame_id, prev_frame_id)
}

pub fn is_newer_packet_id(packet_id: u16, prev_packet_id: u16) -> bool {
    is_newer(packet_id, prev_packet_id)
}

pub fn is_newer_rtp_timestamp(timestamp: u32, prev_timestamp: u32) -> bool {
    is_newer(timestamp, prev_timestamp)
}

/// Widens a truncated counter to the 32-bit value closest to `reference`.
///
/// The candidate shares the high bits of `reference`; it moves one period
/// down when it lands at or above half a period ahead, and one period up when
/// it lands more than half a period behind.
pub fn expand_truncated<T: WrapCounter>(truncated: T, reference: u32) -> u32 {
    if T::BITS >= 32 {
        return truncated.to_u32();
    }
    let period = 1u32 << T::BITS;
    let half = (period / 2) as i64;
    let candidate = (reference & !T::mask()) | truncated.to_u32();
    let delta = candidate.wrapping_sub(reference) as i32 as i64;
    if delta >= half {
        candidate.wrapping_sub(period)
    } else if delta < -half {
        candidate.wrapping_add(period)
    } else {
        candidate
    }
}

/// Tracks the largest frame id seen so far and maps 8-bit wire frame ids
/// onto the 32-bit id space around it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameIdWrapHelper {
    largest_frame_id_seen: u32,
}

impl FrameIdWrapHelper {
    /// `start_frame_id` is the id just before the first one expected.
    pub fn new(start_frame_id: u32) -> Self {
        FrameIdWrapHelper {
            largest_frame_id_seen: start_frame_id,
        }
    }

    /// Maps without remembering the result.
    pub fn peek(&self, over_the_wire_frame_id: u8) -> u32 {
        expand_truncated(over_the_wire_frame_id, self.largest_frame_id_seen)
    }

    pub fn map_to_32bits_frame_id(&mut self, over_the_wire_frame_id: u8) -> u32 {
        let frame_id = self.peek(over_the_wire_frame_id);
        self.observe(frame_id);
        frame_id
    }

    /// Records `frame_id` as seen, advancing the reference if it is newer.
    pub fn observe(&mut self, frame_id: u32) {
        if is_newer_frame_id(frame_id, self.largest_frame_id_seen) {
            self.largest_frame_id_seen = frame_id;
        }
    }

    pub fn largest_frame_id_seen(&self) -> u32 {
        self.largest_frame_id_seen
    }
}

impl Default for FrameIdWrapHelper {
    fn default() -> Self {
        FrameIdWrapHelper::new(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer_frame_id() {
        for f in [0u32, 1, 0x7fffffff, 0x80000000, 0xfffffffe, u32::MAX] {
            assert!(!is_newer_frame_id(f, f));
            for d in [1u32, 2, 127, 128, 255, 256, 0x7ffffffe, 0x7fffffff] {
                assert!(
                    is_newer_frame_id(f.wrapping_add(d), f),
                    "{f} + {d} should be newer"
                );
                assert!(
                    !is_newer_frame_id(f.wrapping_sub(d), f),
                    "{f} - {d} should not be newer"
                );
                assert!(is_older_frame_id(f.wrapping_sub(d), f));
            }
        }
    }

    #[test]
    fn test_is_newer_packet_id() {
        assert!(!is_newer_packet_id(7, 7));
        assert!(is_newer_packet_id(0, 0xffff));
        assert!(is_newer_packet_id(0x7fff, 0));
        assert!(!is_newer_packet_id(0x8000, 0));
        assert!(!is_newer_packet_id(0xffff, 0));
    }

    #[test]
    fn test_is_newer_8bit() {
        assert!(is_newer(0u8, 255u8));
        assert!(is_newer(127u8, 0u8));
        assert!(!is_newer(128u8, 0u8));
        assert!(is_newer_or_equal(5u8, 5u8));
    }

    #[test]
    fn test_expand_truncated() {
        assert_eq!(expand_truncated(0x05u8, 0x0000_0100), 0x0000_0105);
        assert_eq!(expand_truncated(0xfeu8, 0x0000_0102), 0x0000_00fe);
        assert_eq!(expand_truncated(0x02u8, 0x0000_01fe), 0x0000_0202);
        assert_eq!(expand_truncated(0xffu8, 0), u32::MAX);
        assert_eq!(expand_truncated(0x0001u16, 0x0001_fff0), 0x0002_0001);
        assert_eq!(expand_truncated(0xdead_beefu32, 3), 0xdead_beef);
    }

    #[test]
    fn test_frame_id_wrap_helper() {
        let mut helper = FrameIdWrapHelper::default();
        assert_eq!(helper.map_to_32bits_frame_id(0), 0);

        let mut expected = 0u32;
        for _ in 0..1000 {
            expected += 1;
            assert_eq!(helper.map_to_32bits_frame_id(expected as u8), expected);
        }
        assert_eq!(helper.largest_frame_id_seen(), 1000);

        // an older id does not move the reference back
        assert_eq!(helper.map_to_32bits_frame_id((1000 - 10) as u8), 990);
        assert_eq!(helper.largest_frame_id_seen(), 1000);
    }
}
