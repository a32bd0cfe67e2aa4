use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// How an encoded frame depends on the frames before it.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Not known, e.g. for frames reassembled from the wire.
    #[default]
    Unknown,
    /// Decodable without any other frame; resets the decoder.
    Key,
    /// Decodable without any other frame, but does not reset the decoder.
    Independent,
    /// Depends on `referenced_frame_id`.
    Dependent,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Dependency::Unknown => "Unknown",
            Dependency::Key => "Key",
            Dependency::Independent => "Independent",
            Dependency::Dependent => "Dependent",
        };
        write!(f, "{s}")
    }
}

/// One unit of encoded media as produced by an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub dependency: Dependency,
    /// Monotonically increasing id, wraps at 32 bits.
    pub frame_id: u32,
    /// Equals `frame_id` for key and independent frames.
    pub referenced_frame_id: u32,
    pub rtp_timestamp: u32,
    /// Capture (or target playout) time on the local clock.
    pub reference_time: Instant,
    /// Non-zero to ask the receiver for a new target playout delay.
    pub new_playout_delay_ms: u16,
    pub data: Bytes,
}

impl EncodedFrame {
    pub fn new(
        dependency: Dependency,
        frame_id: u32,
        rtp_timestamp: u32,
        reference_time: Instant,
        data: Bytes,
    ) -> Self {
        let referenced_frame_id = match dependency {
            Dependency::Dependent => frame_id.wrapping_sub(1),
            _ => frame_id,
        };
        EncodedFrame {
            dependency,
            frame_id,
            referenced_frame_id,
            rtp_timestamp,
            reference_time,
            new_playout_delay_ms: 0,
            data,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.dependency == Dependency::Key
    }
}
