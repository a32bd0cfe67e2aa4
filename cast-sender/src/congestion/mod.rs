//! Bitrate selection for the encoder.

mod adaptive;
mod fixed;

pub use adaptive::AdaptiveCongestionControl;
pub use fixed::FixedCongestionControl;

use std::time::{Duration, Instant};

/// Picks the bitrate the encoder should use for its next frame from how
/// fast earlier frames were acknowledged.
pub trait CongestionControl {
    /// Feeds a new round trip time sample.
    fn update_rtt(&mut self, rtt: Duration);

    /// The playout delay changed, which changes how many frames may be in
    /// flight.
    fn update_target_playout_delay(&mut self, delay: Duration);

    /// A frame of `frame_size_in_bits` was handed to the transport at `when`.
    fn send_frame_to_transport(&mut self, frame_id: u32, frame_size_in_bits: u64, when: Instant);

    /// Every frame up to `frame_id` was acknowledged at `when`.
    fn ack_frame(&mut self, frame_id: u32, when: Instant);

    /// Bitrate in bits per second for a frame that must play out at
    /// `playout_time`, capped by `soft_max_bitrate`.
    fn get_bitrate(
        &mut self,
        now: Instant,
        playout_time: Instant,
        playout_delay: Duration,
        soft_max_bitrate: u32,
    ) -> u32;
}
