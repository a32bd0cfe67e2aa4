use std::time::{Duration, Instant};

use super::CongestionControl;

/// Always answers with the configured bitrate, for encoders that cannot
/// follow bitrate changes.
#[derive(Debug, Clone)]
pub struct FixedCongestionControl {
    bitrate: u32,
}

impl FixedCongestionControl {
    pub fn new(bitrate: u32) -> Self {
        FixedCongestionControl { bitrate }
    }
}

impl CongestionControl for FixedCongestionControl {
    fn update_rtt(&mut self, _rtt: Duration) {}

    fn update_target_playout_delay(&mut self, _delay: Duration) {}

    fn send_frame_to_transport(&mut self, _frame_id: u32, _frame_size_in_bits: u64, _when: Instant) {
    }

    fn ack_frame(&mut self, _frame_id: u32, _when: Instant) {}

    fn get_bitrate(
        &mut self,
        _now: Instant,
        _playout_time: Instant,
        _playout_delay: Duration,
        _soft_max_bitrate: u32,
    ) -> u32 {
        self.bitrate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_bitrate_ignores_feedback() {
        let now = Instant::now();
        let mut cc = FixedCongestionControl::new(64_000);
        cc.send_frame_to_transport(0, 10_000, now);
        cc.ack_frame(0, now + Duration::from_secs(3));
        cc.update_rtt(Duration::from_secs(1));
        assert_eq!(
            cc.get_bitrate(now, now, Duration::from_millis(100), 1),
            64_000
        );
    }
}
