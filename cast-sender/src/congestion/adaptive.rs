use log::{trace, warn};
use rtp::packet_storage::MAX_UNACKED_FRAMES;
use rtp::wrap::is_newer_frame_id;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::CongestionControl;

/// Keep the virtual network buffer this empty.
const TARGET_EMPTY_BUFFER_FRACTION: f64 = 0.9;
/// Frames of history kept on top of those that may be in flight.
const HISTORY_SIZE: usize = 100;

#[derive(Debug, Default, Copy, Clone)]
struct FrameStats {
    enqueue_time: Option<Instant>,
    ack_time: Option<Instant>,
    frame_size_in_bits: u64,
}

/// Idle time between the ACK of `a` and the enqueue of the following `b`.
fn dead_time(a: &FrameStats, b: &FrameStats) -> Duration {
    match (a.ack_time, b.enqueue_time) {
        (Some(ack), Some(enqueue)) => enqueue.saturating_duration_since(ack),
        _ => Duration::ZERO,
    }
}

/// Estimates the throughput the network sustained from when recent frames
/// were enqueued and acknowledged, and scales it by how much room the
/// playout buffer has left.
pub struct AdaptiveCongestionControl {
    max_bitrate_configured: u32,
    min_bitrate_configured: u32,
    max_frame_rate: f64,

    /// Stats of the newest frames; the back entry belongs to
    /// `last_frame_stats`.
    frame_stats: VecDeque<FrameStats>,
    last_frame_stats: u32,
    last_acked_frame: u32,
    last_enqueued_frame: u32,

    history_size: usize,
    acked_bits_in_history: u64,
    dead_time_in_history: Duration,

    rtt: Duration,
}

impl AdaptiveCongestionControl {
    pub fn new(
        now: Instant,
        max_bitrate_configured: u32,
        min_bitrate_configured: u32,
        max_frame_rate: f64,
    ) -> Self {
        // Two acknowledged placeholder frames anchor the history at `now`.
        let anchor = FrameStats {
            enqueue_time: Some(now),
            ack_time: Some(now),
            frame_size_in_bits: 0,
        };
        AdaptiveCongestionControl {
            max_bitrate_configured,
            min_bitrate_configured,
            max_frame_rate,

            frame_stats: VecDeque::from([anchor, anchor]),
            last_frame_stats: u32::MAX,
            last_acked_frame: u32::MAX,
            last_enqueued_frame: u32::MAX,

            history_size: HISTORY_SIZE,
            acked_bits_in_history: 0,
            dead_time_in_history: Duration::ZERO,

            rtt: Duration::ZERO,
        }
    }

    /// Throughput in bits per second over the history, not counting idle
    /// gaps.
    pub fn calculate_safe_bitrate(&mut self) -> f64 {
        if self.acked_bits_in_history == 0 {
            return self.min_bitrate_configured as f64;
        }
        let last_ack_time = self
            .frame_stats_index(self.last_acked_frame)
            .and_then(|index| self.frame_stats[index].ack_time);
        let first_enqueue_time = self.frame_stats.front().and_then(|stats| stats.enqueue_time);
        let (Some(last_ack_time), Some(first_enqueue_time)) = (last_ack_time, first_enqueue_time)
        else {
            return self.min_bitrate_configured as f64;
        };

        let transmit_time = last_ack_time
            .saturating_duration_since(first_enqueue_time)
            .saturating_sub(self.dead_time_in_history)
            .as_secs_f64();
        self.acked_bits_in_history as f64 / transmit_time.max(1e-3)
    }

    fn history_size(&self) -> usize {
        self.history_size
    }

    /// Index of `frame_id` in `frame_stats`, growing the history for frames
    /// newer than any seen so far.
    fn frame_stats_index(&mut self, frame_id: u32) -> Option<usize> {
        let mut offset = frame_id.wrapping_sub(self.last_frame_stats) as i32 as i64;
        if offset >= HISTORY_SIZE as i64 {
            warn!(
                "frame {} is too far ahead of frame {}",
                frame_id, self.last_frame_stats
            );
            return None;
        }
        if offset > 0 {
            for _ in 0..offset {
                self.frame_stats.push_back(FrameStats::default());
            }
            self.last_frame_stats = frame_id;
            offset = 0;
        }
        self.prune_frame_stats();

        let index = offset + self.frame_stats.len() as i64 - 1;
        if index < 0 {
            None
        } else {
            Some(index as usize)
        }
    }

    fn prune_frame_stats(&mut self) {
        while self.frame_stats.len() > self.history_size() && self.frame_stats.len() > 1 {
            let Some(front) = self.frame_stats.pop_front() else {
                break;
            };
            if front.ack_time.is_some() {
                self.acked_bits_in_history = self
                    .acked_bits_in_history
                    .saturating_sub(front.frame_size_in_bits);
            }
            if let Some(next) = self.frame_stats.front()
                && next.ack_time.is_some()
            {
                self.dead_time_in_history = self
                    .dead_time_in_history
                    .saturating_sub(dead_time(&front, next));
            }
        }
    }

    fn estimated_sending_time(&mut self, now: Instant, frame_id: u32, safe_bitrate: f64) -> Instant {
        let half_rtt = self.rtt / 2;
        let mut estimated_sending_time: Option<Instant> = None;

        let mut f = self.last_acked_frame;
        while is_newer_frame_id(frame_id, f) {
            if let Some(index) = self.frame_stats_index(f) {
                let stats = self.frame_stats[index];
                let estimated_ack_time = match stats.ack_time {
                    Some(ack_time) => ack_time,
                    None => {
                        // The first byte leaves at the later of the previous
                        // estimate and the enqueue time, the rest is paced
                        // at the safe rate, and the ACK takes another RTT.
                        let frame_transmit_time =
                            Duration::from_secs_f64(stats.frame_size_in_bits as f64 / safe_bitrate);
                        let start = match (estimated_sending_time, stats.enqueue_time) {
                            (Some(a), Some(b)) => a.max(b),
                            (Some(a), None) => a,
                            (None, Some(b)) => b,
                            (None, None) => now,
                        };
                        let estimate = start + frame_transmit_time + self.rtt;
                        if estimate < now {
                            // The ACK is late; assume it arrives after half
                            // as long again as it is overdue.
                            now + (now - estimate) / 2
                        } else {
                            estimate
                        }
                    }
                };
                estimated_sending_time =
                    Some(estimated_ack_time.checked_sub(half_rtt).unwrap_or(estimated_ack_time));
            }
            f = f.wrapping_add(1);
        }

        let estimated_sending_time = estimated_sending_time.unwrap_or(now);
        let enqueue_time = self
            .frame_stats_index(frame_id)
            .and_then(|index| self.frame_stats[index].enqueue_time);
        match enqueue_time {
            Some(enqueue_time) => estimated_sending_time.max(enqueue_time),
            // not enqueued yet, and it cannot be in the past
            None => estimated_sending_time.max(now),
        }
    }
}

impl CongestionControl for AdaptiveCongestionControl {
    fn update_rtt(&mut self, rtt: Duration) {
        self.rtt = (self.rtt * 7 + rtt) / 8;
    }

    fn update_target_playout_delay(&mut self, delay: Duration) {
        let max_unacked_frames =
            MAX_UNACKED_FRAMES.min(1 + (delay.as_secs_f64() * self.max_frame_rate) as usize);
        self.history_size = max_unacked_frames + HISTORY_SIZE;
        self.prune_frame_stats();
    }

    fn send_frame_to_transport(&mut self, frame_id: u32, frame_size_in_bits: u64, when: Instant) {
        self.last_enqueued_frame = frame_id;
        if let Some(index) = self.frame_stats_index(frame_id) {
            let stats = &mut self.frame_stats[index];
            stats.enqueue_time = Some(when);
            stats.frame_size_in_bits = frame_size_in_bits;
        }
    }

    fn ack_frame(&mut self, frame_id: u32, when: Instant) {
        let mut when = when;
        while is_newer_frame_id(frame_id, self.last_acked_frame) {
            let next = self.last_acked_frame.wrapping_add(1);
            let Some(next_index) = self.frame_stats_index(next) else {
                return;
            };
            let Some(enqueue_time) = self.frame_stats[next_index].enqueue_time else {
                // not sent yet
                return;
            };
            let previous = self
                .frame_stats_index(self.last_acked_frame)
                .map(|index| self.frame_stats[index]);

            self.last_acked_frame = next;
            when = when.max(enqueue_time);
            let stats = &mut self.frame_stats[next_index];
            if stats.ack_time.is_none() {
                stats.ack_time = Some(when);
            }
            let stats = *stats;
            self.acked_bits_in_history += stats.frame_size_in_bits;
            if let Some(previous) = previous {
                self.dead_time_in_history += dead_time(&previous, &stats);
            }
        }
    }

    fn get_bitrate(
        &mut self,
        now: Instant,
        playout_time: Instant,
        playout_delay: Duration,
        soft_max_bitrate: u32,
    ) -> u32 {
        let safe_bitrate = self.calculate_safe_bitrate();
        let next_frame = self.last_enqueued_frame.wrapping_add(1);
        let sending_time = self.estimated_sending_time(now, next_frame, safe_bitrate);

        let time_to_catch_up = if playout_time >= sending_time {
            (playout_time - sending_time).as_secs_f64()
        } else {
            -(sending_time - playout_time).as_secs_f64()
        };
        let empty_buffer_fraction = if playout_delay.is_zero() {
            0.0
        } else {
            (time_to_catch_up / playout_delay.as_secs_f64()).clamp(0.0, 1.0)
        };

        let bits_per_second =
            (empty_buffer_fraction * safe_bitrate / TARGET_EMPTY_BUFFER_FRACTION).min(u32::MAX as f64)
                as u32;
        trace!(
            "safe bitrate {:.0}, empty buffer fraction {:.2}, bitrate {}",
            safe_bitrate, empty_buffer_fraction, bits_per_second
        );

        bits_per_second
            .min(soft_max_bitrate)
            .max(self.min_bitrate_configured)
            .min(self.max_bitrate_configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_BITS: u64 = 100_000;
    const FRAME_DELAY: Duration = Duration::from_millis(100);

    /// Frames sent back to back, each acknowledged FRAME_DELAY after it was
    /// enqueued.
    fn steady_stream(t0: Instant, frames: u32) -> AdaptiveCongestionControl {
        let mut cc = AdaptiveCongestionControl::new(t0, 5_000_000, 100_000, 30.0);
        for i in 0..frames {
            cc.send_frame_to_transport(i, FRAME_BITS, t0 + FRAME_DELAY * i);
            cc.ack_frame(i, t0 + FRAME_DELAY * (i + 1));
        }
        cc
    }

    #[test]
    fn test_first_bitrate_within_bounds() {
        let now = Instant::now();
        let mut cc = AdaptiveCongestionControl::new(now, 5_000_000, 1_000_000, 30.0);
        let bitrate = cc.get_bitrate(
            now,
            now + Duration::from_millis(100),
            Duration::from_millis(100),
            u32::MAX,
        );
        assert!((1_000_000..=5_000_000).contains(&bitrate), "{bitrate}");
    }

    #[test]
    fn test_safe_bitrate_of_steady_stream() {
        let t0 = Instant::now();
        let expected = FRAME_BITS as f64 / FRAME_DELAY.as_secs_f64();

        let mut cc = steady_stream(t0, 50);
        assert!((cc.calculate_safe_bitrate() - expected).abs() < 1.0);

        // the window slides without drifting
        let mut cc = steady_stream(t0, 250);
        assert!((cc.calculate_safe_bitrate() - expected).abs() < 1.0);
    }

    #[test]
    fn test_idle_gaps_do_not_count() {
        let t0 = Instant::now();
        let mut cc = AdaptiveCongestionControl::new(t0, 5_000_000, 100_000, 30.0);
        for i in 0..20u32 {
            // each frame is acked after 50 ms, then the sender idles 50 ms
            let enqueue = t0 + Duration::from_millis(100) * i;
            cc.send_frame_to_transport(i, FRAME_BITS, enqueue);
            cc.ack_frame(i, enqueue + Duration::from_millis(50));
        }
        let expected = FRAME_BITS as f64 / 0.05;
        assert!((cc.calculate_safe_bitrate() - expected).abs() < 1.0);
    }

    #[test]
    fn test_empty_buffer_raises_bitrate() {
        let t0 = Instant::now();
        let mut cc = steady_stream(t0, 50);
        let now = t0 + FRAME_DELAY * 50;
        let safe = cc.calculate_safe_bitrate();

        let bitrate = cc.get_bitrate(now, now + FRAME_DELAY, FRAME_DELAY, u32::MAX);
        let expected = safe / TARGET_EMPTY_BUFFER_FRACTION;
        assert!((bitrate as f64 - expected).abs() <= 1.0, "{bitrate}");

        let capped = cc.get_bitrate(now, now + FRAME_DELAY, FRAME_DELAY, 500_000);
        assert_eq!(capped, 500_000);
    }

    #[test]
    fn test_full_buffer_falls_to_minimum() {
        let t0 = Instant::now();
        let mut cc = steady_stream(t0, 50);
        let now = t0 + FRAME_DELAY * 50;
        for i in 50..60u32 {
            cc.send_frame_to_transport(i, 10 * FRAME_BITS, now);
        }
        let bitrate = cc.get_bitrate(now, now + FRAME_DELAY, FRAME_DELAY, u32::MAX);
        assert_eq!(bitrate, 100_000);
    }

    #[test]
    fn test_ack_of_unsent_frame_ignored() {
        let t0 = Instant::now();
        let mut cc = steady_stream(t0, 5);
        cc.ack_frame(10, t0 + Duration::from_secs(1));
        assert_eq!(cc.last_acked_frame, 4);
    }

    #[test]
    fn test_playout_delay_sets_history_size() {
        let mut cc = AdaptiveCongestionControl::new(Instant::now(), 5_000_000, 100_000, 30.0);
        cc.update_target_playout_delay(Duration::from_millis(400));
        assert_eq!(cc.history_size(), 13 + HISTORY_SIZE);

        cc.update_target_playout_delay(Duration::from_secs(60));
        assert_eq!(cc.history_size(), MAX_UNACKED_FRAMES + HISTORY_SIZE);
    }

    #[test]
    fn test_rtt_is_smoothed() {
        let mut cc = AdaptiveCongestionControl::new(Instant::now(), 5_000_000, 100_000, 30.0);
        cc.update_rtt(Duration::from_millis(80));
        assert_eq!(cc.rtt, Duration::from_millis(10));
    }
}
