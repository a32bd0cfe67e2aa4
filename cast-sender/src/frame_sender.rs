//! Per-stream sending policy: frame admission, sender reports, kickstarts
//! and ACK bookkeeping.

use log::{debug, trace, warn};
use rtcp::cast_feedback::CastMessage;
use rtp::EncodedFrame;
use rtp::wrap::{is_newer_frame_id, is_newer_rtp_timestamp, is_older_frame_id};
use std::time::{Duration, Instant};

use crate::config::{FrameSenderConfig, StreamKind, defaults};
use crate::congestion::{AdaptiveCongestionControl, CongestionControl, FixedCongestionControl};
use crate::pacer::PacketSink;
use crate::transport::CastTransport;

/// A sender report goes out with each of the first this many frames, until
/// the receiver has had a chance to measure the RTT.
pub const NUM_AGGRESSIVE_REPORTS_SENT_AT_START: u32 = 100;
/// Frames allowed in flight on top of what the frame rate implies.
pub const MAX_FRAME_BURST: usize = 5;
const MIN_SCHEDULING_DELAY: Duration = Duration::from_millis(1);
/// Timestamps are remembered for this many of the latest frames.
const FRAME_HISTORY_SIZE: usize = 256;

/// Sends the frames of one stream and reacts to its feedback.
///
/// Frame ids leaving this sender start at 0 and are contiguous, whatever
/// ids the encoder uses. A refused frame leaves no gap on the wire, and a
/// frame that depends on a refused frame is refused too.
pub struct FrameSender {
    kind: StreamKind,
    ssrc: u32,
    rtp_timebase: u32,
    min_playout_delay: Duration,
    max_playout_delay: Duration,
    max_frame_rate: f64,
    max_bitrate: u32,
    max_unacked_frames: usize,

    target_playout_delay: Duration,
    /// Set once the playout delay changed, so frames tell the receiver.
    send_target_playout_delay: bool,
    current_round_trip_time: Option<Duration>,

    /// None until the first frame went out.
    last_send_time: Option<Instant>,
    last_sent_frame_id: u32,
    latest_acked_frame_id: u32,
    last_encoder_frame_id: u32,
    /// `(encoder id, wire id)` of the latest sent frames, by encoder id.
    wire_frame_ids: Vec<Option<(u32, u32)>>,
    duplicate_ack_counter: u32,
    num_aggressive_rtcp_reports_sent: u32,

    frame_reference_times: Vec<Option<Instant>>,
    frame_rtp_timestamps: Vec<u32>,

    frames_in_encoder: usize,
    encoder_backlog_duration: Duration,

    next_rtcp_report: Option<Instant>,
    next_resend_check: Option<Instant>,

    congestion_control: Box<dyn CongestionControl + Send>,
}

impl FrameSender {
    pub fn new(now: Instant, kind: StreamKind, config: &FrameSenderConfig) -> Self {
        let congestion_control: Box<dyn CongestionControl + Send> = match kind {
            StreamKind::Audio => Box::new(FixedCongestionControl::new(config.start_bitrate)),
            StreamKind::Video if config.use_external_encoder => Box::new(
                FixedCongestionControl::new(config.min_bitrate / 2 + config.max_bitrate / 2),
            ),
            StreamKind::Video => Box::new(AdaptiveCongestionControl::new(
                now,
                config.max_bitrate,
                config.min_bitrate,
                config.max_frame_rate,
            )),
        };

        let mut sender = FrameSender {
            kind,
            ssrc: config.sender_ssrc,
            rtp_timebase: config.rtp_timebase,
            min_playout_delay: config.min_playout_delay,
            max_playout_delay: config.max_playout_delay,
            max_frame_rate: config.max_frame_rate,
            max_bitrate: config.max_bitrate,
            max_unacked_frames: config.max_unacked_frames,

            target_playout_delay: config.min_playout_delay,
            send_target_playout_delay: false,
            current_round_trip_time: None,

            last_send_time: None,
            last_sent_frame_id: 0,
            latest_acked_frame_id: 0,
            last_encoder_frame_id: 0,
            wire_frame_ids: vec![None; FRAME_HISTORY_SIZE],
            duplicate_ack_counter: 0,
            num_aggressive_rtcp_reports_sent: 0,

            frame_reference_times: vec![None; FRAME_HISTORY_SIZE],
            frame_rtp_timestamps: vec![0; FRAME_HISTORY_SIZE],

            frames_in_encoder: 0,
            encoder_backlog_duration: Duration::ZERO,

            next_rtcp_report: None,
            next_resend_check: None,

            congestion_control,
        };
        sender
            .congestion_control
            .update_target_playout_delay(sender.target_playout_delay);
        sender
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn target_playout_delay(&self) -> Duration {
        self.target_playout_delay
    }

    pub fn current_round_trip_time(&self) -> Option<Duration> {
        self.current_round_trip_time
    }

    /// Media duration of one frame at the maximum frame rate.
    pub fn nominal_frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_frame_rate)
    }

    /// Id of the newest frame handed to the transport, once one was.
    pub fn last_sent_frame_id(&self) -> Option<u32> {
        self.last_send_time.map(|_| self.last_sent_frame_id)
    }

    pub fn latest_acked_frame_id(&self) -> Option<u32> {
        self.last_send_time.map(|_| self.latest_acked_frame_id)
    }

    pub fn unacknowledged_frame_count(&self) -> usize {
        if self.last_send_time.is_none()
            || !is_newer_frame_id(self.last_sent_frame_id, self.latest_acked_frame_id)
        {
            return 0;
        }
        self.last_sent_frame_id
            .wrapping_sub(self.latest_acked_frame_id) as usize
    }

    /// Clamps `delay` into the configured bounds and announces the change on
    /// the following frames.
    pub fn set_target_playout_delay(&mut self, delay: Duration) {
        let delay = delay.clamp(self.min_playout_delay, self.max_playout_delay);
        if delay == self.target_playout_delay {
            return;
        }
        debug!(
            "ssrc {}: target playout delay {:?} -> {:?}",
            self.ssrc, self.target_playout_delay, delay
        );
        self.target_playout_delay = delay;
        self.send_target_playout_delay = true;
        self.congestion_control
            .update_target_playout_delay(self.target_playout_delay);
    }

    /// Frames the encoder accepted but did not produce yet, and how much
    /// media they cover.
    pub fn set_encoder_backlog(&mut self, frames: usize, duration: Duration) {
        self.frames_in_encoder = frames;
        self.encoder_backlog_duration = duration;
    }

    pub fn on_measured_round_trip_time(&mut self, rtt: Duration) {
        trace!("ssrc {}: rtt {:?}", self.ssrc, rtt);
        self.current_round_trip_time = Some(rtt);
    }

    /// Bitrate the encoder should aim for with a frame captured at
    /// `reference_time`.
    pub fn target_bitrate(&mut self, now: Instant, reference_time: Instant) -> u32 {
        self.congestion_control.get_bitrate(
            now,
            reference_time + self.target_playout_delay,
            self.target_playout_delay,
            self.max_bitrate,
        )
    }

    /// True if a frame of `frame_duration` should not be encoded now, because
    /// it would put more frames or more media in flight than allowed.
    pub fn should_drop_next_frame(&self, frame_duration: Duration) -> bool {
        let frames_in_flight = self.unacknowledged_frame_count() + self.frames_in_encoder;
        if frames_in_flight >= self.max_unacked_frames {
            debug!(
                "ssrc {}: dropping frame, {} frames in flight",
                self.ssrc, frames_in_flight
            );
            return true;
        }

        let duration_in_flight = self.in_flight_media_duration();
        let max_frames_in_flight = self.max_frame_rate * duration_in_flight.as_secs_f64();
        if frames_in_flight as f64 >= max_frames_in_flight + MAX_FRAME_BURST as f64 {
            debug!(
                "ssrc {}: dropping frame, {} frames in flight exceed the frame rate",
                self.ssrc, frames_in_flight
            );
            return true;
        }

        let duration_would_be_in_flight = duration_in_flight + frame_duration;
        let allowed_in_flight = self.allowed_in_flight_media_duration();
        if duration_would_be_in_flight > allowed_in_flight {
            debug!(
                "ssrc {}: dropping frame, {:?} in flight would exceed {:?}",
                self.ssrc, duration_would_be_in_flight, allowed_in_flight
            );
            return true;
        }

        false
    }

    /// Hands `frame` to the transport. Returns false if the frame was refused
    /// because its id or timestamps do not move forward, or because the frame
    /// it references was never sent.
    pub fn send_encoded_frame<S: PacketSink>(
        &mut self,
        now: Instant,
        transport: &mut CastTransport<S>,
        mut frame: EncodedFrame,
    ) -> bool {
        if !self.assign_wire_frame_id(&mut frame) {
            return false;
        }

        let is_first_frame_to_be_sent = self.last_send_time.is_none();
        let frame_id = frame.frame_id;
        self.last_send_time = Some(now);
        self.last_sent_frame_id = frame_id;

        if is_first_frame_to_be_sent {
            self.latest_acked_frame_id = frame_id.wrapping_sub(1);
            self.schedule_next_resend_check(now);
        }

        self.record_latest_frame_timestamps(frame_id, frame.reference_time, frame.rtp_timestamp);

        if self.num_aggressive_rtcp_reports_sent < NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
            self.num_aggressive_rtcp_reports_sent += 1;
            self.send_rtcp_report(now, transport);
            if self.num_aggressive_rtcp_reports_sent == NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
                self.schedule_next_rtcp_report(now);
            }
        }

        self.congestion_control
            .send_frame_to_transport(frame_id, frame.data.len() as u64 * 8, now);

        if self.send_target_playout_delay {
            frame.new_playout_delay_ms =
                u16::try_from(self.target_playout_delay.as_millis()).unwrap_or(u16::MAX);
        }

        trace!(
            "ssrc {}: sending frame {} ({} bytes, rtp {})",
            self.ssrc,
            frame_id,
            frame.data.len(),
            frame.rtp_timestamp
        );
        transport.insert_frame(now, self.ssrc, &frame);
        true
    }

    pub fn on_received_cast_feedback<S: PacketSink>(
        &mut self,
        now: Instant,
        transport: &mut CastTransport<S>,
        cast_feedback: &CastMessage,
    ) {
        if let Some(rtt) = self.current_round_trip_time {
            self.congestion_control.update_rtt(rtt);
            // An RTT means the receiver got a report, so the aggressive
            // reports have done their job.
            if self.num_aggressive_rtcp_reports_sent < NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
                debug!("ssrc {}: no longer sending reports with every frame", self.ssrc);
                self.num_aggressive_rtcp_reports_sent = NUM_AGGRESSIVE_REPORTS_SENT_AT_START;
                self.schedule_next_rtcp_report(now);
            }
        }

        if self.last_send_time.is_none() {
            // nothing sent, nothing to ACK
            return;
        }

        let ack_frame_id = cast_feedback.ack_frame_id;
        if !cast_feedback.has_nacks() {
            let is_duplicate = self.latest_acked_frame_id == ack_frame_id;
            if is_duplicate {
                trace!("ssrc {}: duplicate ACK for frame {}", self.ssrc, ack_frame_id);
            }
            // only count duplicates while newer frames are outstanding
            if is_duplicate && self.latest_acked_frame_id != self.last_sent_frame_id {
                self.duplicate_ack_counter += 1;
            } else {
                self.duplicate_ack_counter = 0;
            }
            if self.duplicate_ack_counter >= 2 && self.duplicate_ack_counter % 3 == 2 {
                self.resend_for_kickstart(now, transport);
            }
        } else {
            // A NACK shows the receiver is alive; no kickstart needed.
            self.duplicate_ack_counter = 0;
        }

        self.congestion_control.ack_frame(ack_frame_id, now);

        if is_older_frame_id(ack_frame_id, self.latest_acked_frame_id) {
            debug!(
                "ssrc {}: ACK for frame {} arrived after ACK for frame {}",
                self.ssrc, ack_frame_id, self.latest_acked_frame_id
            );
            return;
        }
        if is_newer_frame_id(ack_frame_id, self.last_sent_frame_id) {
            warn!(
                "ssrc {}: ACK for frame {} which was never sent, last sent {}",
                self.ssrc, ack_frame_id, self.last_sent_frame_id
            );
            return;
        }

        let mut frames_to_cancel = vec![];
        while is_newer_frame_id(ack_frame_id, self.latest_acked_frame_id) {
            self.latest_acked_frame_id = self.latest_acked_frame_id.wrapping_add(1);
            frames_to_cancel.push(self.latest_acked_frame_id);
        }
        if !frames_to_cancel.is_empty() {
            trace!("ssrc {}: frames up to {} acked", self.ssrc, ack_frame_id);
            transport.cancel_sending_frames(self.ssrc, &frames_to_cancel);
        }
    }

    pub fn handle_timeout<S: PacketSink>(&mut self, now: Instant, transport: &mut CastTransport<S>) {
        if self.next_rtcp_report.is_some_and(|at| now >= at) {
            self.send_rtcp_report(now, transport);
            self.schedule_next_rtcp_report(now);
        }
        if self.next_resend_check.is_some_and(|at| now >= at) {
            self.resend_check(now, transport);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.next_rtcp_report, self.next_resend_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn assign_wire_frame_id(&mut self, frame: &mut EncodedFrame) -> bool {
        let encoder_frame_id = frame.frame_id;
        let wire_frame_id = match self.last_send_time {
            None => 0,
            Some(_) => {
                let previous = self.last_sent_frame_id as u8 as usize;
                let previous_rtp_timestamp = self.frame_rtp_timestamps[previous];
                let previous_reference_time = self.frame_reference_times[previous];
                if !is_newer_rtp_timestamp(frame.rtp_timestamp, previous_rtp_timestamp)
                    || previous_reference_time.is_some_and(|t| frame.reference_time <= t)
                {
                    warn!(
                        "ssrc {}: dropping frame {}, timestamps do not increase (rtp {} after {})",
                        self.ssrc, encoder_frame_id, frame.rtp_timestamp, previous_rtp_timestamp
                    );
                    return false;
                }
                if !is_newer_frame_id(encoder_frame_id, self.last_encoder_frame_id) {
                    warn!(
                        "ssrc {}: dropping frame {}, id does not increase",
                        self.ssrc, encoder_frame_id
                    );
                    return false;
                }
                self.last_sent_frame_id.wrapping_add(1)
            }
        };

        let referenced_frame_id = if frame.referenced_frame_id == encoder_frame_id {
            wire_frame_id
        } else {
            match self.wire_frame_ids[frame.referenced_frame_id as u8 as usize] {
                Some((encoder_id, wire_id)) if encoder_id == frame.referenced_frame_id => wire_id,
                _ => {
                    warn!(
                        "ssrc {}: dropping frame {}, it depends on frame {} which was not sent",
                        self.ssrc, encoder_frame_id, frame.referenced_frame_id
                    );
                    return false;
                }
            }
        };

        if wire_frame_id != encoder_frame_id {
            trace!(
                "ssrc {}: frame {} goes out as frame {}",
                self.ssrc, encoder_frame_id, wire_frame_id
            );
        }
        self.last_encoder_frame_id = encoder_frame_id;
        self.wire_frame_ids[encoder_frame_id as u8 as usize] =
            Some((encoder_frame_id, wire_frame_id));
        frame.frame_id = wire_frame_id;
        frame.referenced_frame_id = referenced_frame_id;
        true
    }

    fn record_latest_frame_timestamps(
        &mut self,
        frame_id: u32,
        reference_time: Instant,
        rtp_timestamp: u32,
    ) {
        let index = frame_id as u8 as usize;
        self.frame_reference_times[index] = Some(reference_time);
        self.frame_rtp_timestamps[index] = rtp_timestamp;
    }

    fn recorded_reference_time(&self, frame_id: u32) -> Option<Instant> {
        self.frame_reference_times[frame_id as u8 as usize]
    }

    /// Media time between the oldest unacknowledged frame and the newest
    /// sent one, plus whatever waits in the encoder.
    fn in_flight_media_duration(&self) -> Duration {
        if self.unacknowledged_frame_count() == 0 {
            return self.encoder_backlog_duration;
        }
        let oldest_unacked =
            self.recorded_reference_time(self.latest_acked_frame_id.wrapping_add(1));
        let newest_sent = self.recorded_reference_time(self.last_sent_frame_id);
        let sent_duration = match (oldest_unacked, newest_sent) {
            (Some(oldest), Some(newest)) => newest.saturating_duration_since(oldest),
            _ => Duration::ZERO,
        };
        sent_duration + self.encoder_backlog_duration
    }

    fn allowed_in_flight_media_duration(&self) -> Duration {
        self.target_playout_delay + self.current_round_trip_time.unwrap_or_default() / 2
    }

    /// The RTP timestamp of `now`, extrapolated from the last sent frame.
    fn rtp_timestamp_at(&self, now: Instant) -> Option<u32> {
        let index = self.last_sent_frame_id as u8 as usize;
        let reference_time = self.frame_reference_times[index]?;
        let rtp_timestamp = self.frame_rtp_timestamps[index];
        let ticks =
            |elapsed: Duration| (elapsed.as_micros() * self.rtp_timebase as u128 / 1_000_000) as u32;
        Some(if now >= reference_time {
            rtp_timestamp.wrapping_add(ticks(now - reference_time))
        } else {
            rtp_timestamp.wrapping_sub(ticks(reference_time - now))
        })
    }

    fn send_rtcp_report<S: PacketSink>(&mut self, now: Instant, transport: &mut CastTransport<S>) {
        let Some(rtp_timestamp) = self.rtp_timestamp_at(now) else {
            return;
        };
        trace!("ssrc {}: sender report, rtp {}", self.ssrc, rtp_timestamp);
        transport.send_sender_report(now, self.ssrc, rtp_timestamp);
    }

    fn schedule_next_rtcp_report(&mut self, now: Instant) {
        self.next_rtcp_report = Some(now + defaults::RTCP_REPORT_INTERVAL);
    }

    fn resend_check<S: PacketSink>(&mut self, now: Instant, transport: &mut CastTransport<S>) {
        if let Some(last_send_time) = self.last_send_time
            && now.saturating_duration_since(last_send_time) > self.target_playout_delay
        {
            if self.latest_acked_frame_id == self.last_sent_frame_id {
                trace!("ssrc {}: stream is up to date", self.ssrc);
            } else {
                debug!(
                    "ssrc {}: no ACK since frame {}, kickstarting frame {}",
                    self.ssrc, self.latest_acked_frame_id, self.last_sent_frame_id
                );
                self.resend_for_kickstart(now, transport);
            }
        }
        self.schedule_next_resend_check(now);
    }

    fn schedule_next_resend_check(&mut self, now: Instant) {
        let Some(last_send_time) = self.last_send_time else {
            return;
        };
        let next = last_send_time + self.target_playout_delay;
        self.next_resend_check = Some(next.max(now + MIN_SCHEDULING_DELAY));
    }

    fn resend_for_kickstart<S: PacketSink>(&mut self, now: Instant, transport: &mut CastTransport<S>) {
        transport.resend_frame_for_kickstart(now, self.ssrc, self.last_sent_frame_id);
        // wait a full playout delay before the next check fires
        self.last_send_time = Some(now);
    }
}
