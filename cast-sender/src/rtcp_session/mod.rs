//! Per-stream RTCP state: clock offset, round trip time, lip sync and
//! feedback dispatch.

mod clock_drift_smoother;

pub use clock_drift_smoother::ClockDriftSmoother;

use log::{debug, trace};
use rtcp::cast_feedback::CastMessage;
use rtcp::compound::{RtcpBuilder, RtcpParser, RtcpReport};
use rtcp::extended_report::ReceiverReferenceTimeReport;
use rtcp::receiver_log::{CastLoggingEvent, ReceiverLogFrame};
use rtcp::receiver_report::ReportBlock;
use rtcp::sender_report::SenderReport;
use rtp::PacketRef;
use rtp::wrap::FrameIdWrapHelper;
use shared::error::Result;
use shared::time::{
    SystemInstant, compact_ntp, compact_ntp_to_duration, ntp_join, ntp_split, offset_instant,
    signed_micros,
};
use shared::util::{is_rtcp, rtcp_sender_ssrc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Sent reports older than this can no longer produce an RTT sample.
pub const STATS_HISTORY_WINDOW: Duration = Duration::from_secs(10);
/// Receiver log events remembered for deduplication.
pub const RECEIVER_RTCP_EVENT_HISTORY_SIZE: usize = 512;
/// Reference time reports older than the newest seen minus this are stale.
pub const OUT_OF_ORDER_MAX_AGE: Duration = Duration::from_millis(500);
const MIN_ROUND_TRIP_TIME: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpSessionEvent {
    RoundTripTime(Duration),
    CastMessage(CastMessage),
    /// Receiver log events not seen in an earlier report.
    ReceiverLog(Vec<ReceiverLogFrame>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct ReceiverEventKey {
    rtp_timestamp: u32,
    event_timestamp_ms: u64,
    kind: CastLoggingEvent,
    packet_id: u16,
}

pub struct RtcpSession {
    local_ssrc: u32,
    remote_ssrc: u32,
    clock: SystemInstant,

    builder: RtcpBuilder,
    parser: RtcpParser,

    /// How far the local clock runs ahead of the remote one, in microseconds.
    local_clock_ahead_by: ClockDriftSmoother,
    largest_seen_timestamp: Option<Instant>,

    lip_sync_rtp_timestamp: u32,
    lip_sync_ntp_timestamp: u64,

    last_reports_sent_map: HashMap<u32, Instant>,
    last_reports_sent_queue: VecDeque<(u32, Instant)>,
    current_round_trip_time: Option<Duration>,

    receiver_event_key_set: HashSet<ReceiverEventKey>,
    receiver_event_key_queue: VecDeque<ReceiverEventKey>,

    ack_frame_id_wrap_helper: FrameIdWrapHelper,

    events: VecDeque<RtcpSessionEvent>,
}

impl RtcpSession {
    pub fn new(local_ssrc: u32, remote_ssrc: u32, clock: SystemInstant) -> Self {
        RtcpSession {
            local_ssrc,
            remote_ssrc,
            clock,

            builder: RtcpBuilder::new(local_ssrc),
            parser: RtcpParser::new(local_ssrc, remote_ssrc),

            local_clock_ahead_by: ClockDriftSmoother::default(),
            largest_seen_timestamp: None,

            lip_sync_rtp_timestamp: 0,
            lip_sync_ntp_timestamp: 0,

            last_reports_sent_map: HashMap::new(),
            last_reports_sent_queue: VecDeque::new(),
            current_round_trip_time: None,

            receiver_event_key_set: HashSet::new(),
            receiver_event_key_queue: VecDeque::new(),

            ack_frame_id_wrap_helper: FrameIdWrapHelper::default(),

            events: VecDeque::new(),
        }
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    pub fn remote_ssrc(&self) -> u32 {
        self.remote_ssrc
    }

    /// Latest RTT sample, once one was measured.
    pub fn current_round_trip_time(&self) -> Option<Duration> {
        self.current_round_trip_time
    }

    /// Smoothed offset of the local clock over the remote one, in
    /// microseconds.
    pub fn local_clock_ahead_by(&self) -> i64 {
        self.local_clock_ahead_by.current()
    }

    /// RTP timestamp of the last sender report and its reference time on the
    /// local clock.
    pub fn latest_lip_sync_times(&self) -> Option<(u32, Instant)> {
        if self.lip_sync_ntp_timestamp == 0 {
            return None;
        }
        let remote_time = self.clock.ntp_to_instant(self.lip_sync_ntp_timestamp);
        Some((
            self.lip_sync_rtp_timestamp,
            offset_instant(remote_time, self.local_clock_ahead_by.current()),
        ))
    }

    /// Builds a sender report for `now` and remembers when it was sent so a
    /// later report block can yield the RTT.
    pub fn build_sender_report(
        &mut self,
        now: Instant,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
    ) -> Result<PacketRef> {
        let (ntp_seconds, ntp_fraction) = ntp_split(self.clock.ntp(now));
        let raw = self.builder.build_sender_report(&SenderReport {
            ssrc: self.local_ssrc,
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp,
            packet_count,
            octet_count,
        })?;
        self.save_last_sent_ntp_time(now, ntp_seconds, ntp_fraction);
        Ok(PacketRef::new(raw.to_vec()))
    }

    /// Handles a datagram if it is RTCP sent by the remote peer. Returns
    /// false if the packet belongs to someone else.
    pub fn incoming_rtcp_packet(&mut self, now: Instant, packet: &[u8]) -> bool {
        if !is_rtcp(packet) || rtcp_sender_ssrc(packet) != Some(self.remote_ssrc) {
            return false;
        }

        match self.parser.parse(packet) {
            Ok(report) => self.on_report(now, report),
            Err(err) => debug!("ssrc {}: dropping malformed RTCP: {}", self.local_ssrc, err),
        }
        true
    }

    pub fn poll_event(&mut self) -> Option<RtcpSessionEvent> {
        self.events.pop_front()
    }

    fn on_report(&mut self, now: Instant, report: RtcpReport) {
        if let Some(sr) = report.sender_report {
            self.on_received_ntp(now, sr.ntp_seconds, sr.ntp_fraction);
            self.on_received_lip_sync_info(sr.rtp_timestamp, sr.ntp_seconds, sr.ntp_fraction);
        }

        if let Some(rrtr) = report.rrtr {
            self.on_received_reference_time(now, &rrtr);
        }

        if let Some(block) = report.report_block {
            self.on_received_report_block(now, &block);
        }

        if let Some(feedback) = report.cast_feedback {
            let message =
                CastMessage::from_feedback(&feedback, &mut self.ack_frame_id_wrap_helper);
            trace!(
                "ssrc {}: cast feedback ack {} with {} nacked frames",
                self.local_ssrc,
                message.ack_frame_id,
                message.missing_frames_and_packets.len()
            );
            self.events.push_back(RtcpSessionEvent::CastMessage(message));
        }

        if !report.receiver_log.is_empty() {
            let frames = self.dedupe_receiver_log(report.receiver_log);
            if !frames.is_empty() {
                self.events.push_back(RtcpSessionEvent::ReceiverLog(frames));
            }
        }
    }

    fn on_received_reference_time(&mut self, now: Instant, rrtr: &ReceiverReferenceTimeReport) {
        let timestamp = self
            .clock
            .ntp_to_instant(ntp_join(rrtr.ntp_seconds, rrtr.ntp_fraction));
        if let Some(largest) = self.largest_seen_timestamp
            && timestamp + OUT_OF_ORDER_MAX_AGE < largest
        {
            debug!(
                "ssrc {}: ignoring stale reference time report",
                self.local_ssrc
            );
            return;
        }
        self.largest_seen_timestamp = Some(
            self.largest_seen_timestamp
                .map_or(timestamp, |largest| largest.max(timestamp)),
        );
        self.on_received_ntp(now, rrtr.ntp_seconds, rrtr.ntp_fraction);
    }

    fn on_received_ntp(&mut self, now: Instant, ntp_seconds: u32, ntp_fraction: u32) {
        let remote = SystemInstant::ntp2unix(ntp_join(ntp_seconds, ntp_fraction));
        let measured_offset = signed_micros(self.clock.unix(now), remote);

        self.local_clock_ahead_by.update(now, measured_offset);
        // Transit delay only ever inflates the measurement, so a smaller one
        // is closer to the truth.
        if measured_offset < self.local_clock_ahead_by.current() {
            self.local_clock_ahead_by.reset(now, measured_offset);
        }
    }

    fn on_received_lip_sync_info(&mut self, rtp_timestamp: u32, ntp_seconds: u32, ntp_fraction: u32) {
        if ntp_seconds == 0 {
            return;
        }
        self.lip_sync_rtp_timestamp = rtp_timestamp;
        self.lip_sync_ntp_timestamp = ntp_join(ntp_seconds, ntp_fraction);
    }

    fn on_received_report_block(&mut self, now: Instant, block: &ReportBlock) {
        let Some(sent_at) = self.last_reports_sent_map.get(&block.last_sr) else {
            // feedback on a report we no longer track
            return;
        };
        let sender_delay = now.saturating_duration_since(*sent_at);
        let receiver_delay = compact_ntp_to_duration(block.delay_since_last_sr);
        let round_trip_time = sender_delay
            .saturating_sub(receiver_delay)
            .max(MIN_ROUND_TRIP_TIME);

        self.current_round_trip_time = Some(round_trip_time);
        self.events
            .push_back(RtcpSessionEvent::RoundTripTime(round_trip_time));
    }

    fn save_last_sent_ntp_time(&mut self, now: Instant, ntp_seconds: u32, ntp_fraction: u32) {
        let last_report = compact_ntp(ntp_seconds, ntp_fraction);
        self.last_reports_sent_map.insert(last_report, now);
        self.last_reports_sent_queue.push_back((last_report, now));

        while let Some(&(report, sent_at)) = self.last_reports_sent_queue.front() {
            if now.saturating_duration_since(sent_at) <= STATS_HISTORY_WINDOW {
                break;
            }
            if self.last_reports_sent_map.get(&report) == Some(&sent_at) {
                self.last_reports_sent_map.remove(&report);
            }
            self.last_reports_sent_queue.pop_front();
        }
    }

    fn dedupe_receiver_log(&mut self, frames: Vec<ReceiverLogFrame>) -> Vec<ReceiverLogFrame> {
        let mut fresh = Vec::with_capacity(frames.len());
        for mut frame in frames {
            let rtp_timestamp = frame.rtp_timestamp;
            frame.events.retain(|event| {
                let key = ReceiverEventKey {
                    rtp_timestamp,
                    event_timestamp_ms: event.event_timestamp_ms,
                    kind: event.kind,
                    packet_id: event.packet_id,
                };
                if !self.receiver_event_key_set.insert(key) {
                    return false;
                }
                self.receiver_event_key_queue.push_back(key);
                if self.receiver_event_key_queue.len() > RECEIVER_RTCP_EVENT_HISTORY_SIZE
                    && let Some(oldest) = self.receiver_event_key_queue.pop_front()
                {
                    self.receiver_event_key_set.remove(&oldest);
                }
                true
            });
            if !frame.events.is_empty() {
                fresh.push(frame);
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::cast_feedback::MissingFramesAndPacketsMap;
    use rtcp::compound::ReceiverPacketParams;
    use rtcp::receiver_log::ReceiverLogEvent;
    use shared::time::duration_to_compact_ntp;

    const SENDER_SSRC: u32 = 0x11;
    const RECEIVER_SSRC: u32 = 0x22;

    fn clock(base: Instant) -> SystemInstant {
        SystemInstant::new(base, Duration::from_secs(1_700_000_000))
    }

    fn receiver_packet(builder: &mut RtcpBuilder, params: ReceiverPacketParams<'_>) -> Vec<u8> {
        builder.build_receiver_packet(&params).unwrap().to_vec()
    }

    #[test]
    fn test_round_trip_time() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let sr = session.build_sender_report(base, 1000, 10, 1000).unwrap();
        assert!(is_rtcp(&sr));

        let (ntp_seconds, ntp_fraction) = ntp_split(clock(base).ntp(base));
        let mut receiver = RtcpBuilder::new(RECEIVER_SSRC);
        let rr = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                report_block: Some(ReportBlock {
                    media_ssrc: SENDER_SSRC,
                    last_sr: compact_ntp(ntp_seconds, ntp_fraction),
                    delay_since_last_sr: duration_to_compact_ntp(Duration::from_millis(30)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        assert!(session.incoming_rtcp_packet(base + Duration::from_millis(80), &rr));
        let rtt = session.current_round_trip_time().unwrap();
        assert!(
            rtt >= Duration::from_millis(49) && rtt <= Duration::from_millis(51),
            "{rtt:?}"
        );
        assert_eq!(
            session.poll_event(),
            Some(RtcpSessionEvent::RoundTripTime(rtt))
        );
    }

    #[test]
    fn test_round_trip_time_floor() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        session.build_sender_report(base, 0, 0, 0).unwrap();

        let (ntp_seconds, ntp_fraction) = ntp_split(clock(base).ntp(base));
        let mut receiver = RtcpBuilder::new(RECEIVER_SSRC);
        let rr = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                report_block: Some(ReportBlock {
                    media_ssrc: SENDER_SSRC,
                    last_sr: compact_ntp(ntp_seconds, ntp_fraction),
                    delay_since_last_sr: duration_to_compact_ntp(Duration::from_millis(100)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        session.incoming_rtcp_packet(base + Duration::from_millis(20), &rr);
        assert_eq!(
            session.current_round_trip_time(),
            Some(Duration::from_millis(1))
        );
    }

    #[test]
    fn test_old_sent_reports_forgotten() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        session.build_sender_report(base, 0, 0, 0).unwrap();
        session
            .build_sender_report(base + Duration::from_secs(11), 0, 0, 0)
            .unwrap();
        assert_eq!(session.last_reports_sent_map.len(), 1);
        assert_eq!(session.last_reports_sent_queue.len(), 1);
    }

    #[test]
    fn test_packets_from_others_ignored() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let mut stranger = RtcpBuilder::new(0x99);
        let rr = receiver_packet(&mut stranger, ReceiverPacketParams::default());
        assert!(!session.incoming_rtcp_packet(base, &rr));
        assert!(!session.incoming_rtcp_packet(base, &[0x80, 96, 0, 1]));
    }

    #[test]
    fn test_clock_offset_from_reference_time() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let mut receiver = RtcpBuilder::new(RECEIVER_SSRC);

        // the receiver clock lags 2 s behind ours, plus 10 ms of transit
        let receiver_time = |t: Instant| {
            let unix = clock(base).unix(t) - Duration::from_secs(2) - Duration::from_millis(10);
            ntp_split(SystemInstant::unix2ntp(unix))
        };
        let now = base + Duration::from_secs(5);
        let rrtr = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                rrtr: Some(receiver_time(now)),
                ..Default::default()
            },
        );
        assert!(session.incoming_rtcp_packet(now, &rrtr));
        let offset = session.local_clock_ahead_by();
        assert!((offset - 2_010_000).abs() < 5, "{offset}");

        // a measurement with less transit delay wins outright
        let later = now + Duration::from_secs(1);
        let (s, f) = ntp_split(SystemInstant::unix2ntp(
            clock(base).unix(later) - Duration::from_secs(2),
        ));
        let rrtr = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                rrtr: Some((s, f)),
                ..Default::default()
            },
        );
        session.incoming_rtcp_packet(later, &rrtr);
        assert!((session.local_clock_ahead_by() - 2_000_000).abs() < 5);
    }

    #[test]
    fn test_stale_reference_time_ignored() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let mut receiver = RtcpBuilder::new(RECEIVER_SSRC);
        let ntp_at = |t: Instant| ntp_split(clock(base).ntp(t));

        let now = base + Duration::from_secs(10);
        let fresh = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                rrtr: Some(ntp_at(now)),
                ..Default::default()
            },
        );
        session.incoming_rtcp_packet(now, &fresh);
        let offset = session.local_clock_ahead_by();

        // sent a second before the newest one seen: its offset is skipped
        let stale = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                rrtr: Some(ntp_at(now - Duration::from_secs(1))),
                ..Default::default()
            },
        );
        assert!(session.incoming_rtcp_packet(now + Duration::from_secs(1), &stale));
        assert_eq!(session.local_clock_ahead_by(), offset);
    }

    #[test]
    fn test_lip_sync_from_sender_report() {
        let base = Instant::now();
        // a session whose peer sends media
        let mut session = RtcpSession::new(RECEIVER_SSRC, SENDER_SSRC, clock(base));
        assert_eq!(session.latest_lip_sync_times(), None);

        let mut peer = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let sr = peer.build_sender_report(base, 9000, 1, 100).unwrap();
        assert!(session.incoming_rtcp_packet(base, &sr));

        let (rtp_timestamp, reference_time) = session.latest_lip_sync_times().unwrap();
        assert_eq!(rtp_timestamp, 9000);
        let error = if reference_time > base {
            reference_time - base
        } else {
            base - reference_time
        };
        assert!(error < Duration::from_millis(1));
    }

    #[test]
    fn test_cast_feedback_widened() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));
        let mut receiver = RtcpBuilder::new(RECEIVER_SSRC);

        let mut missing = MissingFramesAndPacketsMap::new();
        missing.insert(4, [2u16].into_iter().collect());
        let message = CastMessage {
            media_ssrc: SENDER_SSRC,
            ack_frame_id: 3,
            missing_frames_and_packets: missing,
            target_delay: Duration::from_millis(100),
        };
        let packet = receiver_packet(
            &mut receiver,
            ReceiverPacketParams {
                cast_message: Some(&message),
                ..Default::default()
            },
        );
        assert!(session.incoming_rtcp_packet(base, &packet));
        assert_eq!(
            session.poll_event(),
            Some(RtcpSessionEvent::CastMessage(message))
        );
    }

    #[test]
    fn test_receiver_log_deduplicated() {
        let base = Instant::now();
        let mut session = RtcpSession::new(SENDER_SSRC, RECEIVER_SSRC, clock(base));

        let event = |ms: u64| ReceiverLogEvent {
            kind: CastLoggingEvent::FrameAckSent,
            event_timestamp_ms: ms,
            delay_delta_ms: 0,
            packet_id: 0,
        };
        let first = vec![ReceiverLogFrame {
            rtp_timestamp: 100,
            events: vec![event(1000), event(1010)],
        }];
        assert_eq!(session.dedupe_receiver_log(first.clone()), first);

        let second = vec![ReceiverLogFrame {
            rtp_timestamp: 100,
            events: vec![event(1010), event(1020)],
        }];
        let fresh = session.dedupe_receiver_log(second);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].events, vec![event(1020)]);

        // the key window is bounded
        for i in 0..RECEIVER_RTCP_EVENT_HISTORY_SIZE as u64 {
            session.dedupe_receiver_log(vec![ReceiverLogFrame {
                rtp_timestamp: 200,
                events: vec![event(i)],
            }]);
        }
        assert_eq!(
            session.receiver_event_key_set.len(),
            RECEIVER_RTCP_EVENT_HISTORY_SIZE
        );
        assert_eq!(session.dedupe_receiver_log(first.clone()), first);
    }
}
