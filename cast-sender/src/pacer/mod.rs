//! Packet pacing: spreads frame-sized writes into bounded bursts.

mod sink;

pub use sink::{OutboundQueue, PacketSink};

use log::{error, trace};
use rtp::{PacketKey, PacketRef, SendPacketVector};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::defaults::{PACER_MAX_BURST_SIZE, PACER_TARGET_BURST_SIZE};

pub const PACING_INTERVAL: Duration = Duration::from_millis(10);
/// A frame worth of queued packets should leave within this many bursts.
pub const PACING_MAX_BURSTS_PER_FRAME: usize = 3;
/// How long send records are kept for resend deduplication.
pub const MAX_DEDUPE_WINDOW: Duration = Duration::from_millis(500);
/// Queue depth considered impossible in a healthy session: ten seconds of
/// back-to-back maximum bursts.
const RIDICULOUS_QUEUE_SECONDS: u64 = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketType {
    Normal,
    Resend,
    Rtcp,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Unblocked,
    /// The transport refused more data until it reports ready.
    TransportBlocked,
    /// The burst budget for the current interval is spent.
    BurstFull,
}

/// What the pacer knew when it last sent a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketSendRecord {
    pub time: Instant,
    /// Transport byte counter right after the packet was sent.
    pub last_byte_sent: u64,
    /// Byte counter right after the most recent audio packet, at that time.
    pub last_byte_sent_for_audio: u64,
}

/// Inputs to the resend deduplication check.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DedupInfo {
    /// Packets sent more recently than this are not sent again.
    pub resend_interval: Duration,
    /// Transport byte counter covered by the newest audio ACK, or 0.
    pub last_byte_acked_for_audio: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacerEvent {
    RetransmissionRejected(PacketKey),
    Retransmitted(PacketKey),
    /// The queue reached the impossible depth; reported once.
    QueueOverflow { queued: usize },
}

type PacketList = BTreeMap<PacketKey, (PacketType, PacketRef)>;

/// Shapes outgoing traffic into bursts of at most `current_max_burst_size`
/// packets per [`PACING_INTERVAL`].
///
/// RTCP always goes first, then packets of the priority SSRCs, then the rest,
/// each in capture time order.
pub struct PacedSender<S> {
    sink: S,

    audio_ssrc: u32,
    video_ssrc: u32,
    priority_ssrcs: Vec<u32>,

    priority_packet_list: PacketList,
    packet_list: PacketList,

    send_history: BTreeMap<PacketKey, PacketSendRecord>,
    send_history_buffer: BTreeMap<PacketKey, PacketSendRecord>,
    last_byte_sent: BTreeMap<u32, u64>,

    target_burst_size: usize,
    max_burst_size: usize,
    current_max_burst_size: usize,
    next_max_burst_size: usize,
    next_next_max_burst_size: usize,
    current_burst_size: usize,
    burst_end: Option<Instant>,

    state: State,
    has_reached_upper_bound_once: bool,

    events: VecDeque<PacerEvent>,
}

impl<S: PacketSink> PacedSender<S> {
    pub fn new(sink: S) -> Self {
        PacedSender::with_burst_sizes(sink, PACER_TARGET_BURST_SIZE, PACER_MAX_BURST_SIZE)
    }

    pub fn with_burst_sizes(sink: S, target_burst_size: usize, max_burst_size: usize) -> Self {
        let target_burst_size = target_burst_size.max(1);
        let max_burst_size = max_burst_size.max(target_burst_size);
        PacedSender {
            sink,

            audio_ssrc: 0,
            video_ssrc: 0,
            priority_ssrcs: vec![],

            priority_packet_list: BTreeMap::new(),
            packet_list: BTreeMap::new(),

            send_history: BTreeMap::new(),
            send_history_buffer: BTreeMap::new(),
            last_byte_sent: BTreeMap::new(),

            target_burst_size,
            max_burst_size,
            current_max_burst_size: target_burst_size,
            next_max_burst_size: target_burst_size,
            next_next_max_burst_size: target_burst_size,
            current_burst_size: 0,
            burst_end: None,

            state: State::Unblocked,
            has_reached_upper_bound_once: false,

            events: VecDeque::new(),
        }
    }

    pub fn register_audio_ssrc(&mut self, ssrc: u32) {
        self.audio_ssrc = ssrc;
    }

    pub fn register_video_ssrc(&mut self, ssrc: u32) {
        self.video_ssrc = ssrc;
    }

    /// Packets of `ssrc` jump ahead of every other media packet.
    pub fn register_priority_ssrc(&mut self, ssrc: u32) {
        if !self.priority_ssrcs.contains(&ssrc) {
            self.priority_ssrcs.push(ssrc);
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn current_max_burst_size(&self) -> usize {
        self.current_max_burst_size
    }

    /// Number of packets waiting in either queue.
    pub fn len(&self) -> usize {
        self.packet_list.len() + self.priority_packet_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet_list.is_empty() && self.priority_packet_list.is_empty()
    }

    pub fn is_transport_blocked(&self) -> bool {
        self.state == State::TransportBlocked
    }

    /// Transport byte counter after `key` was last sent, or 0 if it never was.
    pub fn last_byte_sent_for_packet(&self, key: &PacketKey) -> u64 {
        self.send_history
            .get(key)
            .map(|record| record.last_byte_sent)
            .unwrap_or(0)
    }

    /// Transport byte counter after the last packet of `ssrc`, or 0.
    pub fn last_byte_sent_for_ssrc(&self, ssrc: u32) -> u64 {
        self.last_byte_sent.get(&ssrc).copied().unwrap_or(0)
    }

    pub fn send_packets(&mut self, now: Instant, packets: SendPacketVector) {
        let Some((first, _)) = packets.first() else {
            return;
        };
        let high_priority = self.is_high_priority(first);
        let list = if high_priority {
            &mut self.priority_packet_list
        } else {
            &mut self.packet_list
        };
        for (key, packet) in packets {
            list.insert(key, (PacketType::Normal, packet));
        }
        if self.state == State::Unblocked {
            self.send_stored_packets(now);
        }
    }

    /// Queues retransmissions, skipping packets `dedup_info` says were sent
    /// too recently.
    pub fn resend_packets(&mut self, now: Instant, packets: SendPacketVector, dedup_info: DedupInfo) {
        let Some((first, _)) = packets.first() else {
            return;
        };
        let high_priority = self.is_high_priority(first);
        for (key, packet) in packets {
            if !self.should_resend(&key, &dedup_info, now) {
                trace!(
                    "retransmission rejected ssrc {} frame {} packet {}",
                    key.ssrc, key.frame_id, key.packet_id
                );
                self.events.push_back(PacerEvent::RetransmissionRejected(key));
                continue;
            }
            let list = if high_priority {
                &mut self.priority_packet_list
            } else {
                &mut self.packet_list
            };
            list.insert(key, (PacketType::Resend, packet));
        }
        if self.state == State::Unblocked {
            self.send_stored_packets(now);
        }
    }

    /// RTCP bypasses pacing unless the transport is blocked, in which case it
    /// waits at the head of the priority queue.
    pub fn send_rtcp_packet(&mut self, ssrc: u32, packet: PacketRef) {
        if self.state == State::TransportBlocked {
            self.priority_packet_list
                .insert(PacketKey::rtcp(ssrc), (PacketType::Rtcp, packet));
        } else if !self.sink.send_packet(&packet) {
            self.state = State::TransportBlocked;
        }
    }

    /// Removes a packet that has not gone out yet.
    pub fn cancel_sending_packet(&mut self, key: &PacketKey) {
        self.packet_list.remove(key);
        self.priority_packet_list.remove(key);
    }

    /// The transport drained its backlog.
    pub fn on_transport_ready(&mut self, now: Instant) {
        if self.state == State::TransportBlocked {
            self.state = State::Unblocked;
            self.send_stored_packets(now);
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == State::BurstFull && self.burst_end.is_some_and(|end| now >= end) {
            self.send_stored_packets(now);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == State::BurstFull {
            self.burst_end
        } else {
            None
        }
    }

    pub fn poll_event(&mut self) -> Option<PacerEvent> {
        self.events.pop_front()
    }

    fn is_high_priority(&self, key: &PacketKey) -> bool {
        self.priority_ssrcs.contains(&key.ssrc)
    }

    fn should_resend(&self, key: &PacketKey, dedup_info: &DedupInfo, now: Instant) -> bool {
        let Some(record) = self.send_history.get(key) else {
            return true;
        };

        // While the audio sent just before this video packet is unacked, an
        // ACK may still be on its way.
        if key.ssrc == self.video_ssrc
            && dedup_info.last_byte_acked_for_audio != 0
            && record.last_byte_sent_for_audio != 0
            && dedup_info.last_byte_acked_for_audio < record.last_byte_sent_for_audio
        {
            return false;
        }

        now.saturating_duration_since(record.time) >= dedup_info.resend_interval
    }

    fn ridiculous_number_of_packets(&self) -> usize {
        let bursts = RIDICULOUS_QUEUE_SECONDS * 1000 / PACING_INTERVAL.as_millis() as u64;
        bursts as usize * self.max_burst_size
    }

    fn history_window_size(&self) -> usize {
        self.max_burst_size
            * (MAX_DEDUPE_WINDOW.as_millis() / PACING_INTERVAL.as_millis()) as usize
    }

    fn pop_next_packet(&mut self) -> Option<(PacketKey, PacketType, PacketRef)> {
        let list = if !self.priority_packet_list.is_empty() {
            &mut self.priority_packet_list
        } else {
            &mut self.packet_list
        };
        list.pop_first()
            .map(|(key, (packet_type, packet))| (key, packet_type, packet))
    }

    fn send_stored_packets(&mut self, now: Instant) {
        let previous_state = self.state;
        self.state = State::Unblocked;
        if self.is_empty() {
            return;
        }

        if !self.has_reached_upper_bound_once && self.len() >= self.ridiculous_number_of_packets()
        {
            error!("pacer queue is too big: {} packets", self.len());
            self.has_reached_upper_bound_once = true;
            self.events
                .push_back(PacerEvent::QueueOverflow { queued: self.len() });
        }

        let burst_over = self.burst_end.is_none_or(|end| now >= end);
        if burst_over || previous_state == State::BurstFull {
            self.current_burst_size = 0;
            self.burst_end = Some(now + PACING_INTERVAL);

            // Aim to flush the queue within a few bursts, and keep a widened
            // burst size for the next bursts too so the rate does not snap
            // back at once.
            let needed = self.len().div_ceil(PACING_MAX_BURSTS_PER_FRAME);
            let burst = needed.clamp(self.target_burst_size, self.max_burst_size);
            self.current_max_burst_size = burst.max(self.next_max_burst_size);
            self.next_max_burst_size = burst.max(self.next_next_max_burst_size);
            self.next_next_max_burst_size = burst;
        }

        while !self.is_empty() {
            if self.current_burst_size >= self.current_max_burst_size {
                self.state = State::BurstFull;
                return;
            }

            let Some((key, packet_type, packet)) = self.pop_next_packet() else {
                break;
            };
            match packet_type {
                PacketType::Resend => {
                    trace!(
                        "retransmit ssrc {} frame {} packet {}",
                        key.ssrc, key.frame_id, key.packet_id
                    );
                    self.events.push_back(PacerEvent::Retransmitted(key));
                }
                PacketType::Normal => {
                    trace!(
                        "send ssrc {} frame {} packet {}",
                        key.ssrc, key.frame_id, key.packet_id
                    );
                }
                PacketType::Rtcp => {}
            }

            let transport_ready = self.sink.send_packet(&packet);

            let last_byte_sent = self.sink.bytes_sent();
            self.last_byte_sent.insert(key.ssrc, last_byte_sent);
            let record = PacketSendRecord {
                time: now,
                last_byte_sent,
                last_byte_sent_for_audio: self.last_byte_sent_for_ssrc(self.audio_ssrc),
            };
            self.send_history.insert(key, record);
            self.send_history_buffer.insert(key, record);

            if !transport_ready {
                self.state = State::TransportBlocked;
                return;
            }
            self.current_burst_size += 1;
        }

        // Two generations of roughly half a second each.
        if self.send_history_buffer.len() >= self.history_window_size() {
            std::mem::swap(&mut self.send_history, &mut self.send_history_buffer);
            self.send_history_buffer.clear();
        }
        self.state = State::Unblocked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUDIO_SSRC: u32 = 0x1234;
    const VIDEO_SSRC: u32 = 0x5678;

    struct TestSink {
        sent: Vec<PacketRef>,
        bytes_sent: u64,
        /// Reports backpressure after this many packets.
        block_after: Option<usize>,
    }

    impl TestSink {
        fn new() -> Self {
            TestSink {
                sent: vec![],
                bytes_sent: 0,
                block_after: None,
            }
        }
    }

    impl PacketSink for TestSink {
        fn send_packet(&mut self, packet: &PacketRef) -> bool {
            self.sent.push(packet.clone());
            self.bytes_sent += packet.len() as u64;
            self.block_after.is_none_or(|n| self.sent.len() < n)
        }

        fn bytes_sent(&self) -> u64 {
            self.bytes_sent
        }
    }

    fn frame_packets(
        capture_time: Instant,
        ssrc: u32,
        frame_id: u32,
        count: u16,
    ) -> SendPacketVector {
        (0..count)
            .map(|packet_id| {
                (
                    PacketKey::new(capture_time, ssrc, frame_id, packet_id),
                    PacketRef::new(vec![packet_id as u8; 100]),
                )
            })
            .collect()
    }

    fn pacer() -> PacedSender<TestSink> {
        let mut pacer = PacedSender::with_burst_sizes(TestSink::new(), 10, 20);
        pacer.register_audio_ssrc(AUDIO_SSRC);
        pacer.register_video_ssrc(VIDEO_SSRC);
        pacer
    }

    #[test]
    fn test_burst_of_25_packets() {
        let now = Instant::now();
        let mut pacer = pacer();

        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 25));
        assert_eq!(pacer.current_max_burst_size(), 10);
        assert_eq!(pacer.sink().sent.len(), 10);
        assert_eq!(pacer.len(), 15);
        assert_eq!(pacer.poll_timeout(), Some(now + PACING_INTERVAL));

        // nothing happens before the burst boundary
        pacer.handle_timeout(now + Duration::from_millis(5));
        assert_eq!(pacer.sink().sent.len(), 10);

        pacer.handle_timeout(now + PACING_INTERVAL);
        assert_eq!(pacer.sink().sent.len(), 20);
        pacer.handle_timeout(now + PACING_INTERVAL * 2);
        assert_eq!(pacer.sink().sent.len(), 25);
        assert!(pacer.is_empty());
        assert_eq!(pacer.poll_timeout(), None);
    }

    #[test]
    fn test_large_queue_widens_burst() {
        let now = Instant::now();
        let mut pacer = pacer();

        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 45));
        assert_eq!(pacer.current_max_burst_size(), 15);
        assert_eq!(pacer.sink().sent.len(), 15);

        // the widened size carries into the following bursts
        pacer.handle_timeout(now + PACING_INTERVAL);
        assert_eq!(pacer.current_max_burst_size(), 15);
        assert_eq!(pacer.sink().sent.len(), 30);

        let mut pacer = self::pacer();
        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 200));
        assert_eq!(pacer.current_max_burst_size(), 20);
    }

    #[test]
    fn test_priority_and_capture_order() {
        let now = Instant::now();
        let later = now + Duration::from_millis(1);
        let mut pacer = pacer();
        pacer.register_priority_ssrc(AUDIO_SSRC);

        // fill the first burst so the rest stays queued
        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 10));
        pacer.send_packets(now, frame_packets(later, VIDEO_SSRC, 2, 1));
        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 1, 1));
        pacer.send_packets(now, frame_packets(later, AUDIO_SSRC, 0, 1));
        assert_eq!(pacer.len(), 3);

        pacer.handle_timeout(now + PACING_INTERVAL);
        let sent = &pacer.sink().sent[10..];
        assert_eq!(sent.len(), 3);
        // audio first, then video by capture time
        let history: Vec<_> = [
            PacketKey::new(later, AUDIO_SSRC, 0, 0),
            PacketKey::new(now, VIDEO_SSRC, 1, 0),
            PacketKey::new(later, VIDEO_SSRC, 2, 0),
        ]
        .iter()
        .map(|key| pacer.last_byte_sent_for_packet(key))
        .collect();
        assert!(history[0] < history[1] && history[1] < history[2]);
    }

    #[test]
    fn test_resend_dedup() {
        let now = Instant::now();
        let mut pacer = pacer();
        let packets = frame_packets(now, VIDEO_SSRC, 0, 1);
        pacer.send_packets(now, packets.clone());
        assert_eq!(pacer.sink().sent.len(), 1);

        let dedup = DedupInfo {
            resend_interval: Duration::from_millis(20),
            last_byte_acked_for_audio: 0,
        };
        pacer.resend_packets(now + Duration::from_millis(10), packets.clone(), dedup);
        assert_eq!(pacer.sink().sent.len(), 1);
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::RetransmissionRejected(packets[0].0))
        );

        pacer.resend_packets(now + Duration::from_millis(20), packets.clone(), dedup);
        assert_eq!(pacer.sink().sent.len(), 2);
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::Retransmitted(packets[0].0))
        );
    }

    /// Sends one audio packet, then one video packet; returns the video
    /// packet and the audio byte count recorded with it.
    fn audio_then_video(pacer: &mut PacedSender<TestSink>, now: Instant) -> (SendPacketVector, u64) {
        pacer.send_packets(now, frame_packets(now, AUDIO_SSRC, 0, 1));
        let video = frame_packets(now, VIDEO_SSRC, 0, 1);
        pacer.send_packets(now, video.clone());
        let audio_bytes = pacer.last_byte_sent_for_ssrc(AUDIO_SSRC);
        assert_eq!(audio_bytes, 100);
        (video, audio_bytes)
    }

    #[test]
    fn test_video_resend_waits_for_preceding_audio_ack() {
        let now = Instant::now();
        let mut pacer = pacer();
        let (video, audio_bytes) = audio_then_video(&mut pacer, now);

        // well past the interval, but the audio before it is still unacked
        let dedup = DedupInfo {
            resend_interval: Duration::from_secs(1),
            last_byte_acked_for_audio: audio_bytes - 1,
        };
        pacer.resend_packets(now + Duration::from_secs(2), video.clone(), dedup);
        assert_eq!(pacer.sink().sent.len(), 2);
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::RetransmissionRejected(video[0].0))
        );

        let dedup = DedupInfo {
            last_byte_acked_for_audio: audio_bytes,
            ..dedup
        };
        pacer.resend_packets(now + Duration::from_secs(2), video.clone(), dedup);
        assert_eq!(pacer.sink().sent.len(), 3);
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::Retransmitted(video[0].0))
        );
    }

    #[test]
    fn test_acked_audio_does_not_bypass_resend_interval() {
        let now = Instant::now();
        let mut pacer = pacer();
        let (video, audio_bytes) = audio_then_video(&mut pacer, now);

        let dedup = DedupInfo {
            resend_interval: Duration::from_secs(1),
            last_byte_acked_for_audio: audio_bytes,
        };
        pacer.resend_packets(now + Duration::from_millis(1), video.clone(), dedup);
        assert_eq!(pacer.sink().sent.len(), 2);
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::RetransmissionRejected(video[0].0))
        );
    }

    #[test]
    fn test_audio_resend_ignores_audio_ack_state() {
        let now = Instant::now();
        let mut pacer = pacer();
        let audio = frame_packets(now, AUDIO_SSRC, 0, 1);
        pacer.send_packets(now, audio.clone());
        pacer.send_packets(now, frame_packets(now, AUDIO_SSRC, 1, 1));

        // audio packets only obey the interval
        let dedup = DedupInfo {
            resend_interval: Duration::from_millis(20),
            last_byte_acked_for_audio: 1,
        };
        pacer.resend_packets(now + Duration::from_millis(20), audio, dedup);
        assert_eq!(pacer.sink().sent.len(), 3);
    }

    #[test]
    fn test_never_sent_packet_is_resent() {
        let now = Instant::now();
        let mut pacer = pacer();
        pacer.resend_packets(
            now,
            frame_packets(now, VIDEO_SSRC, 0, 1),
            DedupInfo {
                resend_interval: Duration::from_secs(10),
                last_byte_acked_for_audio: 0,
            },
        );
        assert_eq!(pacer.sink().sent.len(), 1);
    }

    #[test]
    fn test_cancel_sending_packet() {
        let now = Instant::now();
        let mut pacer = pacer();
        let packets = frame_packets(now, VIDEO_SSRC, 0, 12);
        let last_key = packets[11].0;
        pacer.send_packets(now, packets);
        assert_eq!(pacer.len(), 2);

        pacer.cancel_sending_packet(&last_key);
        assert_eq!(pacer.len(), 1);
        pacer.handle_timeout(now + PACING_INTERVAL);
        assert_eq!(pacer.sink().sent.len(), 11);
        assert_eq!(pacer.last_byte_sent_for_packet(&last_key), 0);
    }

    #[test]
    fn test_transport_backpressure() {
        let now = Instant::now();
        let mut pacer = pacer();
        pacer.sink_mut().block_after = Some(3);

        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 5));
        assert_eq!(pacer.sink().sent.len(), 3);
        assert!(pacer.is_transport_blocked());
        assert_eq!(pacer.poll_timeout(), None);

        // RTCP waits while blocked, then leaves first
        let rtcp = PacketRef::new(vec![0x80, 200, 0, 6]);
        pacer.send_rtcp_packet(VIDEO_SSRC, rtcp.clone());
        assert_eq!(pacer.len(), 3);

        pacer.sink_mut().block_after = None;
        pacer.on_transport_ready(now + Duration::from_millis(1));
        assert_eq!(pacer.sink().sent.len(), 6);
        assert_eq!(pacer.sink().sent[3], rtcp);
        assert!(!pacer.is_transport_blocked());
    }

    #[test]
    fn test_rtcp_bypasses_pacing() {
        let now = Instant::now();
        let mut pacer = pacer();
        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, 25));
        assert_eq!(pacer.sink().sent.len(), 10);

        pacer.send_rtcp_packet(VIDEO_SSRC, PacketRef::new(vec![0x80, 200, 0, 6]));
        assert_eq!(pacer.sink().sent.len(), 11);
        assert_eq!(pacer.len(), 15);
    }

    #[test]
    fn test_queue_overflow_reported_once() {
        let now = Instant::now();
        let mut pacer = PacedSender::with_burst_sizes(TestSink::new(), 1, 1);
        let limit = pacer.ridiculous_number_of_packets();
        pacer.send_packets(now, frame_packets(now, VIDEO_SSRC, 0, limit as u16 + 1));
        assert_eq!(
            pacer.poll_event(),
            Some(PacerEvent::QueueOverflow { queued: limit + 1 })
        );

        pacer.handle_timeout(now + PACING_INTERVAL);
        assert_eq!(pacer.poll_event(), None);
    }
}
