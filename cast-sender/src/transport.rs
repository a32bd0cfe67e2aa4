//! The packet layer shared by the audio and the video stream: packetizing,
//! retransmission storage, encryption and RTCP, all over one pacer.

use bytes::BytesMut;
use log::{debug, error, trace, warn};
use rtcp::cast_feedback::{CastMessage, MissingFramesAndPacketsMap, PacketIdSet};
use rtcp::receiver_log::ReceiverLogFrame;
use rtp::packet_storage::{MAX_UNACKED_FRAMES, PacketStorage};
use rtp::packetizer::{PacketizerConfig, RtpPacketizer};
use rtp::{ALL_PACKETS_LOST, EncodedFrame, LAST_PACKET, PacketKey, SendPacketVector};
use shared::crypto::FrameEncryptor;
use shared::error::Result;
use shared::time::SystemInstant;
use shared::util::{is_rtcp, packet_ssrc};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::config::{FrameSenderConfig, StreamKind, TransportOptions};
use crate::pacer::{DedupInfo, OutboundQueue, PacedSender, PacerEvent, PacketSink};
use crate::rtcp_session::{RtcpSession, RtcpSessionEvent};

/// What the packet layer reports to the frame senders and the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RoundTripTime {
        ssrc: u32,
        rtt: Duration,
    },
    /// Feedback for the stream sent from `ssrc`. NACKed packets have already
    /// been queued for retransmission.
    CastMessage {
        ssrc: u32,
        message: CastMessage,
    },
    ReceiverLog {
        ssrc: u32,
        frames: Vec<ReceiverLogFrame>,
    },
    RetransmissionRejected(PacketKey),
    PacerQueueOverflow {
        queued: usize,
    },
}

struct TransportStream {
    kind: StreamKind,
    packetizer: RtpPacketizer,
    storage: PacketStorage,
    encryptor: Option<FrameEncryptor>,
    rtcp: RtcpSession,
}

impl TransportStream {
    fn ssrc(&self) -> u32 {
        self.packetizer.ssrc()
    }

    /// Transport byte counter after the last packet of `frame_id`, or 0.
    fn last_byte_sent_for_frame<S: PacketSink>(&self, pacer: &PacedSender<S>, frame_id: u32) -> u64 {
        self.storage
            .get_frame8(frame_id as u8)
            .and_then(|packets| packets.last())
            .map(|(key, _)| pacer.last_byte_sent_for_packet(key))
            .unwrap_or(0)
    }
}

/// Multiplexes one audio and one video stream onto a shared
/// [`PacedSender`].
///
/// Operations addressed to an SSRC that no stream owns are caller bugs and
/// panic.
pub struct CastTransport<S = OutboundQueue> {
    pacer: PacedSender<S>,
    clock: SystemInstant,

    audio: Option<TransportStream>,
    video: Option<TransportStream>,

    /// Peers we accept packets from.
    valid_ssrcs: HashSet<u32>,
    last_byte_acked_for_audio: u64,

    events: VecDeque<TransportEvent>,
}

impl<S: PacketSink> CastTransport<S> {
    pub fn new(sink: S, options: &TransportOptions, clock: SystemInstant) -> Self {
        CastTransport {
            pacer: PacedSender::with_burst_sizes(
                sink,
                options.pacer_target_burst_size,
                options.pacer_max_burst_size,
            ),
            clock,

            audio: None,
            video: None,

            valid_ssrcs: HashSet::new(),
            last_byte_acked_for_audio: 0,

            events: VecDeque::new(),
        }
    }

    /// Sets up the packet layer of a stream. The configuration must have
    /// been validated.
    pub fn initialize_stream(&mut self, kind: StreamKind, config: &FrameSenderConfig) -> Result<()> {
        let encryptor = FrameEncryptor::from_config(&config.aes_key, &config.aes_iv_mask)?;
        let stream = TransportStream {
            kind,
            packetizer: RtpPacketizer::new(PacketizerConfig {
                payload_type: config.rtp_payload_type,
                max_payload_length: config.max_payload_size,
                ssrc: config.sender_ssrc,
                ..Default::default()
            }),
            storage: PacketStorage::new(MAX_UNACKED_FRAMES),
            encryptor,
            rtcp: RtcpSession::new(config.sender_ssrc, config.receiver_ssrc, self.clock),
        };

        match kind {
            StreamKind::Audio => {
                self.pacer.register_audio_ssrc(config.sender_ssrc);
                // audio goes ahead of video
                self.pacer.register_priority_ssrc(config.sender_ssrc);
                self.audio = Some(stream);
            }
            StreamKind::Video => {
                self.pacer.register_video_ssrc(config.sender_ssrc);
                self.video = Some(stream);
            }
        }
        self.valid_ssrcs.insert(config.receiver_ssrc);
        debug!(
            "{} stream initialized: ssrc {}, receiver ssrc {}",
            kind, config.sender_ssrc, config.receiver_ssrc
        );
        Ok(())
    }

    /// Accepts packets from `ssrc` for the upper layer.
    pub fn add_valid_ssrc(&mut self, ssrc: u32) {
        self.valid_ssrcs.insert(ssrc);
    }

    pub fn pacer(&self) -> &PacedSender<S> {
        &self.pacer
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.pacer.sink_mut()
    }

    pub fn rtcp_session(&self, ssrc: u32) -> &RtcpSession {
        &stream_ref(&self.audio, &self.video, ssrc).rtcp
    }

    pub fn current_round_trip_time(&self, ssrc: u32) -> Option<Duration> {
        self.rtcp_session(ssrc).current_round_trip_time()
    }

    /// Encrypts, packetizes, stores and queues `frame`.
    pub fn insert_frame(&mut self, now: Instant, ssrc: u32, frame: &EncodedFrame) {
        let stream = stream_mut(&mut self.audio, &mut self.video, ssrc);

        let packets = match &stream.encryptor {
            Some(encryptor) => {
                let payload = encryptor.encrypt(frame.frame_id, &frame.data);
                stream.packetizer.packetize(frame, &payload)
            }
            None => stream.packetizer.packetize(frame, &frame.data),
        };
        let packets = match packets {
            Ok(packets) => packets,
            Err(err) => {
                error!(
                    "ssrc {}: failed to packetize frame {}: {}",
                    ssrc, frame.frame_id, err
                );
                return;
            }
        };

        trace!(
            "ssrc {}: frame {} in {} packets",
            ssrc,
            frame.frame_id,
            packets.len()
        );
        stream.storage.store_frame(frame.frame_id, packets.clone());
        self.pacer.send_packets(now, packets);
    }

    /// Drops the frames from storage and unqueues whatever of them has not
    /// gone out yet.
    pub fn cancel_sending_frames(&mut self, ssrc: u32, frame_ids: &[u32]) {
        let stream = stream_mut(&mut self.audio, &mut self.video, ssrc);
        for &frame_id in frame_ids {
            if let Some(packets) = stream.storage.get_frame(frame_id) {
                for (key, _) in packets {
                    self.pacer.cancel_sending_packet(key);
                }
            }
            stream.storage.release_frame(frame_id);
        }
    }

    /// Resends the last packet of `frame_id` so the receiver reports what it
    /// is missing.
    pub fn resend_frame_for_kickstart(&mut self, now: Instant, ssrc: u32, frame_id: u32) {
        let dedup_info = DedupInfo {
            resend_interval: self.current_round_trip_time(ssrc).unwrap_or_default(),
            ..Default::default()
        };
        let mut missing = MissingFramesAndPacketsMap::new();
        missing.insert(frame_id, PacketIdSet::from([LAST_PACKET]));
        debug!("ssrc {}: kickstart frame {}", ssrc, frame_id);
        self.resend_packets(now, ssrc, &missing, false, dedup_info);
    }

    /// Queues retransmission of the listed packets. With
    /// `cancel_rtx_if_not_listed`, queued retransmissions of other packets of
    /// the same frames are dropped.
    pub fn resend_packets(
        &mut self,
        now: Instant,
        ssrc: u32,
        missing_frames_and_packets: &MissingFramesAndPacketsMap,
        cancel_rtx_if_not_listed: bool,
        dedup_info: DedupInfo,
    ) {
        let stream = stream_mut(&mut self.audio, &mut self.video, ssrc);

        for (&frame_id, missing_packets) in missing_frames_and_packets {
            let Some(stored_packets) = stream.storage.get_frame8(frame_id as u8) else {
                trace!("ssrc {}: frame {} is no longer stored", ssrc, frame_id);
                continue;
            };
            let resend_all = missing_packets.contains(&ALL_PACKETS_LOST);
            let resend_last = missing_packets.contains(&LAST_PACKET);

            let mut packets_to_resend = SendPacketVector::new();
            for (index, (key, packet)) in stored_packets.iter().enumerate() {
                let is_last = index + 1 == stored_packets.len();
                let resend = resend_all
                    || missing_packets.contains(&key.packet_id)
                    || (resend_last && is_last);
                if resend {
                    let mut packet = packet.clone();
                    packet.set_sequence_number(stream.packetizer.next_sequence_number());
                    packets_to_resend.push((*key, packet));
                } else if cancel_rtx_if_not_listed {
                    self.pacer.cancel_sending_packet(key);
                }
            }
            self.pacer.resend_packets(now, packets_to_resend, dedup_info);
        }
    }

    /// Sends a sender report for the stream of `ssrc`, bypassing pacing.
    pub fn send_sender_report(&mut self, now: Instant, ssrc: u32, rtp_timestamp: u32) {
        let stream = stream_mut(&mut self.audio, &mut self.video, ssrc);
        let report = stream.rtcp.build_sender_report(
            now,
            rtp_timestamp,
            stream.packetizer.send_packet_count(),
            stream.packetizer.send_octet_count(),
        );
        match report {
            Ok(packet) => self.pacer.send_rtcp_packet(ssrc, packet),
            Err(err) => warn!("ssrc {}: failed to build sender report: {}", ssrc, err),
        }
    }

    /// Routes an inbound datagram. RTCP for one of the streams is consumed;
    /// any other packet from a valid SSRC is handed back for the upper layer.
    pub fn handle_read(&mut self, now: Instant, packet: BytesMut) -> Option<BytesMut> {
        let Some(ssrc) = packet_ssrc(&packet) else {
            trace!("dropping runt packet of {} bytes", packet.len());
            return None;
        };
        if !self.valid_ssrcs.contains(&ssrc) {
            trace!("dropping packet from unknown ssrc {}", ssrc);
            return None;
        }

        if is_rtcp(&packet) {
            for kind in [StreamKind::Audio, StreamKind::Video] {
                let stream = match kind {
                    StreamKind::Audio => self.audio.as_mut(),
                    StreamKind::Video => self.video.as_mut(),
                };
                if let Some(stream) = stream
                    && stream.rtcp.incoming_rtcp_packet(now, &packet)
                {
                    self.process_session_events(now, kind);
                    return None;
                }
            }
        }

        Some(packet)
    }

    pub fn on_transport_ready(&mut self, now: Instant) {
        self.pacer.on_transport_ready(now);
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.pacer.handle_timeout(now);
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pacer.poll_timeout()
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        while let Some(event) = self.pacer.poll_event() {
            match event {
                PacerEvent::RetransmissionRejected(key) => self
                    .events
                    .push_back(TransportEvent::RetransmissionRejected(key)),
                PacerEvent::QueueOverflow { queued } => self
                    .events
                    .push_back(TransportEvent::PacerQueueOverflow { queued }),
                PacerEvent::Retransmitted(_) => {}
            }
        }
        self.events.pop_front()
    }

    fn process_session_events(&mut self, now: Instant, kind: StreamKind) {
        loop {
            let stream = match kind {
                StreamKind::Audio => self.audio.as_mut(),
                StreamKind::Video => self.video.as_mut(),
            };
            let Some(stream) = stream else {
                return;
            };
            let ssrc = stream.ssrc();
            let Some(event) = stream.rtcp.poll_event() else {
                return;
            };

            match event {
                RtcpSessionEvent::RoundTripTime(rtt) => {
                    self.events
                        .push_back(TransportEvent::RoundTripTime { ssrc, rtt });
                }
                RtcpSessionEvent::CastMessage(message) => {
                    self.on_received_cast_message(now, ssrc, &message);
                    self.events
                        .push_back(TransportEvent::CastMessage { ssrc, message });
                }
                RtcpSessionEvent::ReceiverLog(frames) => {
                    self.events
                        .push_back(TransportEvent::ReceiverLog { ssrc, frames });
                }
            }
        }
    }

    fn on_received_cast_message(&mut self, now: Instant, ssrc: u32, message: &CastMessage) {
        let mut dedup_info = DedupInfo::default();
        let stream = stream_ref(&self.audio, &self.video, ssrc);
        match stream.kind {
            StreamKind::Audio => {
                let acked_bytes = stream.last_byte_sent_for_frame(&self.pacer, message.ack_frame_id);
                self.last_byte_acked_for_audio = self.last_byte_acked_for_audio.max(acked_bytes);
            }
            StreamKind::Video => {
                dedup_info.resend_interval =
                    stream.rtcp.current_round_trip_time().unwrap_or_default();
                // cross-stream dedup only works with an audio stream
                if self.audio.is_some() {
                    dedup_info.last_byte_acked_for_audio = self.last_byte_acked_for_audio;
                }
            }
        }

        if message.has_nacks() {
            self.resend_packets(now, ssrc, &message.missing_frames_and_packets, true, dedup_info);
        }
    }
}

fn stream_ref<'a>(
    audio: &'a Option<TransportStream>,
    video: &'a Option<TransportStream>,
    ssrc: u32,
) -> &'a TransportStream {
    [audio, video]
        .into_iter()
        .flatten()
        .find(|stream| stream.ssrc() == ssrc)
        .unwrap_or_else(|| panic!("no stream sends from ssrc {ssrc}"))
}

fn stream_mut<'a>(
    audio: &'a mut Option<TransportStream>,
    video: &'a mut Option<TransportStream>,
    ssrc: u32,
) -> &'a mut TransportStream {
    [audio, video]
        .into_iter()
        .flatten()
        .find(|stream| stream.ssrc() == ssrc)
        .unwrap_or_else(|| panic!("no stream sends from ssrc {ssrc}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtcp::compound::{ReceiverPacketParams, RtcpBuilder};
    use rtp::Dependency;
    use rtp::parser::RtpParser;

    fn clock(now: Instant) -> SystemInstant {
        SystemInstant::new(now, Duration::from_secs(1_700_000_000))
    }

    fn transport(now: Instant) -> CastTransport {
        let mut transport =
            CastTransport::new(OutboundQueue::new(None), &TransportOptions::default(), clock(now));
        transport
            .initialize_stream(StreamKind::Audio, &FrameSenderConfig::audio())
            .unwrap();
        transport
            .initialize_stream(StreamKind::Video, &FrameSenderConfig::video())
            .unwrap();
        transport
    }

    fn frame(frame_id: u32, now: Instant, size: usize) -> EncodedFrame {
        EncodedFrame::new(
            Dependency::Key,
            frame_id,
            frame_id * 3000,
            now,
            Bytes::from(vec![frame_id as u8; size]),
        )
    }

    fn drain(transport: &mut CastTransport) -> Vec<Vec<u8>> {
        let mut packets = vec![];
        while let Some(packet) = transport.sink_mut().pop() {
            packets.push(packet.to_vec());
        }
        packets
    }

    fn feedback(ack_frame_id: u32, missing: MissingFramesAndPacketsMap) -> Vec<u8> {
        let video = FrameSenderConfig::video();
        let mut builder = RtcpBuilder::new(video.receiver_ssrc);
        let message = CastMessage {
            media_ssrc: video.sender_ssrc,
            ack_frame_id,
            missing_frames_and_packets: missing,
            target_delay: Duration::from_millis(100),
        };
        builder
            .build_receiver_packet(&ReceiverPacketParams {
                cast_message: Some(&message),
                ..Default::default()
            })
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_insert_frame_is_packetized_and_sent() {
        let now = Instant::now();
        let mut transport = transport(now);
        let video_ssrc = FrameSenderConfig::video().sender_ssrc;

        transport.insert_frame(now, video_ssrc, &frame(0, now, 3000));
        let packets = drain(&mut transport);
        assert_eq!(packets.len(), 3);

        let mut parser = RtpParser::new(video_ssrc, FrameSenderConfig::video().rtp_payload_type);
        let (parsed, _) = parser.parse_packet(&packets[2]).unwrap();
        assert_eq!(parsed.packet_id, 2);
        assert_eq!(parsed.max_packet_id, 2);
    }

    #[test]
    fn test_nack_triggers_resend_with_new_sequence_number() {
        let now = Instant::now();
        let mut transport = transport(now);
        let video_ssrc = FrameSenderConfig::video().sender_ssrc;

        transport.insert_frame(now, video_ssrc, &frame(0, now, 3000));
        let sent = drain(&mut transport);

        let mut missing = MissingFramesAndPacketsMap::new();
        missing.insert(0, PacketIdSet::from([1]));
        let later = now + Duration::from_millis(20);
        assert!(transport
            .handle_read(later, BytesMut::from(&feedback(0, missing)[..]))
            .is_none());

        let resent = drain(&mut transport);
        assert_eq!(resent.len(), 1);
        // same payload, fresh sequence number
        assert_eq!(resent[0][12..], sent[1][12..]);
        assert_ne!(resent[0][2..4], sent[1][2..4]);

        match transport.poll_event() {
            Some(TransportEvent::CastMessage { ssrc, message }) => {
                assert_eq!(ssrc, video_ssrc);
                assert_eq!(message.ack_frame_id, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_kickstart_resends_last_packet() {
        let now = Instant::now();
        let mut transport = transport(now);
        let video_ssrc = FrameSenderConfig::video().sender_ssrc;

        transport.insert_frame(now, video_ssrc, &frame(0, now, 3000));
        let sent = drain(&mut transport);

        transport.resend_frame_for_kickstart(now + Duration::from_millis(20), video_ssrc, 0);
        let resent = drain(&mut transport);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0][12..], sent[2][12..]);
    }

    #[test]
    fn test_cancelled_frame_cannot_be_resent() {
        let now = Instant::now();
        let mut transport = transport(now);
        let video_ssrc = FrameSenderConfig::video().sender_ssrc;

        transport.insert_frame(now, video_ssrc, &frame(0, now, 100));
        drain(&mut transport);
        transport.cancel_sending_frames(video_ssrc, &[0]);

        transport.resend_frame_for_kickstart(now + Duration::from_millis(20), video_ssrc, 0);
        assert!(drain(&mut transport).is_empty());
    }

    #[test]
    fn test_sender_report_bypasses_pacing() {
        let now = Instant::now();
        let mut transport = transport(now);
        let audio_ssrc = FrameSenderConfig::audio().sender_ssrc;

        transport.send_sender_report(now, audio_ssrc, 1234);
        let packets = drain(&mut transport);
        assert_eq!(packets.len(), 1);
        assert!(is_rtcp(&packets[0]));
    }

    #[test]
    fn test_inbound_routing() {
        let now = Instant::now();
        let mut transport = transport(now);

        // RTP from an unknown peer is dropped
        let mut rtp = vec![0x80, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0x99];
        assert!(transport.handle_read(now, BytesMut::from(&rtp[..])).is_none());

        // and handed up once the peer is allowed
        transport.add_valid_ssrc(0x99);
        assert!(transport.handle_read(now, BytesMut::from(&rtp[..])).is_some());

        // the receiver ssrcs are valid from the start
        rtp[11] = FrameSenderConfig::video().receiver_ssrc as u8;
        assert!(transport.handle_read(now, BytesMut::from(&rtp[..])).is_some());
    }

    #[test]
    #[should_panic(expected = "no stream sends from ssrc")]
    fn test_unknown_ssrc_panics() {
        let now = Instant::now();
        let mut transport = transport(now);
        transport.insert_frame(now, 0xdead, &frame(0, now, 10));
    }
}
