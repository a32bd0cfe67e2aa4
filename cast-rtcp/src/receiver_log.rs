use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use std::collections::VecDeque;

use crate::header::{
    CAST_IDENTIFIER, HEADER_LENGTH, Header, PacketType, SSRC_LENGTH, SUBTYPE_RECEIVER_LOG,
    unmarshal_expected,
};

/// Most events one frame entry can carry; the count travels as `n - 1` in a byte.
pub const MAX_RECEIVER_LOG_MESSAGES: usize = 256;
/// Largest event time offset from its frame's base time.
pub const MAX_WIRE_FORMAT_TIME_DELTA_MS: u64 = 4095;

/// Reports kept for redundant re-sending.
pub const RECEIVE_LOG_MESSAGE_HISTORY_SIZE: usize = 60;
/// Reports this many builds back are appended again when space remains.
pub const FIRST_REDUNDANCY_OFFSET: usize = 10;
pub const SECOND_REDUNDANCY_OFFSET: usize = 20;

const CAST_LOG_HEADER_LENGTH: usize = HEADER_LENGTH + SSRC_LENGTH + 4;
const FRAME_LOG_LENGTH: usize = 8;
const EVENT_LOG_LENGTH: usize = 4;
const MAX_TIMESTAMP_BASE: u64 = 0x00ff_ffff;

/// Receiver side events a Cast receiver reports back.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CastLoggingEvent {
    #[default]
    Unknown,
    FrameAckSent,
    FramePlayout,
    FrameDecoded,
    PacketReceived,
}

impl CastLoggingEvent {
    pub fn to_wire(self) -> u8 {
        match self {
            CastLoggingEvent::FrameAckSent => 11,
            CastLoggingEvent::FramePlayout => 12,
            CastLoggingEvent::FrameDecoded => 13,
            CastLoggingEvent::PacketReceived => 14,
            CastLoggingEvent::Unknown => 0,
        }
    }

    pub fn from_wire(wire: u8) -> Self {
        match wire {
            11 => CastLoggingEvent::FrameAckSent,
            12 => CastLoggingEvent::FramePlayout,
            13 => CastLoggingEvent::FrameDecoded,
            14 => CastLoggingEvent::PacketReceived,
            _ => CastLoggingEvent::Unknown,
        }
    }
}

/// One logged receiver event.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverLogEvent {
    pub kind: CastLoggingEvent,
    /// Time of the event on the receiver's clock, in milliseconds.
    pub event_timestamp_ms: u64,
    /// Playout delay relative to the target, for frame events.
    pub delay_delta_ms: i16,
    /// Packet id, for packet events.
    pub packet_id: u16,
}

impl ReceiverLogEvent {
    fn merged_type_and_delta(&self, base_ms: u64) -> Result<u16> {
        let delta = self
            .event_timestamp_ms
            .checked_sub(base_ms)
            .filter(|d| *d <= MAX_WIRE_FORMAT_TIME_DELTA_MS)
            .ok_or(Error::ErrReceiverLogDeltaOutOfRange)?;
        Ok(((self.kind.to_wire() as u16) << 12) | delta as u16)
    }
}

/// Events of one frame, identified by its RTP timestamp.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReceiverLogFrame {
    pub rtp_timestamp: u32,
    pub events: Vec<ReceiverLogEvent>,
}

impl ReceiverLogFrame {
    fn wire_size(&self) -> usize {
        FRAME_LOG_LENGTH + self.events.len() * EVENT_LOG_LENGTH
    }
}

/// Cast receiver log: application defined packet, subtype 2, name "CAST".
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReceiverLog {
    pub sender_ssrc: u32,
    pub frames: Vec<ReceiverLogFrame>,
}

impl MarshalSize for ReceiverLog {
    fn marshal_size(&self) -> usize {
        CAST_LOG_HEADER_LENGTH
            + self
                .frames
                .iter()
                .map(ReceiverLogFrame::wire_size)
                .sum::<usize>()
    }
}

impl Marshal for ReceiverLog {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }

        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|subtype=2|   PT=APP=204  |             length            |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                           SSRC                                |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |  'C'          |  'A'          |  'S'          |  'T'          |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                     RTP timestamp of frame                    |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * | # events - 1  |         event timestamp base (ms)             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |   delay delta or packet id    | type  |  event time delta ms  |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let n = Header::new(
            PacketType::ApplicationDefined,
            SUBTYPE_RECEIVER_LOG,
            self.marshal_size(),
        )
        .marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(CAST_IDENTIFIER);

        for frame in &self.frames {
            if frame.events.is_empty() || frame.events.len() > MAX_RECEIVER_LOG_MESSAGES {
                return Err(Error::ErrTooManyReceiverLogEvents);
            }
            let base_ms = frame.events[0].event_timestamp_ms;
            buf.put_u32(frame.rtp_timestamp);
            buf.put_u8((frame.events.len() - 1) as u8);
            let wire_base = base_ms & MAX_TIMESTAMP_BASE;
            buf.put_u8((wire_base >> 16) as u8);
            buf.put_u16(wire_base as u16);

            for event in &frame.events {
                let merged = event.merged_type_and_delta(base_ms)?;
                match event.kind {
                    CastLoggingEvent::PacketReceived => buf.put_u16(event.packet_id),
                    _ => buf.put_i16(event.delay_delta_ms),
                }
                buf.put_u16(merged);
            }
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for ReceiverLog {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = unmarshal_expected(raw_packet, PacketType::ApplicationDefined)?;
        if header.count != SUBTYPE_RECEIVER_LOG {
            return Err(Error::ErrWrongType);
        }
        if header.packet_size() < CAST_LOG_HEADER_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }
        let mut remaining = header.packet_size() - CAST_LOG_HEADER_LENGTH;

        let sender_ssrc = raw_packet.get_u32();
        if raw_packet.get_u32() != CAST_IDENTIFIER {
            raw_packet.advance(remaining);
            return Err(Error::ErrBadCastIdentifier);
        }

        let mut frames = vec![];
        while remaining >= FRAME_LOG_LENGTH {
            let rtp_timestamp = raw_packet.get_u32();
            let num_events = raw_packet.get_u8() as usize + 1;
            let base_ms = ((raw_packet.get_u8() as u64) << 16) | raw_packet.get_u16() as u64;
            remaining -= FRAME_LOG_LENGTH;
            if remaining < num_events * EVENT_LOG_LENGTH {
                return Err(Error::ErrPacketTooShort);
            }

            let mut events = Vec::with_capacity(num_events);
            for _ in 0..num_events {
                let delay_delta_or_packet_id = raw_packet.get_u16();
                let type_and_delta = raw_packet.get_u16();
                let kind = CastLoggingEvent::from_wire((type_and_delta >> 12) as u8);
                let mut event = ReceiverLogEvent {
                    kind,
                    event_timestamp_ms: base_ms + (type_and_delta & 0x0fff) as u64,
                    ..Default::default()
                };
                match kind {
                    CastLoggingEvent::PacketReceived => event.packet_id = delay_delta_or_packet_id,
                    _ => event.delay_delta_ms = delay_delta_or_packet_id as i16,
                }
                events.push(event);
            }
            remaining -= num_events * EVENT_LOG_LENGTH;
            frames.push(ReceiverLogFrame {
                rtp_timestamp,
                events,
            });
        }
        raw_packet.advance(remaining);

        Ok(ReceiverLog {
            sender_ssrc,
            frames,
        })
    }
}

/// Groups `(rtp_timestamp, event)` pairs into wire-valid frame entries.
///
/// A frame whose events span more than 4095 ms, or that has more than 256
/// events, is split over several entries with the same RTP timestamp.
pub fn frames_for_wire(events: &[(u32, ReceiverLogEvent)]) -> Vec<ReceiverLogFrame> {
    let mut sorted = events.to_vec();
    sorted.sort_by_key(|(rtp_timestamp, event)| (*rtp_timestamp, event.event_timestamp_ms));

    let mut frames: Vec<ReceiverLogFrame> = vec![];
    for (rtp_timestamp, event) in sorted {
        let fits = frames.last().is_some_and(|frame| {
            frame.rtp_timestamp == rtp_timestamp
                && frame.events.len() < MAX_RECEIVER_LOG_MESSAGES
                && event.event_timestamp_ms - frame.events[0].event_timestamp_ms
                    <= MAX_WIRE_FORMAT_TIME_DELTA_MS
        });
        match frames.last_mut() {
            Some(frame) if fits => frame.events.push(event),
            _ => frames.push(ReceiverLogFrame {
                rtp_timestamp,
                events: vec![event],
            }),
        }
    }
    frames
}

/// Builds receiver log reports under a byte budget and re-sends older reports
/// for redundancy, since RTCP may be lost.
#[derive(Default, Debug)]
pub struct ReceiverLogHistory {
    history: VecDeque<Vec<ReceiverLogFrame>>,
}

impl ReceiverLogHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the newest events that fit in `max_size` bytes of a receiver
    /// log packet, then appends the reports built 10 and 20 calls ago while
    /// space remains.
    pub fn build_report(
        &mut self,
        events: &[(u32, ReceiverLogEvent)],
        max_size: usize,
    ) -> Vec<ReceiverLogFrame> {
        if max_size < CAST_LOG_HEADER_LENGTH {
            return vec![];
        }
        let mut remaining_space = max_size - CAST_LOG_HEADER_LENGTH;

        let mut fresh: Vec<ReceiverLogFrame> = vec![];
        for frame in frames_for_wire(events).into_iter().rev() {
            if remaining_space < FRAME_LOG_LENGTH + EVENT_LOG_LENGTH {
                break;
            }
            let room = (remaining_space - FRAME_LOG_LENGTH) / EVENT_LOG_LENGTH;
            let mut frame = frame;
            if frame.events.len() > room {
                // keep the newest events of the frame
                frame.events.drain(..frame.events.len() - room);
            }
            remaining_space -= frame.wire_size();
            fresh.push(frame);
        }
        fresh.reverse();

        self.history.push_front(fresh.clone());

        let mut report = fresh;
        for offset in [FIRST_REDUNDANCY_OFFSET, SECOND_REDUNDANCY_OFFSET] {
            if let Some(old) = self.history.get(offset) {
                for frame in old {
                    if frame.wire_size() > remaining_space {
                        break;
                    }
                    remaining_space -= frame.wire_size();
                    report.push(frame.clone());
                }
            }
        }

        if self.history.len() > RECEIVE_LOG_MESSAGE_HISTORY_SIZE {
            self.history.pop_back();
        }
        report
    }
}
