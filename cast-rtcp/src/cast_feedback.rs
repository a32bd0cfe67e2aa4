use bytes::{Buf, BufMut};
use rtp::packet::ALL_PACKETS_LOST;
use rtp::wrap::{FrameIdWrapHelper, expand_truncated};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::header::{
    CAST_IDENTIFIER, FORMAT_CAST_FEEDBACK, HEADER_LENGTH, Header, PacketType, unmarshal_expected,
};

/// Most loss fields one feedback packet may carry.
pub const MAX_CAST_LOSS_FIELDS: usize = 100;

const CAST_FEEDBACK_BODY_LENGTH: usize = 16;
const LOSS_FIELD_LENGTH: usize = 4;

pub type PacketIdSet = BTreeSet<u16>;
/// Missing packets per frame. A set holding [`ALL_PACKETS_LOST`] means the
/// whole frame is missing.
pub type MissingFramesAndPacketsMap = BTreeMap<u32, PacketIdSet>;

/// ACK and NACK state reported by a receiver, with frame ids in the 32-bit
/// space of the session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CastMessage {
    /// SSRC of the media stream the feedback is about.
    pub media_ssrc: u32,
    /// Every frame up to and including this one has been received.
    pub ack_frame_id: u32,
    pub missing_frames_and_packets: MissingFramesAndPacketsMap,
    /// Playout delay the receiver is targeting.
    pub target_delay: Duration,
}

impl CastMessage {
    /// Widens a wire feedback message; the ACK id goes through `ack_wrap`.
    pub fn from_feedback(feedback: &CastFeedback, ack_wrap: &mut FrameIdWrapHelper) -> Self {
        let ack_frame_id = ack_wrap.map_to_32bits_frame_id(feedback.ack_frame_id);

        let mut missing_frames_and_packets = MissingFramesAndPacketsMap::new();
        for field in &feedback.loss_fields {
            let frame_id = expand_truncated(field.frame_id, ack_frame_id);
            let packets = missing_frames_and_packets.entry(frame_id).or_default();
            packets.insert(field.packet_id);
            if field.packet_id != ALL_PACKETS_LOST {
                for i in 0..8u16 {
                    if field.bitmask & (1 << i) != 0 {
                        packets.insert(field.packet_id.wrapping_add(i + 1));
                    }
                }
            }
        }

        CastMessage {
            media_ssrc: feedback.media_ssrc,
            ack_frame_id,
            missing_frames_and_packets,
            target_delay: Duration::from_millis(feedback.target_delay_ms as u64),
        }
    }

    pub fn has_nacks(&self) -> bool {
        !self.missing_frames_and_packets.is_empty()
    }
}

/// One NACK entry: a missing packet plus a bitmask of the eight packet ids
/// that follow it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CastLossField {
    pub frame_id: u8,
    pub packet_id: u16,
    pub bitmask: u8,
}

/// Cast feedback as it travels: payload specific feedback, FMT 15, name
/// "CAST".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CastFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub ack_frame_id: u8,
    pub target_delay_ms: u16,
    pub loss_fields: Vec<CastLossField>,
}

impl CastFeedback {
    /// Packs `message` into at most `max_loss_fields` loss fields.
    ///
    /// A fully missing frame takes one field. Otherwise each field starts at
    /// the lowest missing packet not yet covered and marks up to eight
    /// following missing ids in its bitmask.
    pub fn from_message(sender_ssrc: u32, message: &CastMessage, max_loss_fields: usize) -> Self {
        let max_loss_fields = max_loss_fields.min(MAX_CAST_LOSS_FIELDS);
        let mut loss_fields = Vec::new();

        'frames: for (frame_id, packets) in &message.missing_frames_and_packets {
            if loss_fields.len() >= max_loss_fields {
                break;
            }
            if packets.is_empty() || packets.contains(&ALL_PACKETS_LOST) {
                loss_fields.push(CastLossField {
                    frame_id: *frame_id as u8,
                    packet_id: ALL_PACKETS_LOST,
                    bitmask: 0,
                });
                continue;
            }

            let mut it = packets.iter().peekable();
            while let Some(&packet_id) = it.next() {
                if loss_fields.len() >= max_loss_fields {
                    break 'frames;
                }
                let mut bitmask = 0u8;
                while let Some(&&next) = it.peek() {
                    let delta = next.wrapping_sub(packet_id);
                    if (1..=8).contains(&delta) {
                        bitmask |= 1 << (delta - 1);
                        it.next();
                    } else {
                        break;
                    }
                }
                loss_fields.push(CastLossField {
                    frame_id: *frame_id as u8,
                    packet_id,
                    bitmask,
                });
            }
        }

        CastFeedback {
            sender_ssrc,
            media_ssrc: message.media_ssrc,
            ack_frame_id: message.ack_frame_id as u8,
            target_delay_ms: message.target_delay.as_millis().min(u16::MAX as u128) as u16,
            loss_fields,
        }
    }

    /// Size of a feedback packet with `loss_fields` fields.
    pub fn size_with_loss_fields(loss_fields: usize) -> usize {
        HEADER_LENGTH + CAST_FEEDBACK_BODY_LENGTH + loss_fields * LOSS_FIELD_LENGTH
    }
}

impl MarshalSize for CastFeedback {
    fn marshal_size(&self) -> usize {
        CastFeedback::size_with_loss_fields(self.loss_fields.len())
    }
}

impl Marshal for CastFeedback {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.loss_fields.len() > MAX_CAST_LOSS_FIELDS {
            return Err(Error::ErrTooManyLossFields);
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }

        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P| FMT=15  |   PT=PSFB=206 |             length            |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                  SSRC of packet sender                        |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                  SSRC of media source                         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |  'C'          |  'A'          |  'S'          |  'T'          |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * | ACK frame id  | # loss fields |       target delay (ms)       |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |   frame id    |          packet id            |    bitmask    |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let n = Header::new(
            PacketType::PayloadSpecificFeedback,
            FORMAT_CAST_FEEDBACK,
            self.marshal_size(),
        )
        .marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u32(CAST_IDENTIFIER);
        buf.put_u8(self.ack_frame_id);
        buf.put_u8(self.loss_fields.len() as u8);
        buf.put_u16(self.target_delay_ms);
        for field in &self.loss_fields {
            buf.put_u8(field.frame_id);
            buf.put_u16(field.packet_id);
            buf.put_u8(field.bitmask);
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for CastFeedback {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = unmarshal_expected(raw_packet, PacketType::PayloadSpecificFeedback)?;
        if header.count != FORMAT_CAST_FEEDBACK {
            return Err(Error::ErrWrongType);
        }
        let body_length = header.packet_size() - HEADER_LENGTH;
        if body_length < CAST_FEEDBACK_BODY_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let sender_ssrc = raw_packet.get_u32();
        let media_ssrc = raw_packet.get_u32();
        if raw_packet.get_u32() != CAST_IDENTIFIER {
            raw_packet.advance(body_length - 12);
            return Err(Error::ErrBadCastIdentifier);
        }
        let ack_frame_id = raw_packet.get_u8();
        let number_of_loss_fields = raw_packet.get_u8() as usize;
        let target_delay_ms = raw_packet.get_u16();

        let mut remaining = body_length - CAST_FEEDBACK_BODY_LENGTH;
        if number_of_loss_fields * LOSS_FIELD_LENGTH > remaining {
            return Err(Error::ErrPacketTooShort);
        }
        let mut loss_fields = Vec::with_capacity(number_of_loss_fields);
        for _ in 0..number_of_loss_fields {
            loss_fields.push(CastLossField {
                frame_id: raw_packet.get_u8(),
                packet_id: raw_packet.get_u16(),
                bitmask: raw_packet.get_u8(),
            });
            remaining -= LOSS_FIELD_LENGTH;
        }
        // trailing extensions are not used by this sender
        raw_packet.advance(remaining);

        Ok(CastFeedback {
            sender_ssrc,
            media_ssrc,
            ack_frame_id,
            target_delay_ms,
            loss_fields,
        })
    }
}
