use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use shared::error::{Error, Result};
use shared::marshal::Unmarshal;
use std::collections::BTreeMap;

use crate::cast_header::CastHeader;
use crate::header::Header;
use crate::wrap::{FrameIdWrapHelper, expand_truncated};

/// Everything the RTP and Cast headers say about one data packet, with frame
/// ids widened to 32 bits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtpCastHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub rtp_timestamp: u32,
    pub sender_ssrc: u32,
    pub is_key_frame: bool,
    pub frame_id: u32,
    pub packet_id: u16,
    pub max_packet_id: u16,
    pub reference_frame_id: u32,
    pub new_playout_delay_ms: u16,
}

/// Parses data packets of one stream.
#[derive(Debug)]
pub struct RtpParser {
    expected_sender_ssrc: u32,
    expected_payload_type: u8,
    frame_id_wrap_helper: FrameIdWrapHelper,
}

impl RtpParser {
    pub fn new(expected_sender_ssrc: u32, expected_payload_type: u8) -> Self {
        RtpParser {
            expected_sender_ssrc,
            expected_payload_type,
            frame_id_wrap_helper: FrameIdWrapHelper::default(),
        }
    }

    /// Parses `packet`, returning its headers and payload.
    ///
    /// Packets from another SSRC or with another payload type are refused with
    /// [`Error::ErrRtpNotOurs`].
    pub fn parse_packet(&mut self, packet: &[u8]) -> Result<(RtpCastHeader, Bytes)> {
        let mut reader = Bytes::copy_from_slice(packet);
        let header = Header::unmarshal(&mut reader)?;
        if header.ssrc != self.expected_sender_ssrc
            || header.payload_type != self.expected_payload_type
        {
            return Err(Error::ErrRtpNotOurs);
        }

        let cast_header = CastHeader::unmarshal(&mut reader)?;

        let frame_id = self.frame_id_wrap_helper.peek(cast_header.frame_id);
        let reference_frame_id = match cast_header.reference_frame_id {
            Some(truncated) => expand_truncated(truncated, frame_id),
            None if cast_header.is_key_frame => frame_id,
            None => frame_id.wrapping_sub(1),
        };
        // only a valid packet may move the wrap reference
        self.frame_id_wrap_helper.observe(frame_id);

        let parsed = RtpCastHeader {
            marker: header.marker,
            payload_type: header.payload_type,
            sequence_number: header.sequence_number,
            rtp_timestamp: header.timestamp,
            sender_ssrc: header.ssrc,
            is_key_frame: cast_header.is_key_frame,
            frame_id,
            packet_id: cast_header.packet_id,
            max_packet_id: cast_header.max_packet_id,
            reference_frame_id,
            new_playout_delay_ms: cast_header.new_playout_delay_ms(),
        };
        trace!(
            "parsed frame {} packet {}/{}",
            parsed.frame_id, parsed.packet_id, parsed.max_packet_id
        );

        let remaining = reader.remaining();
        Ok((parsed, reader.copy_to_bytes(remaining)))
    }
}

/// A frame put back together from its packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    pub is_key_frame: bool,
    pub frame_id: u32,
    pub referenced_frame_id: u32,
    pub rtp_timestamp: u32,
    pub new_playout_delay_ms: u16,
    pub data: Bytes,
}

/// Collects the packets of one frame until every packet id up to
/// `max_packet_id` has arrived.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    first: Option<RtpCastHeader>,
    payloads: BTreeMap<u16, Bytes>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one packet; returns the frame once it is complete. Packets that
    /// belong to another frame than the first one seen are ignored.
    pub fn insert(&mut self, header: RtpCastHeader, payload: Bytes) -> Option<ReassembledFrame> {
        if let Some(first) = &self.first {
            if first.frame_id != header.frame_id {
                return None;
            }
        }
        self.payloads.entry(header.packet_id).or_insert(payload);
        if header.packet_id == 0 || self.first.is_none() {
            let keep_delay = self
                .first
                .as_ref()
                .map(|f| f.new_playout_delay_ms)
                .unwrap_or(0);
            let mut first = header;
            if first.new_playout_delay_ms == 0 {
                first.new_playout_delay_ms = keep_delay;
            }
            self.first = Some(first);
        }

        let first = self.first.as_ref()?;
        if self.payloads.len() != first.max_packet_id as usize + 1 {
            return None;
        }

        let mut data = BytesMut::new();
        for payload in self.payloads.values() {
            data.extend_from_slice(payload);
        }
        Some(ReassembledFrame {
            is_key_frame: first.is_key_frame,
            frame_id: first.frame_id,
            referenced_frame_id: first.reference_frame_id,
            rtp_timestamp: first.rtp_timestamp,
            new_playout_delay_ms: first.new_playout_delay_ms,
            data: data.freeze(),
        })
    }
}
