use log::trace;
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize};

use crate::cast_header::{CastExtension, CastHeader};
use crate::frame::EncodedFrame;
use crate::header::Header;
use crate::packet::{PacketKey, PacketRef, SendPacketVector};

/// Default maximum datagram payload: a 1500 byte MTU minus IP and UDP headers.
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 1500 - 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketizerConfig {
    pub payload_type: u8,
    /// Largest datagram the packetizer may produce.
    pub max_payload_length: usize,
    /// First sequence number to use.
    pub sequence_number: u16,
    pub ssrc: u32,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        PacketizerConfig {
            payload_type: 0,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            sequence_number: rand::random::<u16>(),
            ssrc: 0,
        }
    }
}

/// Splits encoded frames into RTP + Cast packets.
#[derive(Debug)]
pub struct RtpPacketizer {
    config: PacketizerConfig,
    sequence_number: u16,
    send_packet_count: u32,
    send_octet_count: u32,
}

impl RtpPacketizer {
    pub fn new(config: PacketizerConfig) -> Self {
        RtpPacketizer {
            sequence_number: config.sequence_number,
            config,
            send_packet_count: 0,
            send_octet_count: 0,
        }
    }

    /// Next sequence number to be handed out.
    pub fn next_sequence_number(&mut self) -> u16 {
        let sequence_number = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        sequence_number
    }

    pub fn send_packet_count(&self) -> u32 {
        self.send_packet_count
    }

    pub fn send_octet_count(&self) -> u32 {
        self.send_octet_count
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    /// Packetizes `payload`, which is the (possibly encrypted) body of `frame`.
    ///
    /// The payload is split evenly over the fewest packets that fit, so the
    /// last packet is never much smaller than the others. An empty payload
    /// still yields one packet.
    pub fn packetize(&mut self, frame: &EncodedFrame, payload: &[u8]) -> Result<SendPacketVector> {
        let extensions = if frame.new_playout_delay_ms > 0 {
            vec![CastExtension::AdaptiveLatency {
                delay_ms: frame.new_playout_delay_ms,
            }]
        } else {
            vec![]
        };
        let first_header = CastHeader {
            reference_frame_id: Some(0),
            extensions: extensions.clone(),
            ..Default::default()
        };
        let overhead = Header::default().marshal_size() + first_header.marshal_size();
        if self.config.max_payload_length <= overhead {
            return Err(Error::ErrPacketTooBig);
        }
        let max_length = self.config.max_payload_length - overhead;

        let num_packets = payload.len().div_ceil(max_length).max(1);
        if num_packets > u16::MAX as usize - 1 {
            return Err(Error::ErrFrameTooLarge);
        }
        let payload_length = payload.len().div_ceil(num_packets);
        let max_packet_id = (num_packets - 1) as u16;

        let mut packets = Vec::with_capacity(num_packets);
        for (index, chunk) in chunks_or_empty(payload, payload_length).enumerate() {
            let packet_id = index as u16;
            let header = Header {
                marker: packet_id == max_packet_id,
                payload_type: self.config.payload_type,
                sequence_number: self.next_sequence_number(),
                timestamp: frame.rtp_timestamp,
                ssrc: self.config.ssrc,
                ..Default::default()
            };
            let cast_header = CastHeader {
                is_key_frame: frame.is_key_frame(),
                frame_id: frame.frame_id as u8,
                packet_id,
                max_packet_id,
                reference_frame_id: Some(frame.referenced_frame_id as u8),
                extensions: if packet_id == 0 {
                    extensions.clone()
                } else {
                    vec![]
                },
            };

            let header_len = header.marshal_size();
            let cast_len = cast_header.marshal_size();
            let mut packet = vec![0u8; header_len + cast_len + chunk.len()];
            header.marshal_to(&mut packet[..header_len])?;
            cast_header.marshal_to(&mut packet[header_len..header_len + cast_len])?;
            packet[header_len + cast_len..].copy_from_slice(chunk);

            self.send_packet_count = self.send_packet_count.wrapping_add(1);
            self.send_octet_count = self.send_octet_count.wrapping_add(chunk.len() as u32);

            packets.push((
                PacketKey::new(frame.reference_time, self.config.ssrc, frame.frame_id, packet_id),
                PacketRef::new(packet),
            ));
        }

        trace!(
            "ssrc {} packetized frame {} into {} packets",
            self.config.ssrc,
            frame.frame_id,
            packets.len()
        );
        Ok(packets)
    }
}

fn chunks_or_empty(payload: &[u8], size: usize) -> Box<dyn Iterator<Item = &[u8]> + '_> {
    if payload.is_empty() {
        Box::new(std::iter::once(payload))
    } else {
        Box::new(payload.chunks(size))
    }
}
