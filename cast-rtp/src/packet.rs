use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use crate::header::HEADER_LENGTH;

/// Packet id that asks for every packet of a frame.
pub const ALL_PACKETS_LOST: u16 = 0xffff;
/// Packet id that asks for the last packet of a frame, whatever its id.
pub const LAST_PACKET: u16 = 0xfffe;

const SEQUENCE_NUMBER_OFFSET: usize = 2;

/// One wire datagram.
pub type Packet = Vec<u8>;

/// A shared, immutable wire datagram.
///
/// The same packet sits in the pacer queue and in the retransmission store at
/// once. Mutation goes through [`PacketRef::make_mut`], which copies only when
/// the buffer has more than one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRef(Arc<Packet>);

impl PacketRef {
    pub fn new(packet: Packet) -> Self {
        PacketRef(Arc::new(packet))
    }

    pub fn make_mut(&mut self) -> &mut Packet {
        Arc::make_mut(&mut self.0)
    }

    /// True if both refer to the same buffer.
    pub fn ptr_eq(&self, other: &PacketRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Rewrites the RTP sequence number, copying the buffer if it is shared.
    pub fn set_sequence_number(&mut self, sequence_number: u16) {
        if self.0.len() < HEADER_LENGTH {
            return;
        }
        let packet = self.make_mut();
        packet[SEQUENCE_NUMBER_OFFSET..SEQUENCE_NUMBER_OFFSET + 2]
            .copy_from_slice(&sequence_number.to_be_bytes());
    }

    pub fn sequence_number(&self) -> Option<u16> {
        if self.0.len() < HEADER_LENGTH {
            return None;
        }
        Some(u16::from_be_bytes([
            self.0[SEQUENCE_NUMBER_OFFSET],
            self.0[SEQUENCE_NUMBER_OFFSET + 1],
        ]))
    }
}

impl Deref for PacketRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Packet> for PacketRef {
    fn from(packet: Packet) -> Self {
        PacketRef::new(packet)
    }
}

/// Identifies one packet occurrence.
///
/// Ordering is by capture time first, which is also the transmission order
/// inside a pacer queue. RTCP packets carry no capture time and therefore sort
/// ahead of every media packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketKey {
    pub capture_time: Option<Instant>,
    pub ssrc: u32,
    pub frame_id: u32,
    pub packet_id: u16,
}

impl PacketKey {
    pub fn new(capture_time: Instant, ssrc: u32, frame_id: u32, packet_id: u16) -> Self {
        PacketKey {
            capture_time: Some(capture_time),
            ssrc,
            frame_id,
            packet_id,
        }
    }

    /// Key for an RTCP packet from `ssrc`.
    pub fn rtcp(ssrc: u32) -> Self {
        PacketKey {
            capture_time: None,
            ssrc,
            frame_id: 0,
            packet_id: 0,
        }
    }
}

/// All packets of one frame, in packet id order.
pub type SendPacketVector = Vec<(PacketKey, PacketRef)>;
