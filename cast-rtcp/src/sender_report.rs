use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header, PacketType, unmarshal_expected};

pub(crate) const SR_BODY_LENGTH: usize = 24;

/// A sender report without report blocks; a Cast sender never receives
/// media, so it has nothing to report on.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct SenderReport {
    /// The synchronization source identifier for the originator of this SR packet.
    pub ssrc: u32,
    /// Wallclock time when this report was sent, as seconds since 1900.
    pub ntp_seconds: u32,
    /// Fraction of a second of the wallclock time.
    pub ntp_fraction: u32,
    /// RTP timestamp corresponding to the same instant as the NTP time.
    pub rtp_timestamp: u32,
    /// Total number of RTP data packets transmitted by the sender.
    pub packet_count: u32,
    /// Total number of payload octets transmitted by the sender.
    pub octet_count: u32,
}

impl MarshalSize for SenderReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + SR_BODY_LENGTH
    }
}

impl Marshal for SenderReport {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }

        /*
         *         0                   1                   2                   3
         *         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * header |V=2|P|    RC   |   PT=SR=200   |             length            |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                         SSRC of sender                        |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * sender |              NTP timestamp, most significant word             |
         * info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |             NTP timestamp, least significant word             |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                         RTP timestamp                         |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                     sender's packet count                     |
         *        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         *        |                      sender's octet count                     |
         *        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         */
        let n = Header::new(PacketType::SenderReport, 0, self.marshal_size()).marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_seconds);
        buf.put_u32(self.ntp_fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);

        Ok(self.marshal_size())
    }
}

impl Unmarshal for SenderReport {
    /// Report blocks that may follow the sender info are skipped.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = unmarshal_expected(raw_packet, PacketType::SenderReport)?;
        if header.packet_size() < HEADER_LENGTH + SR_BODY_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let sr = SenderReport {
            ssrc: raw_packet.get_u32(),
            ntp_seconds: raw_packet.get_u32(),
            ntp_fraction: raw_packet.get_u32(),
            rtp_timestamp: raw_packet.get_u32(),
            packet_count: raw_packet.get_u32(),
            octet_count: raw_packet.get_u32(),
        };
        raw_packet.advance(header.packet_size() - HEADER_LENGTH - SR_BODY_LENGTH);
        Ok(sr)
    }
}
