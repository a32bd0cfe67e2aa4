use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header, PacketType, SSRC_LENGTH, unmarshal_expected};

/// XR block type of the receiver reference time report, RFC 3611 4.4.
pub const BLOCK_TYPE_RRTR: u8 = 4;
const RRTR_BLOCK_LENGTH: usize = 12;
const XR_BLOCK_HEADER_LENGTH: usize = 4;

/// An extended report holding a single receiver reference time block, which
/// lets a receiver that sends no media take part in RTT measurement.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ReceiverReferenceTimeReport {
    /// SSRC of the receiver sending the report.
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
}

impl MarshalSize for ReceiverReferenceTimeReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH + RRTR_BLOCK_LENGTH
    }
}

impl Marshal for ReceiverReferenceTimeReport {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }

        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|reserved |   PT=XR=207   |             length            |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                              SSRC                             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |     BT=4      |   reserved    |       block length = 2        |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |              NTP timestamp, most significant word             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |             NTP timestamp, least significant word             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let n = Header::new(PacketType::ExtendedReport, 0, self.marshal_size()).marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put_u32(self.ssrc);
        buf.put_u8(BLOCK_TYPE_RRTR);
        buf.put_u8(0);
        buf.put_u16(2);
        buf.put_u32(self.ntp_seconds);
        buf.put_u32(self.ntp_fraction);

        Ok(self.marshal_size())
    }
}

impl ReceiverReferenceTimeReport {
    /// Parses an XR packet and returns its first RRTR block, if any. Other
    /// block types are skipped.
    pub fn unmarshal_first<B>(raw_packet: &mut B) -> Result<Option<Self>>
    where
        B: Buf,
    {
        let header = unmarshal_expected(raw_packet, PacketType::ExtendedReport)?;
        if header.packet_size() < HEADER_LENGTH + SSRC_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }
        let ssrc = raw_packet.get_u32();

        let mut remaining = header.packet_size() - HEADER_LENGTH - SSRC_LENGTH;
        let mut found = None;
        while remaining >= XR_BLOCK_HEADER_LENGTH {
            let block_type = raw_packet.get_u8();
            raw_packet.advance(1);
            let block_length = raw_packet.get_u16() as usize * 4;
            remaining -= XR_BLOCK_HEADER_LENGTH;
            if block_length > remaining {
                return Err(Error::ErrMalformedExtendedReport);
            }

            if block_type == BLOCK_TYPE_RRTR && found.is_none() {
                if block_length != 8 {
                    return Err(Error::ErrMalformedExtendedReport);
                }
                found = Some(ReceiverReferenceTimeReport {
                    ssrc,
                    ntp_seconds: raw_packet.get_u32(),
                    ntp_fraction: raw_packet.get_u32(),
                });
            } else {
                raw_packet.advance(block_length);
            }
            remaining -= block_length;
        }
        raw_packet.advance(remaining);

        Ok(found)
    }
}

impl Unmarshal for ReceiverReferenceTimeReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        Self::unmarshal_first(raw_packet)?.ok_or(Error::ErrMalformedExtendedReport)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_rrtr_roundtrip() -> Result<()> {
        let rrtr = ReceiverReferenceTimeReport {
            ssrc: 0x01020304,
            ntp_seconds: 0xe0000000,
            ntp_fraction: 0x80000000,
        };
        let raw = rrtr.marshal()?;
        assert_eq!(raw.len(), 20);
        assert_eq!(&raw[..4], &[0x80, 0xcf, 0x00, 0x04]);
        assert_eq!(&raw[8..12], &[0x04, 0x00, 0x00, 0x02]);
        assert_eq!(ReceiverReferenceTimeReport::unmarshal(&mut raw.clone())?, rrtr);
        Ok(())
    }

    #[test]
    fn test_rrtr_skips_other_blocks() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x80, 0xcf, 0x00, 0x06, // header, 28 bytes
            0x00, 0x00, 0x00, 0x09, // ssrc
            0x05, 0x00, 0x00, 0x01, // DLRR block, 4 bytes
            0xaa, 0xbb, 0xcc, 0xdd, //
            0x04, 0x00, 0x00, 0x02, // RRTR block
            0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x02, //
        ]);
        let rrtr = ReceiverReferenceTimeReport::unmarshal(&mut raw.clone())?;
        assert_eq!(rrtr.ssrc, 9);
        assert_eq!(rrtr.ntp_seconds, 1);
        assert_eq!(rrtr.ntp_fraction, 2);
        Ok(())
    }

    #[test]
    fn test_xr_without_rrtr() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x80, 0xcf, 0x00, 0x03, 0x00, 0x00, 0x00, 0x09, 0x05, 0x00, 0x00, 0x01, 0xaa, 0xbb,
            0xcc, 0xdd,
        ]);
        assert_eq!(
            ReceiverReferenceTimeReport::unmarshal_first(&mut raw.clone())?,
            None
        );
        Ok(())
    }
}
