use bytes::{Buf, BufMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType, SSRC_LENGTH, unmarshal_expected};

pub const REPORT_BLOCK_LENGTH: usize = 24;

/// A reception report for one media source.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ReportBlock {
    /// The SSRC of the media source this block reports on.
    pub media_ssrc: u32,
    pub fraction_lost: u8,
    /// 24 bits on the wire.
    pub cumulative_lost: u32,
    pub extended_high_sequence_number: u32,
    pub jitter: u32,
    /// Middle 32 bits of the NTP timestamp of the last sender report received.
    pub last_sr: u32,
    /// Delay since that report, in units of 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

impl MarshalSize for ReportBlock {
    fn marshal_size(&self) -> usize {
        REPORT_BLOCK_LENGTH
    }
}

impl Marshal for ReportBlock {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < REPORT_BLOCK_LENGTH {
            return Err(Error::ErrBufferShort);
        }
        if self.cumulative_lost >= (1 << 24) {
            return Err(Error::ErrInvalidHeader);
        }

        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * |                              SSRC                             |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * | fraction lost |       cumulative number of packets lost       |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |           extended highest sequence number received           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                      interarrival jitter                      |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                         last SR (LSR)                         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                   delay since last SR (DLSR)                  |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        buf.put_u32(self.media_ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | self.cumulative_lost);
        buf.put_u32(self.extended_high_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);

        Ok(REPORT_BLOCK_LENGTH)
    }
}

impl Unmarshal for ReportBlock {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if raw_packet.remaining() < REPORT_BLOCK_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let media_ssrc = raw_packet.get_u32();
        let lost = raw_packet.get_u32();
        Ok(ReportBlock {
            media_ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00ff_ffff,
            extended_high_sequence_number: raw_packet.get_u32(),
            jitter: raw_packet.get_u32(),
            last_sr: raw_packet.get_u32(),
            delay_since_last_sr: raw_packet.get_u32(),
        })
    }
}

/// A receiver report, with or without report blocks.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct ReceiverReport {
    /// The synchronization source identifier for the originator of this RR packet.
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl MarshalSize for ReceiverReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH + SSRC_LENGTH + self.reports.len() * REPORT_BLOCK_LENGTH
    }
}

impl Marshal for ReceiverReport {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if self.reports.len() > COUNT_MAX {
            return Err(Error::ErrTooManyReports);
        }
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }

        let n = Header::new(
            PacketType::ReceiverReport,
            self.reports.len() as u8,
            self.marshal_size(),
        )
        .marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put_u32(self.ssrc);
        for report in &self.reports {
            let n = report.marshal_to(buf)?;
            buf = &mut buf[n..];
        }

        Ok(self.marshal_size())
    }
}

impl Unmarshal for ReceiverReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = unmarshal_expected(raw_packet, PacketType::ReceiverReport)?;
        let count = header.count as usize;
        if header.packet_size() < HEADER_LENGTH + SSRC_LENGTH + count * REPORT_BLOCK_LENGTH {
            return Err(Error::ErrPacketTooShort);
        }

        let ssrc = raw_packet.get_u32();
        let mut reports = Vec::with_capacity(count);
        for _ in 0..count {
            reports.push(ReportBlock::unmarshal(raw_packet)?);
        }
        raw_packet.advance(
            header.packet_size() - HEADER_LENGTH - SSRC_LENGTH - count * REPORT_BLOCK_LENGTH,
        );

        Ok(ReceiverReport { ssrc, reports })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_receiver_report_roundtrip() -> Result<()> {
        let rr = ReceiverReport {
            ssrc: 0x11,
            reports: vec![ReportBlock {
                media_ssrc: 0x22,
                fraction_lost: 3,
                cumulative_lost: 0x0a0b0c,
                extended_high_sequence_number: 1000,
                jitter: 7,
                last_sr: 0x56789abc,
                delay_since_last_sr: 0x0001_8000,
            }],
        };
        let raw = rr.marshal()?;
        assert_eq!(raw.len(), 32);
        assert_eq!(&raw[..4], &[0x81, 0xc9, 0x00, 0x07]);
        assert_eq!(&raw[12..16], &[0x03, 0x0a, 0x0b, 0x0c]);
        assert_eq!(ReceiverReport::unmarshal(&mut raw.clone())?, rr);
        Ok(())
    }

    #[test]
    fn test_empty_receiver_report() -> Result<()> {
        let rr = ReceiverReport {
            ssrc: 0x11,
            reports: vec![],
        };
        let raw = rr.marshal()?;
        assert_eq!(&raw[..], &[0x80, 0xc9, 0x00, 0x01, 0x00, 0x00, 0x00, 0x11]);
        assert_eq!(ReceiverReport::unmarshal(&mut raw.clone())?, rr);
        Ok(())
    }

    #[test]
    fn test_cumulative_lost_overflow() {
        let block = ReportBlock {
            cumulative_lost: 1 << 24,
            ..Default::default()
        };
        assert_eq!(block.marshal().unwrap_err(), Error::ErrInvalidHeader);
    }
}
