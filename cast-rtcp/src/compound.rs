use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::cast_feedback::{CastFeedback, CastMessage, MAX_CAST_LOSS_FIELDS};
use crate::extended_report::ReceiverReferenceTimeReport;
use crate::header::{
    FORMAT_CAST_FEEDBACK, Header, MAX_IP_PACKET_SIZE, PacketType,
    SUBTYPE_RECEIVER_LOG,
};
use crate::receiver_log::{ReceiverLog, ReceiverLogEvent, ReceiverLogFrame, ReceiverLogHistory};
use crate::receiver_report::{ReceiverReport, ReportBlock};
use crate::sender_report::SenderReport;

/// What a receiver puts in one compound packet. The receiver report itself
/// is always present; everything else is optional.
#[derive(Debug, Default, Clone)]
pub struct ReceiverPacketParams<'a> {
    pub report_block: Option<ReportBlock>,
    pub rrtr: Option<(u32, u32)>,
    pub cast_message: Option<&'a CastMessage>,
    pub receiver_events: Option<&'a [(u32, ReceiverLogEvent)]>,
}

/// Builds RTCP compound packets for one local SSRC.
#[derive(Debug)]
pub struct RtcpBuilder {
    local_ssrc: u32,
    log_history: ReceiverLogHistory,
}

impl RtcpBuilder {
    pub fn new(local_ssrc: u32) -> Self {
        RtcpBuilder {
            local_ssrc,
            log_history: ReceiverLogHistory::new(),
        }
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    /// A sender's compound packet: a lone sender report.
    pub fn build_sender_report(&self, sender_report: &SenderReport) -> Result<Bytes> {
        let sr = SenderReport {
            ssrc: self.local_ssrc,
            ..sender_report.clone()
        };
        sr.marshal()
    }

    /// A receiver's compound packet: RR, then RRTR, Cast feedback and the
    /// receiver log, each only if requested and only while it fits in one
    /// IP packet.
    pub fn build_receiver_packet(&mut self, params: &ReceiverPacketParams<'_>) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(MAX_IP_PACKET_SIZE);

        let rr = ReceiverReport {
            ssrc: self.local_ssrc,
            reports: params.report_block.iter().copied().collect(),
        };
        out.extend_from_slice(&rr.marshal()?);

        if let Some((ntp_seconds, ntp_fraction)) = params.rrtr {
            let rrtr = ReceiverReferenceTimeReport {
                ssrc: self.local_ssrc,
                ntp_seconds,
                ntp_fraction,
            };
            out.extend_from_slice(&rrtr.marshal()?);
        }

        if let Some(cast_message) = params.cast_message {
            let remaining = MAX_IP_PACKET_SIZE.saturating_sub(out.len());
            let empty = CastFeedback::size_with_loss_fields(0);
            if remaining >= empty {
                let max_loss_fields = ((remaining - empty) / 4).min(MAX_CAST_LOSS_FIELDS);
                let feedback =
                    CastFeedback::from_message(self.local_ssrc, cast_message, max_loss_fields);
                out.extend_from_slice(&feedback.marshal()?);
            }
        }

        if let Some(events) = params.receiver_events {
            let remaining = MAX_IP_PACKET_SIZE.saturating_sub(out.len());
            let frames = self.log_history.build_report(events, remaining);
            if !frames.is_empty() {
                let log = ReceiverLog {
                    sender_ssrc: self.local_ssrc,
                    frames,
                };
                out.extend_from_slice(&log.marshal()?);
            }
        }

        Ok(out.freeze())
    }
}

/// The parts of a compound packet addressed to us.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpReport {
    pub sender_report: Option<SenderReport>,
    /// The report block about our own stream.
    pub report_block: Option<ReportBlock>,
    pub rrtr: Option<ReceiverReferenceTimeReport>,
    pub cast_feedback: Option<CastFeedback>,
    pub receiver_log: Vec<ReceiverLogFrame>,
}

impl RtcpReport {
    pub fn is_empty(&self) -> bool {
        self.sender_report.is_none()
            && self.report_block.is_none()
            && self.rrtr.is_none()
            && self.cast_feedback.is_none()
            && self.receiver_log.is_empty()
    }
}

/// Parses compound packets exchanged between `local_ssrc` and `remote_ssrc`,
/// keeping only what the remote side says about the local stream.
#[derive(Debug, Copy, Clone)]
pub struct RtcpParser {
    local_ssrc: u32,
    remote_ssrc: u32,
}

impl RtcpParser {
    pub fn new(local_ssrc: u32, remote_ssrc: u32) -> Self {
        RtcpParser {
            local_ssrc,
            remote_ssrc,
        }
    }

    pub fn parse(&self, packet: &[u8]) -> Result<RtcpReport> {
        let mut raw = Bytes::copy_from_slice(packet);
        let mut report = RtcpReport::default();

        while raw.has_remaining() {
            let header = Header::unmarshal(&mut raw.slice(..))?;
            let size = header.packet_size();
            if size > raw.remaining() {
                return Err(Error::ErrPacketTooShort);
            }
            let mut chunk = raw.split_to(size);
            trace!("rtcp {} of {} bytes", header.packet_type, size);

            match header.packet_type {
                PacketType::SenderReport => {
                    let sr = SenderReport::unmarshal(&mut chunk)?;
                    if sr.ssrc == self.remote_ssrc {
                        report.sender_report = Some(sr);
                    }
                }
                PacketType::ReceiverReport => {
                    let rr = ReceiverReport::unmarshal(&mut chunk)?;
                    if rr.ssrc == self.remote_ssrc {
                        if let Some(block) =
                            rr.reports.iter().find(|b| b.media_ssrc == self.local_ssrc)
                        {
                            report.report_block = Some(*block);
                        }
                    }
                }
                PacketType::ExtendedReport => {
                    if let Some(rrtr) = ReceiverReferenceTimeReport::unmarshal_first(&mut chunk)? {
                        if rrtr.ssrc == self.remote_ssrc {
                            report.rrtr = Some(rrtr);
                        }
                    }
                }
                PacketType::PayloadSpecificFeedback if header.count == FORMAT_CAST_FEEDBACK => {
                    match CastFeedback::unmarshal(&mut chunk) {
                        Ok(feedback) => {
                            if feedback.sender_ssrc == self.remote_ssrc
                                && feedback.media_ssrc == self.local_ssrc
                            {
                                report.cast_feedback = Some(feedback);
                            }
                        }
                        // another vendor's FMT 15 message, e.g. REMB
                        Err(Error::ErrBadCastIdentifier) => {}
                        Err(err) => return Err(err),
                    }
                }
                PacketType::ApplicationDefined if header.count == SUBTYPE_RECEIVER_LOG => {
                    match ReceiverLog::unmarshal(&mut chunk) {
                        Ok(log) => {
                            if log.sender_ssrc == self.remote_ssrc {
                                report.receiver_log.extend(log.frames);
                            }
                        }
                        Err(Error::ErrBadCastIdentifier) => {}
                        Err(err) => return Err(err),
                    }
                }
                _ => {}
            }
        }

        Ok(report)
    }
}
