/// Smallest datagram that can carry an RTCP header plus sender SSRC.
pub const MIN_RTCP_PACKET_LENGTH: usize = 8;
/// Smallest datagram that can carry a fixed RTP header.
pub const MIN_RTP_PACKET_LENGTH: usize = 12;

/// Packet types 194..=210 cover every RTCP type a Cast peer emits (SR, RR,
/// SDES, BYE, APP, RTPFB, PSFB, XR) and never collide with the payload types
/// used for media once the marker bit is folded in.
pub fn is_rtcp(buf: &[u8]) -> bool {
    if buf.len() < MIN_RTCP_PACKET_LENGTH {
        return false;
    }

    let rtcp_packet_type = buf[1];
    (194..=210).contains(&rtcp_packet_type)
}

/// SSRC of the sender of an RTCP compound packet.
pub fn rtcp_sender_ssrc(buf: &[u8]) -> Option<u32> {
    if buf.len() < MIN_RTCP_PACKET_LENGTH {
        return None;
    }
    Some(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

/// SSRC of an RTP data packet.
pub fn rtp_ssrc(buf: &[u8]) -> Option<u32> {
    if buf.len() < MIN_RTP_PACKET_LENGTH {
        return None;
    }
    Some(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]))
}

/// Sender SSRC for RTCP, media SSRC for anything else.
pub fn packet_ssrc(buf: &[u8]) -> Option<u32> {
    if is_rtcp(buf) {
        rtcp_sender_ssrc(buf)
    } else {
        rtp_ssrc(buf)
    }
}
