extern crate cast_rtp as rtp;

use bytes::Bytes;
use rtp::frame::{Dependency, EncodedFrame};
use rtp::packetizer::{DEFAULT_MAX_PAYLOAD_LENGTH, PacketizerConfig, RtpPacketizer};
use rtp::parser::{FrameAssembler, RtpParser};
use shared::error::Result;
use std::time::Instant;

const SSRC: u32 = 0x2ab1;
const PAYLOAD_TYPE: u8 = 96;

fn frame(frame_id: u32, dependency: Dependency, size: usize) -> EncodedFrame {
    let data: Vec<u8> = (0..size).map(|i| (i * 7 + frame_id as usize) as u8).collect();
    EncodedFrame::new(
        dependency,
        frame_id,
        frame_id.wrapping_mul(3000),
        Instant::now(),
        Bytes::from(data),
    )
}

fn roundtrip(
    packetizer: &mut RtpPacketizer,
    parser: &mut RtpParser,
    frame: &EncodedFrame,
) -> Result<usize> {
    let packets = packetizer.packetize(frame, &frame.data)?;
    let count = packets.len();

    let mut assembler = FrameAssembler::new();
    let mut reassembled = None;
    // deliver in reverse to exercise reordering
    for (_, packet) in packets.iter().rev() {
        let (header, payload) = parser.parse_packet(packet)?;
        if let Some(done) = assembler.insert(header, payload) {
            reassembled = Some(done);
        }
    }

    let reassembled = reassembled.expect("frame should be complete");
    assert_eq!(reassembled.frame_id, frame.frame_id);
    assert_eq!(reassembled.referenced_frame_id, frame.referenced_frame_id);
    assert_eq!(reassembled.rtp_timestamp, frame.rtp_timestamp);
    assert_eq!(reassembled.is_key_frame, frame.is_key_frame());
    assert_eq!(reassembled.new_playout_delay_ms, frame.new_playout_delay_ms);
    assert_eq!(reassembled.data, frame.data);
    Ok(count)
}

#[test]
fn test_packetize_parse_roundtrip() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut packetizer = RtpPacketizer::new(PacketizerConfig {
        payload_type: PAYLOAD_TYPE,
        max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
        sequence_number: 0xff00,
        ssrc: SSRC,
    });
    let mut parser = RtpParser::new(SSRC, PAYLOAD_TYPE);

    assert_eq!(
        roundtrip(&mut packetizer, &mut parser, &frame(0, Dependency::Key, 0))?,
        1
    );
    assert_eq!(
        roundtrip(&mut packetizer, &mut parser, &frame(1, Dependency::Dependent, 1000))?,
        1
    );
    assert_eq!(
        roundtrip(&mut packetizer, &mut parser, &frame(2, Dependency::Dependent, 2000))?,
        2
    );

    let mut big = frame(3, Dependency::Independent, 3 * 1024 * 1024);
    big.new_playout_delay_ms = 300;
    let count = roundtrip(&mut packetizer, &mut parser, &big)?;
    assert!(count > 2000);
    Ok(())
}

#[test]
fn test_frame_ids_survive_8bit_wrap() -> Result<()> {
    let mut packetizer = RtpPacketizer::new(PacketizerConfig {
        payload_type: PAYLOAD_TYPE,
        max_payload_length: 200,
        sequence_number: 0,
        ssrc: SSRC,
    });
    let mut parser = RtpParser::new(SSRC, PAYLOAD_TYPE);

    for frame_id in 0..700u32 {
        let dependency = if frame_id % 100 == 0 {
            Dependency::Key
        } else {
            Dependency::Dependent
        };
        roundtrip(&mut packetizer, &mut parser, &frame(frame_id, dependency, 450))?;
    }
    Ok(())
}
