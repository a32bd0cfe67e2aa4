extern crate cast_rtcp as rtcp;

use rtcp::cast_feedback::{CastMessage, MAX_CAST_LOSS_FIELDS, MissingFramesAndPacketsMap};
use rtcp::compound::{ReceiverPacketParams, RtcpBuilder, RtcpParser};
use rtcp::header::MAX_IP_PACKET_SIZE;
use rtcp::receiver_log::{CastLoggingEvent, ReceiverLogEvent};
use rtcp::receiver_report::ReportBlock;
use rtp::packet::ALL_PACKETS_LOST;
use rtp::wrap::FrameIdWrapHelper;
use shared::error::Result;
use std::time::Duration;

const SENDER_SSRC: u32 = 11;
const RECEIVER_SSRC: u32 = 22;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn packet_events(count: usize) -> Vec<(u32, ReceiverLogEvent)> {
    (0..count)
        .map(|i| {
            (
                (i / 10) as u32 * 3000,
                ReceiverLogEvent {
                    kind: CastLoggingEvent::PacketReceived,
                    event_timestamp_ms: 10_000 + i as u64,
                    delay_delta_ms: 0,
                    packet_id: (i % 10) as u16,
                },
            )
        })
        .collect()
}

#[test]
fn test_feedback_loss_fields_capped_and_packet_fits() -> Result<()> {
    init_logger();
    let mut missing = MissingFramesAndPacketsMap::new();
    for frame_id in 1..300u32 {
        // every other packet so no bitmask can merge them
        missing.insert(frame_id, [0u16, 20, 40].into_iter().collect());
    }
    let message = CastMessage {
        media_ssrc: SENDER_SSRC,
        ack_frame_id: 0,
        missing_frames_and_packets: missing,
        target_delay: Duration::from_millis(100),
    };
    let events = packet_events(500);

    let mut builder = RtcpBuilder::new(RECEIVER_SSRC);
    let raw = builder.build_receiver_packet(&ReceiverPacketParams {
        report_block: Some(ReportBlock {
            media_ssrc: SENDER_SSRC,
            ..Default::default()
        }),
        rrtr: Some((1, 2)),
        cast_message: Some(&message),
        receiver_events: Some(&events),
    })?;
    assert!(raw.len() <= MAX_IP_PACKET_SIZE);

    let report = RtcpParser::new(SENDER_SSRC, RECEIVER_SSRC).parse(&raw)?;
    let feedback = report.cast_feedback.expect("feedback");
    assert_eq!(feedback.loss_fields.len(), MAX_CAST_LOSS_FIELDS);
    assert!(!report.receiver_log.is_empty());
    Ok(())
}

#[test]
fn test_feedback_widened_on_sender() -> Result<()> {
    init_logger();
    let mut missing = MissingFramesAndPacketsMap::new();
    missing.insert(258, [ALL_PACKETS_LOST].into_iter().collect());
    missing.insert(259, [1u16, 2, 5].into_iter().collect());
    let message = CastMessage {
        media_ssrc: SENDER_SSRC,
        ack_frame_id: 257,
        missing_frames_and_packets: missing.clone(),
        target_delay: Duration::from_millis(250),
    };

    let mut builder = RtcpBuilder::new(RECEIVER_SSRC);
    let raw = builder.build_receiver_packet(&ReceiverPacketParams {
        cast_message: Some(&message),
        ..Default::default()
    })?;

    let report = RtcpParser::new(SENDER_SSRC, RECEIVER_SSRC).parse(&raw)?;
    let feedback = report.cast_feedback.expect("feedback");

    let mut wrap = FrameIdWrapHelper::new(250);
    let widened = CastMessage::from_feedback(&feedback, &mut wrap);
    assert_eq!(widened.ack_frame_id, 257);
    assert_eq!(widened.missing_frames_and_packets, missing);
    assert_eq!(widened.target_delay, Duration::from_millis(250));
    Ok(())
}
