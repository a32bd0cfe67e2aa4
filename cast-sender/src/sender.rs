//! The sans-IO Cast sender: one audio and one video stream over a shared
//! paced transport.

use log::{debug, error, warn};
use rtcp::cast_feedback::CastMessage;
use rtcp::receiver_log::ReceiverLogFrame;
use rtp::{EncodedFrame, PacketKey};
use shared::error::{Error, Result};
use shared::time::SystemInstant;
use shared::{TaggedBytesMut, TransportContext, TransportMessage};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config::{FrameSenderConfig, OperationalStatus, StreamKind, TransportOptions};
use crate::frame_sender::FrameSender;
use crate::pacer::OutboundQueue;
use crate::transport::{CastTransport, TransportEvent};

/// An encoded frame for one of the streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub kind: StreamKind,
    /// When the frame was handed over.
    pub now: Instant,
    pub frame: EncodedFrame,
}

/// Out-of-band input to [`CastSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderCommand {
    /// The socket accepts datagrams again after refusing some.
    TransportReady { now: Instant },
    SetTargetPlayoutDelay {
        kind: StreamKind,
        delay: Duration,
    },
    /// Frames still inside the encoder, not counting delivered ones.
    EncoderBacklog {
        kind: StreamKind,
        frames: usize,
        duration: Duration,
    },
    /// Accept media packets from `ssrc` and hand them up through
    /// `poll_read`.
    AddValidSsrc(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    StatusChanged {
        kind: StreamKind,
        status: OperationalStatus,
    },
    RoundTripTime {
        kind: StreamKind,
        rtt: Duration,
    },
    CastFeedback {
        kind: StreamKind,
        message: CastMessage,
    },
    /// Receiver log events, each reported once.
    ReceiverLog {
        kind: StreamKind,
        frames: Vec<ReceiverLogFrame>,
    },
    RetransmissionRejected(PacketKey),
    PacerQueueOverflow {
        queued: usize,
    },
    FrameDropped {
        kind: StreamKind,
        frame_id: u32,
    },
}

/// Sending half of the encoder hand-off queue. Cheap to clone and usable
/// from any thread.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    tx: mpsc::Sender<MediaFrame>,
}

impl FrameProducer {
    pub fn send(&self, frame: MediaFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::ErrInboxClosed)
    }
}

/// Receiving half of the hand-off queue, owned by the sender and drained
/// only from its own entry points.
#[derive(Debug)]
struct FrameInbox {
    rx: mpsc::Receiver<MediaFrame>,
    tx: mpsc::Sender<MediaFrame>,
}

impl FrameInbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        FrameInbox { rx, tx }
    }

    fn producer(&self) -> FrameProducer {
        FrameProducer {
            tx: self.tx.clone(),
        }
    }

    fn try_recv(&self) -> Option<MediaFrame> {
        self.rx.try_recv().ok()
    }
}

/// Builder for [`CastSender`].
///
/// # Example
///
/// ```ignore
/// use cast_sender::{CastSenderBuilder, FrameSenderConfig};
///
/// let mut sender = CastSenderBuilder::new()
///     .with_outbound_capacity(64)
///     .build();
/// sender.initialize_video(Instant::now(), FrameSenderConfig::video());
/// ```
#[derive(Default)]
pub struct CastSenderBuilder {
    transport_options: TransportOptions,
    outbound_capacity: Option<usize>,
    clock: Option<SystemInstant>,
    transport_context: TransportContext,
}

impl CastSenderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport_options(mut self, transport_options: TransportOptions) -> Self {
        self.transport_options = transport_options;
        self
    }

    /// Datagrams `poll_write` may hold before the pacer waits for
    /// [`SenderCommand::TransportReady`]. Unbounded by default.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = Some(capacity);
        self
    }

    /// Pins the mapping between `Instant` and wall clock time, for
    /// reproducible NTP timestamps.
    pub fn with_clock(mut self, clock: SystemInstant) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Addresses stamped on outgoing datagrams.
    pub fn with_transport_context(mut self, transport_context: TransportContext) -> Self {
        self.transport_context = transport_context;
        self
    }

    pub fn build(self) -> CastSender {
        let clock = self.clock.unwrap_or_else(SystemInstant::now);
        CastSender {
            transport: CastTransport::new(
                OutboundQueue::new(self.outbound_capacity),
                &self.transport_options,
                clock,
            ),
            transport_options: self.transport_options,
            transport_context: self.transport_context,

            audio: None,
            video: None,
            audio_status: OperationalStatus::Uninitialized,
            video_status: OperationalStatus::Uninitialized,

            inbox: FrameInbox::new(),
            last_now: clock.instant(clock.duration_since_unix_epoch()),
            closed: false,

            read_outs: VecDeque::new(),
            events: VecDeque::new(),
        }
    }
}

/// Sends an audio and a video stream to one Cast receiver.
///
/// Everything runs inside the `sansio::Protocol` calls of the owner:
/// datagrams come in through `handle_read`, frames through `handle_write`
/// or a [`FrameProducer`], and datagrams for the socket leave through
/// `poll_write`. Deferred work happens in `handle_timeout`.
pub struct CastSender {
    transport: CastTransport<OutboundQueue>,
    transport_options: TransportOptions,
    transport_context: TransportContext,

    audio: Option<FrameSender>,
    video: Option<FrameSender>,
    audio_status: OperationalStatus,
    video_status: OperationalStatus,

    inbox: FrameInbox,
    last_now: Instant,
    closed: bool,

    read_outs: VecDeque<TaggedBytesMut>,
    events: VecDeque<SenderEvent>,
}

impl CastSender {
    pub fn initialize_audio(&mut self, now: Instant, config: FrameSenderConfig) {
        self.initialize_stream(now, StreamKind::Audio, config);
    }

    pub fn initialize_video(&mut self, now: Instant, config: FrameSenderConfig) {
        self.initialize_stream(now, StreamKind::Video, config);
    }

    pub fn status(&self, kind: StreamKind) -> OperationalStatus {
        match kind {
            StreamKind::Audio => self.audio_status,
            StreamKind::Video => self.video_status,
        }
    }

    /// Socket options for the I/O layer.
    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// A handle for encoder threads. Frames sent through it are picked up
    /// by the next `handle_timeout` or [`CastSender::drain_inbox`].
    pub fn frame_producer(&self) -> FrameProducer {
        self.inbox.producer()
    }

    /// Sends every frame waiting in the hand-off queue.
    pub fn drain_inbox(&mut self, now: Instant) {
        while let Some(media) = self.inbox.try_recv() {
            self.send_frame(now, media.kind, media.frame);
        }
    }

    /// True if the encoder should skip a frame of `frame_duration` because
    /// too much is in flight already.
    pub fn should_drop_next_frame(&self, kind: StreamKind, frame_duration: Duration) -> bool {
        self.frame_sender(kind)
            .is_none_or(|sender| sender.should_drop_next_frame(frame_duration))
    }

    /// Bitrate for the next frame of `kind`, captured at `reference_time`.
    pub fn target_bitrate(
        &mut self,
        kind: StreamKind,
        reference_time: Instant,
        now: Instant,
    ) -> Option<u32> {
        self.frame_sender_mut(kind)
            .map(|sender| sender.target_bitrate(now, reference_time))
    }

    pub fn current_round_trip_time(&self, kind: StreamKind) -> Option<Duration> {
        self.frame_sender(kind)
            .and_then(|sender| sender.current_round_trip_time())
    }

    /// RTP timestamp of the receiver's last sender report for `kind`, with
    /// its reference time on the local clock.
    pub fn latest_lip_sync_times(&self, kind: StreamKind) -> Option<(u32, Instant)> {
        let sender = self.frame_sender(kind)?;
        self.transport
            .rtcp_session(sender.ssrc())
            .latest_lip_sync_times()
    }

    fn initialize_stream(&mut self, now: Instant, kind: StreamKind, config: FrameSenderConfig) {
        self.last_now = now;
        let result = config
            .validate(kind)
            .and_then(|_| self.transport.initialize_stream(kind, &config));

        let status = match result {
            Ok(()) => {
                let sender = FrameSender::new(now, kind, &config);
                match kind {
                    StreamKind::Audio => self.audio = Some(sender),
                    StreamKind::Video => self.video = Some(sender),
                }
                OperationalStatus::Initialized
            }
            Err(err) => {
                error!("{} stream rejected: {}", kind, err);
                OperationalStatus::from(&err)
            }
        };

        match kind {
            StreamKind::Audio => self.audio_status = status,
            StreamKind::Video => self.video_status = status,
        }
        self.events
            .push_back(SenderEvent::StatusChanged { kind, status });
    }

    fn frame_sender(&self, kind: StreamKind) -> Option<&FrameSender> {
        match kind {
            StreamKind::Audio => self.audio.as_ref(),
            StreamKind::Video => self.video.as_ref(),
        }
    }

    fn frame_sender_mut(&mut self, kind: StreamKind) -> Option<&mut FrameSender> {
        match kind {
            StreamKind::Audio => self.audio.as_mut(),
            StreamKind::Video => self.video.as_mut(),
        }
    }

    fn send_frame(&mut self, now: Instant, kind: StreamKind, frame: EncodedFrame) {
        self.last_now = now;
        let frame_id = frame.frame_id;
        let sender = match kind {
            StreamKind::Audio => self.audio.as_mut(),
            StreamKind::Video => self.video.as_mut(),
        };
        let Some(sender) = sender else {
            warn!("dropping {} frame {}: stream not initialized", kind, frame_id);
            self.events
                .push_back(SenderEvent::FrameDropped { kind, frame_id });
            return;
        };

        let accepted = !sender.should_drop_next_frame(sender.nominal_frame_duration())
            && sender.send_encoded_frame(now, &mut self.transport, frame);
        if !accepted {
            self.events
                .push_back(SenderEvent::FrameDropped { kind, frame_id });
        }
        self.process_transport_events(now);
    }

    fn process_transport_events(&mut self, now: Instant) {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::RoundTripTime { ssrc, rtt } => {
                    if let Some(sender) = self.sender_for_ssrc(ssrc) {
                        sender.on_measured_round_trip_time(rtt);
                        let kind = sender.kind();
                        self.events
                            .push_back(SenderEvent::RoundTripTime { kind, rtt });
                    }
                }
                TransportEvent::CastMessage { ssrc, message } => {
                    let sender = match (&mut self.audio, &mut self.video) {
                        (Some(audio), _) if audio.ssrc() == ssrc => audio,
                        (_, Some(video)) if video.ssrc() == ssrc => video,
                        _ => continue,
                    };
                    sender.on_received_cast_feedback(now, &mut self.transport, &message);
                    let kind = sender.kind();
                    self.events
                        .push_back(SenderEvent::CastFeedback { kind, message });
                }
                TransportEvent::ReceiverLog { ssrc, frames } => {
                    if let Some(sender) = self.sender_for_ssrc(ssrc) {
                        let kind = sender.kind();
                        self.events
                            .push_back(SenderEvent::ReceiverLog { kind, frames });
                    }
                }
                TransportEvent::RetransmissionRejected(key) => {
                    self.events
                        .push_back(SenderEvent::RetransmissionRejected(key));
                }
                TransportEvent::PacerQueueOverflow { queued } => {
                    self.events
                        .push_back(SenderEvent::PacerQueueOverflow { queued });
                }
            }
        }
    }

    fn sender_for_ssrc(&mut self, ssrc: u32) -> Option<&mut FrameSender> {
        [self.audio.as_mut(), self.video.as_mut()]
            .into_iter()
            .flatten()
            .find(|sender| sender.ssrc() == ssrc)
    }
}

impl sansio::Protocol<TaggedBytesMut, MediaFrame, SenderCommand> for CastSender {
    type Rout = TaggedBytesMut;
    type Wout = TaggedBytesMut;
    type Eout = SenderEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        self.last_now = msg.now;
        if let Some(message) = self.transport.handle_read(msg.now, msg.message) {
            self.read_outs.push_back(TransportMessage {
                now: msg.now,
                transport: msg.transport,
                message,
            });
        }
        self.process_transport_events(msg.now);
        Ok(())
    }

    /// Media packets from allowed SSRCs that are not RTCP for our streams.
    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: MediaFrame) -> Result<()> {
        if self.closed {
            return Err(Error::ErrSenderClosed);
        }
        if self.frame_sender(msg.kind).is_none() {
            return Err(Error::ErrStreamNotInitialized);
        }
        self.drain_inbox(msg.now);
        self.send_frame(msg.now, msg.kind, msg.frame);
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        let packet = self.transport.sink_mut().pop()?;
        Some(TransportMessage {
            now: self.last_now,
            transport: self.transport_context,
            message: packet[..].into(),
        })
    }

    fn handle_event(&mut self, cmd: SenderCommand) -> Result<()> {
        match cmd {
            SenderCommand::TransportReady { now } => {
                self.last_now = now;
                self.transport.on_transport_ready(now);
                self.process_transport_events(now);
            }
            SenderCommand::SetTargetPlayoutDelay { kind, delay } => {
                self.frame_sender_mut(kind)
                    .ok_or(Error::ErrStreamNotInitialized)?
                    .set_target_playout_delay(delay);
            }
            SenderCommand::EncoderBacklog {
                kind,
                frames,
                duration,
            } => {
                self.frame_sender_mut(kind)
                    .ok_or(Error::ErrStreamNotInitialized)?
                    .set_encoder_backlog(frames, duration);
            }
            SenderCommand::AddValidSsrc(ssrc) => self.transport.add_valid_ssrc(ssrc),
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.last_now = now;
        if self.closed {
            return Ok(());
        }
        self.drain_inbox(now);
        self.transport.handle_timeout(now);
        if let Some(audio) = self.audio.as_mut() {
            audio.handle_timeout(now, &mut self.transport);
        }
        if let Some(video) = self.video.as_mut() {
            video.handle_timeout(now, &mut self.transport);
        }
        self.process_transport_events(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        if self.closed {
            return None;
        }
        [
            self.transport.poll_timeout(),
            self.audio.as_ref().and_then(|sender| sender.poll_timeout()),
            self.video.as_ref().and_then(|sender| sender.poll_timeout()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            debug!("closing cast sender");
            self.closed = true;
        }
        Ok(())
    }
}
