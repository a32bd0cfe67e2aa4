#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod congestion;
pub mod frame_sender;
pub mod pacer;
pub mod rtcp_session;
pub mod sender;
pub mod transport;

pub use config::{Codec, FrameSenderConfig, OperationalStatus, StreamKind, TransportOptions};
pub use sender::{
    CastSender, CastSenderBuilder, FrameProducer, MediaFrame, SenderCommand, SenderEvent,
};
