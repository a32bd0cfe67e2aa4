#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod cast_feedback;
pub mod compound;
pub mod extended_report;
pub mod header;
pub mod receiver_log;
pub mod receiver_report;
pub mod sender_report;

pub use cast_feedback::{CastFeedback, CastMessage};
pub use compound::{ReceiverPacketParams, RtcpBuilder, RtcpParser, RtcpReport};
