#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod cast_header;
pub mod frame;
pub mod header;
pub mod packet;
pub mod packet_storage;
pub mod packetizer;
pub mod parser;
pub mod wrap;

pub use frame::{Dependency, EncodedFrame};
pub use packet::{ALL_PACKETS_LOST, LAST_PACKET, PacketKey, PacketRef, SendPacketVector};
