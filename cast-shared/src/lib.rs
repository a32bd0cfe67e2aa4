#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "crypto")]
pub mod crypto;

#[cfg(feature = "marshal")]
pub mod marshal;

pub mod error;
pub mod time;
pub(crate) mod transport;
pub mod util;

pub use transport::{TaggedBytesMut, TransportContext, TransportMessage};
