use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

/// The UDP flow a datagram travels on. Cast media and RTCP share one socket,
/// so the pair of addresses is all the I/O layer needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    pub local_addr: SocketAddr,
    /// The Cast receiver.
    pub peer_addr: SocketAddr,
}

impl TransportContext {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        TransportContext {
            local_addr,
            peer_addr,
        }
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        TransportContext::new(unspecified, unspecified)
    }
}

/// A datagram together with when and where it was received or is to be sent.
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    pub now: Instant,
    pub transport: TransportContext,
    pub message: T,
}

pub type TaggedBytesMut = TransportMessage<BytesMut>;
