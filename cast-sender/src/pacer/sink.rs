use std::collections::VecDeque;

use rtp::PacketRef;

/// The datagram transport underneath the pacer.
pub trait PacketSink {
    /// Hands one packet to the transport. The packet is always taken; `false`
    /// asks the caller to stop until the transport reports it is ready again.
    fn send_packet(&mut self, packet: &PacketRef) -> bool;

    /// Running total of bytes handed to the transport.
    fn bytes_sent(&self) -> u64;
}

/// A [`PacketSink`] that queues datagrams for the owner to collect.
///
/// With a capacity set, `send_packet` reports backpressure once that many
/// datagrams are waiting.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<PacketRef>,
    capacity: Option<usize>,
    bytes_sent: u64,
}

impl OutboundQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        OutboundQueue {
            queue: VecDeque::new(),
            capacity,
            bytes_sent: 0,
        }
    }

    pub fn pop(&mut self) -> Option<PacketRef> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.capacity.is_none_or(|capacity| self.queue.len() < capacity)
    }
}

impl PacketSink for OutboundQueue {
    fn send_packet(&mut self, packet: &PacketRef) -> bool {
        self.bytes_sent += packet.len() as u64;
        self.queue.push_back(packet.clone());
        self.has_room()
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}
