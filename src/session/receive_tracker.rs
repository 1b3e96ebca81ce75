use tracing::trace;
use crate::protocol::{Packet, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// the packet is the direct successor of the last accepted one. `ack` is set if an ACK is
    ///  due for it.
    Accepted { payload: Payload, ack: Option<u64> },
    /// the packet was accepted before, typically as part of a replay
    Duplicate,
    /// there is a gap - the packet is dropped, and the peer is expected to replay after the
    ///  next reconnect
    OutOfOrder { expected: u64 },
}

/// Receiving half of a session: accepts packets strictly in order
pub struct ReceiveTracker {
    last_received: u64,
    ack_interval: u64,
}

impl ReceiveTracker {
    pub fn new(ack_interval: u64) -> ReceiveTracker {
        ReceiveTracker {
            last_received: 0,
            ack_interval,
        }
    }

    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    pub fn on_packet(&mut self, packet: Packet) -> Receipt {
        let expected = self.last_received + 1;

        if packet.sequence < expected {
            trace!("duplicate packet #{}", packet.sequence);
            return Receipt::Duplicate;
        }
        if packet.sequence > expected {
            return Receipt::OutOfOrder { expected };
        }

        self.last_received = packet.sequence;
        let ack = if packet.sequence % self.ack_interval == 0 {
            Some(packet.sequence)
        }
        else {
            None
        };
        Receipt::Accepted { payload: packet.payload, ack }
    }
}
