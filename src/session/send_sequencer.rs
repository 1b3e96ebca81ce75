use std::collections::VecDeque;
use anyhow::bail;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::protocol::{Frame, Packet, Payload};
use crate::session::transport_link::Outbound;

/// The sending half of a session. It assigns sequence numbers, keeps every sequenced packet in
///  a replay cache until the peer acknowledges it, and writes packets to the current transport
///  connection (if any).
///
/// After a transport connection is attached, the sequencer is not *live* until the peer's
///  replay request arrives: until then, payloads are queued unsequenced. This guarantees that
///  the packets on any single transport connection are strictly ascending, starting right after
///  the peer's last received packet.
pub struct SendSequencer {
    next_sequence: u64,
    /// ordered by sequence number, without gaps
    replay_cache: VecDeque<Packet>,
    /// payloads that were sent while no live transport connection was available
    pending: VecDeque<Payload>,

    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    live: bool,

    end_sequence: Option<u64>,
    end_queued: bool,
    last_acked: u64,
}

impl Default for SendSequencer {
    fn default() -> Self {
        SendSequencer::new()
    }
}

impl SendSequencer {
    pub fn new() -> SendSequencer {
        SendSequencer {
            next_sequence: 1,
            replay_cache: VecDeque::new(),
            pending: VecDeque::new(),
            outbound: None,
            live: false,
            end_sequence: None,
            end_queued: false,
            last_acked: 0,
        }
    }

    pub fn send(&mut self, payload: Payload) {
        if payload == Payload::End {
            if self.end_queued {
                warn!("END was already sent - ignoring");
                return;
            }
            self.end_queued = true;
        }

        if self.live {
            self.sequence_and_write(payload);
        }
        else {
            trace!("no live transport connection - queueing {:?}", payload.command());
            self.pending.push_back(payload);
        }
    }

    fn sequence_and_write(&mut self, payload: Payload) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if payload == Payload::End {
            self.end_sequence = Some(sequence);
        }

        let packet = Packet { sequence, payload };
        self.write(&Frame::Packet(packet.clone()));
        self.replay_cache.push_back(packet);
    }

    fn write(&mut self, frame: &Frame) {
        let Some(outbound) = &self.outbound else {
            return;
        };

        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        if outbound.send(Outbound::Bytes(buf.freeze())).is_err() {
            // the writer task is gone, and the transport event reporting that is on its way
            debug!("transport connection's writer is gone");
        }
    }

    /// Binds a new transport connection. The sequencer stays non-live until [`Self::replay_from`]
    ///  is called with the peer's replay request.
    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<Outbound>) {
        self.outbound = Some(outbound);
        self.live = false;
    }

    pub fn detach(&mut self) {
        self.outbound = None;
        self.live = false;
    }

    /// Writes a frame that is not part of the sequenced stream, e.g. a replay request
    pub fn write_unsequenced(&mut self, frame: Frame) {
        debug_assert!(!matches!(frame, Frame::Packet(_)));
        self.write(&frame);
    }

    /// Handles the peer's replay request: everything up to `peer_last_received` counts as
    ///  acknowledged, everything after it is re-sent, followed by the payloads that were queued
    ///  while there was no live connection.
    ///
    /// Fails if the peer asks for packets that are no longer in the cache, or claims to have
    ///  received packets that were never sent. The session can not be continued in that case.
    pub fn replay_from(&mut self, peer_last_received: u64) -> anyhow::Result<()> {
        if peer_last_received >= self.next_sequence {
            bail!("peer claims to have received #{}, but the highest sequence sent is #{}", peer_last_received, self.next_sequence - 1);
        }
        if peer_last_received < self.last_acked {
            bail!("peer requests replay from #{}, but #{} was acknowledged already", peer_last_received + 1, self.last_acked);
        }

        self.on_ack(peer_last_received);

        debug!("replaying {} cached packets after #{}, then {} pending", self.replay_cache.len(), peer_last_received, self.pending.len());
        for i in 0..self.replay_cache.len() {
            let frame = Frame::Packet(self.replay_cache[i].clone());
            self.write(&frame);
        }

        if self.outbound.is_some() {
            while let Some(payload) = self.pending.pop_front() {
                self.sequence_and_write(payload);
            }
            self.live = true;
        }
        Ok(())
    }

    pub fn on_ack(&mut self, acked: u64) {
        if acked >= self.next_sequence {
            warn!("received ACK for #{} which was never sent - ignoring", acked);
            return;
        }
        if acked <= self.last_acked {
            return;
        }

        self.last_acked = acked;
        while let Some(front) = self.replay_cache.front() {
            if front.sequence > acked {
                break;
            }
            self.replay_cache.pop_front();
        }
        trace!("ACK #{} - {} packets left in the replay cache", acked, self.replay_cache.len());
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn cached_sequences(&self) -> Vec<u64> {
        self.replay_cache.iter()
            .map(|p| p.sequence)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// true as soon as END was handed to the sequencer, even if it is not sequenced yet
    pub fn end_queued(&self) -> bool {
        self.end_queued
    }

    pub fn end_acknowledged(&self) -> bool {
        self.end_sequence
            .map(|s| self.last_acked >= s)
            .unwrap_or(false)
    }
}
