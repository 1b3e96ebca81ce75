use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::TunnelConfig;
use crate::net::BoxStream;
use crate::protocol::{Frame, Packet, Payload};
use crate::session::downstream::{Downstream, DownstreamEvent};
use crate::session::liveness::{Liveness, LivenessMonitor};
use crate::session::receive_tracker::{Receipt, ReceiveTracker};
use crate::session::send_sequencer::SendSequencer;
use crate::session::transport_link::{TransportEvent, TransportLink};
use crate::session::{SessionEvent, Step};

/// Session state and protocol logic shared by both sides. This is owned by a session actor,
///  which feeds it with the events from its channel and decides what to do with the
///  resulting [`Step`]s.
pub struct SessionCore {
    config: Arc<TunnelConfig>,
    events: mpsc::UnboundedSender<SessionEvent>,

    sequencer: SendSequencer,
    tracker: ReceiveTracker,
    liveness: LivenessMonitor,

    transport: Option<TransportLink>,
    last_generation: u64,

    downstream: Downstream,
    end_received: bool,
    linger_deadline: Option<Instant>,
}

impl SessionCore {
    pub fn new(config: Arc<TunnelConfig>, events: mpsc::UnboundedSender<SessionEvent>, downstream: Downstream) -> SessionCore {
        SessionCore {
            sequencer: SendSequencer::new(),
            tracker: ReceiveTracker::new(config.ack_interval),
            liveness: LivenessMonitor::new(config.heartbeat_timeout),
            transport: None,
            last_generation: 0,
            downstream,
            end_received: false,
            linger_deadline: None,
            config,
            events,
        }
    }

    /// Binds a transport connection that completed its handshake, replacing the current one
    ///  if there is one, and sends the replay request for it.
    pub fn attach_transport(&mut self, stream: BoxStream) {
        if let Some(old) = self.transport.take() {
            debug!("replacing transport connection #{}", old.generation());
            old.abort();
        }

        self.last_generation += 1;
        let link = TransportLink::spawn(stream, self.last_generation, self.config.max_packet_len, self.events.clone());
        debug!("attached transport connection #{}, last received #{}", link.generation(), self.tracker.last_received());

        self.sequencer.attach(link.outbound());
        self.sequencer.write_unsequenced(Frame::ReplayRequest { last_received: self.tracker.last_received() });
        self.transport = Some(link);
        self.liveness.arm();
    }

    /// Attaches a transport connection whose replay request was already read as part of the
    ///  handshake
    pub fn resume(&mut self, stream: BoxStream, peer_last_received: u64) -> anyhow::Result<()> {
        self.attach_transport(stream);
        self.sequencer.replay_from(peer_last_received)
    }

    pub fn detach(&mut self) {
        if let Some(link) = self.transport.take() {
            debug!("detaching transport connection #{}", link.generation());
            link.abort();
        }
        self.sequencer.detach();
        self.liveness.disarm();
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn on_transport_event(&mut self, generation: u64, event: TransportEvent) -> anyhow::Result<Step> {
        let current = self.transport.as_ref().map(|t| t.generation());
        if current != Some(generation) {
            trace!("ignoring event from replaced transport connection #{}: {:?}", generation, event);
            return Ok(Step::Continue);
        }

        match event {
            TransportEvent::Frame(frame) => self.on_frame(frame),
            TransportEvent::Closed => {
                info!("transport connection #{} was closed by the peer", generation);
                self.detach();
                Ok(Step::TransportLost)
            }
            TransportEvent::Failed(e) => {
                info!("transport connection #{} failed: {}", generation, e);
                self.detach();
                Ok(Step::TransportLost)
            }
        }
    }

    pub fn on_frame(&mut self, frame: Frame) -> anyhow::Result<Step> {
        match frame {
            Frame::ReplayRequest { last_received } => {
                self.liveness.touch();
                self.sequencer.replay_from(last_received)?;
                Ok(Step::Continue)
            }
            Frame::UnknownSession => Ok(Step::UnknownSession),
            Frame::Packet(packet) => {
                self.on_packet(packet);
                Ok(Step::Continue)
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        let sequence = packet.sequence;
        match self.tracker.on_packet(packet) {
            Receipt::Accepted { payload, ack } => {
                self.liveness.touch();
                if let Some(ack) = ack {
                    self.sequencer.send(Payload::Ack(ack));
                }

                match payload {
                    Payload::Data(data) => self.downstream.write(data),
                    Payload::End => {
                        debug!("received END");
                        self.end_received = true;
                        self.downstream.shutdown();
                        if ack.is_none() {
                            self.sequencer.send(Payload::Ack(sequence));
                        }
                        self.start_linger();
                    }
                    Payload::Ack(acked) => self.sequencer.on_ack(acked),
                    Payload::Ping => self.sequencer.send(Payload::Pong),
                    Payload::Pong => {}
                }
            }
            Receipt::Duplicate => {}
            Receipt::OutOfOrder { expected } => {
                debug!("received packet #{} while expecting #{} - dropping it", sequence, expected);
            }
        }
    }

    /// Called on every tick of the heartbeat interval
    pub fn on_heartbeat_tick(&mut self) -> Step {
        match self.liveness.check() {
            Liveness::Disarmed => Step::Continue,
            Liveness::Alive => {
                self.sequencer.send(Payload::Ping);
                Step::Continue
            }
            Liveness::TimedOut => {
                info!("no traffic from peer for {:?} - dropping transport connection", self.config.heartbeat_timeout);
                self.detach();
                Step::TransportLost
            }
        }
    }

    pub fn on_downstream_event(&mut self, event: DownstreamEvent) {
        match event {
            DownstreamEvent::Data(data) => {
                if self.sequencer.end_queued() {
                    warn!("discarding {} bytes read from the downstream socket after END", data.len());
                    return;
                }
                self.sequencer.send(Payload::Data(data));
            }
            DownstreamEvent::Closed => {
                debug!("downstream socket reached EOF");
                self.send_end();
            }
            DownstreamEvent::Failed(e) => {
                info!("reading from the downstream socket failed: {}", e);
                self.send_end();
            }
            DownstreamEvent::WriteFailed(e) => {
                info!("writing to the downstream socket failed: {} - discarding further data", e);
                self.downstream.discard();
                self.send_end();
            }
        }
    }

    pub fn connect_downstream(&mut self, stream: BoxStream) {
        self.downstream.connect(stream, self.config.read_buffer_size, self.events.clone());
    }

    pub fn destination_failed(&mut self, e: anyhow::Error) {
        warn!("could not connect to the destination: {}", e);
        self.downstream.discard();
        self.send_end();
    }

    fn send_end(&mut self) {
        if !self.sequencer.end_queued() {
            debug!("sending END");
            self.sequencer.send(Payload::End);
        }
        self.start_linger();
    }

    fn start_linger(&mut self) {
        if self.end_received && self.sequencer.end_queued() && self.linger_deadline.is_none() {
            trace!("END sent and received, waiting up to {:?} for the final ACK", self.config.end_linger);
            self.linger_deadline = Some(Instant::now() + self.config.end_linger);
        }
    }

    /// Both directions sent their END, and ours was acknowledged
    pub fn is_complete(&self) -> bool {
        self.end_received && self.sequencer.end_acknowledged()
    }

    /// Both directions sent their END, but the acknowledgement for ours did not arrive within
    ///  the linger time
    pub fn linger_expired(&self) -> bool {
        !self.is_complete() && self.linger_deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn sequencer(&self) -> &SendSequencer {
        &self.sequencer
    }

    pub fn last_received(&self) -> u64 {
        self.tracker.last_received()
    }

    /// Regular termination: everything that is queued is written before the connections close
    pub fn finish(mut self) {
        if let Some(link) = self.transport.take() {
            link.finish();
        }
        self.downstream.close();
    }

    pub fn abort(mut self) {
        if let Some(link) = self.transport.take() {
            link.abort();
        }
        self.downstream.abort();
    }
}
