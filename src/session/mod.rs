//! The parts of a tunnel session that both sides share. Each session is driven by a single actor
//!  task that owns a [`SessionCore`]; all I/O happens in helper tasks that report back through
//!  [`SessionEvent`]s on the actor's channel.

mod downstream;
mod liveness;
mod receive_tracker;
mod send_sequencer;
mod session_core;
mod transport_link;

pub use downstream::{Downstream, DownstreamEvent};
pub use liveness::{Liveness, LivenessMonitor};
pub use receive_tracker::{Receipt, ReceiveTracker};
pub use send_sequencer::SendSequencer;
pub use session_core::SessionCore;
pub use transport_link::{Outbound, TransportEvent, TransportLink};

use crate::net::BoxStream;

pub enum SessionEvent {
    /// something happened on a transport connection - `generation` identifies the connection
    ///  so that late events from a replaced connection can be ignored
    Transport { generation: u64, event: TransportEvent },
    Downstream(DownstreamEvent),

    /// initiating side: outcome of a connection establishment round, handshake included
    Established(anyhow::Result<BoxStream>),
    /// responding side: a transport connection presenting this session's identity, handshake done
    Attach { stream: BoxStream, peer_last_received: u64 },
    /// responding side: outcome of connecting to the destination
    DestinationConnected(anyhow::Result<BoxStream>),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Transport { generation, event } => write!(f, "Transport(#{}: {:?})", generation, event),
            SessionEvent::Downstream(event) => write!(f, "Downstream({:?})", event),
            SessionEvent::Established(result) => write!(f, "Established(ok: {})", result.is_ok()),
            SessionEvent::Attach { peer_last_received, .. } => write!(f, "Attach(peer last received: {})", peer_last_received),
            SessionEvent::DestinationConnected(result) => write!(f, "DestinationConnected(ok: {})", result.is_ok()),
        }
    }
}

/// What the session actor has to do after the core processed an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// the transport connection is gone (closed, failed or timed out) and was detached
    TransportLost,
    /// the peer has no session for this identity
    UnknownSession,
}
