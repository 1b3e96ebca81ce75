//! A resumable tunnel for byte-stream connections. It carries a TCP-style byte stream from a
//!  user-facing socket through an intermediary link to a remote destination, and survives drops
//!  of that link without losing or duplicating application bytes.
//!
//! ## Roles
//!
//! * The *initiating side* ([`client`]) accepts user connections. For each of them it opens a
//!    transport connection to one of several candidate tunnel servers, presents a random
//!    session identity, and reconnects whenever the transport connection dies.
//! * The *responding side* ([`server`]) accepts transport connections, keeps a registry of
//!    sessions keyed by identity, connects each new session to the destination, and re-binds
//!    an existing session to a new transport connection when the same identity comes back.
//!
//! Both directions of a session are symmetric: every outgoing packet gets a sequence number and
//!  is kept in a replay cache until the peer acknowledges it, and every incoming packet is
//!  accepted only if it is the direct successor of the last accepted one.
//!
//! ## Wire format
//!
//! All numbers are in network byte order (BE).
//!
//! Handshake:
//! ```ascii
//! responder -> initiator: STRING(protocol id)
//! initiator -> responder: STRING(protocol id)
//! initiator -> responder: STRING(identity)
//! ```
//! where `STRING` is a u16 byte length followed by UTF-8 bytes. After the handshake both sides
//!  send a replay request (see below) carrying their last received sequence number.
//!
//! Steady state, repeated in both directions:
//! ```ascii
//! 0: sequence (i64)
//!     * > 0: a sequenced packet, followed by a command and its payload
//!     * <= 0: a replay request - the negated value is the sender's last received sequence,
//!        and the receiver re-sends everything it has cached above that
//!     * i64::MAX: 'unknown session', sent by the responder only
//! 8: command (u8)
//!     * 2 SEND_PACKET: u32 length, followed by that many bytes of application data
//!     * 3 END: no payload - the sender will send no more application data
//!     * 4 ACK: u64 - the highest sequence the sender has accepted
//!     * 5 PING, 6 PONG: no payload
//! ```
//!
//! Command tags 11 and 12 belong to the reverse tunnel protocol and are rejected here.
//!
//! ## Session lifecycle
//!
//! A session ends when both sides have sent END, received END, and seen their own END
//!  acknowledged. Until then, losing the transport connection only detaches it: the initiator
//!  reconnects after a fixed delay, and the responder waits for the initiator to come back.
//!  If the initiator comes back to a responder that does not know its identity although it
//!  claims to have received data before, the responder answers 'unknown session' and the
//!  initiator gives up.

pub mod client;
pub mod config;
pub mod listen_spec;
pub mod net;
pub mod protocol;
mod safe_converter;
pub mod server;
pub mod session;

#[cfg(test)]
pub mod test_util;
#[cfg(test)]
mod end_to_end_tests;
