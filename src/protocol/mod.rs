mod packet;
mod handshake;

pub use packet::{read_frame, Command, Frame, Packet, Payload, UNKNOWN_SESSION};
pub use handshake::{initiator_handshake, reject_unknown_session, responder_handshake, ClientHello, MAX_STRING_LEN};
