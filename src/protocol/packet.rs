use std::io::ErrorKind;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::safe_converter::PrecheckedCast;

/// Reserved value of the sequence field: the responder has no session for the identity the
///  initiator presented, although the initiator claims to have received data in it
pub const UNKNOWN_SESSION: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    SendPacket = 2,
    End = 3,
    Ack = 4,
    Ping = 5,
    Pong = 6,

    // used by the reverse tunnel protocol, never valid in a tunnel session
    ReverseListen = 11,
    ReverseClientConnect = 12,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    End,
    /// the highest sequence number the sender has accepted
    Ack(u64),
    Ping,
    Pong,
}
impl Payload {
    pub fn command(&self) -> Command {
        match self {
            Payload::Data(_) => Command::SendPacket,
            Payload::End => Command::End,
            Payload::Ack(_) => Command::Ack,
            Payload::Ping => Command::Ping,
            Payload::Pong => Command::Pong,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// starts at 1 and increases by 1 per packet in each direction
    pub sequence: u64,
    pub payload: Payload,
}
impl Packet {
    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.sequence > 0 && self.sequence < UNKNOWN_SESSION as u64);

        buf.put_i64(self.sequence as i64);
        buf.put_u8(self.payload.command().into());
        match &self.payload {
            Payload::Data(data) => {
                buf.put_u32(data.len().prechecked_cast());
                buf.put_slice(data);
            }
            Payload::Ack(acked) => buf.put_u64(*acked),
            Payload::End | Payload::Ping | Payload::Pong => {}
        }
    }
}

/// Everything that can arrive in the sequence field's position on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// The peer wants everything above `last_received` (re-)sent. Sent once after the
    ///  handshake of every transport connection.
    ReplayRequest { last_received: u64 },
    UnknownSession,
}
impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Frame::Packet(packet) => packet.ser(buf),
            Frame::ReplayRequest { last_received } => {
                debug_assert!(*last_received <= i64::MAX as u64);
                buf.put_i64(-(*last_received as i64));
            }
            Frame::UnknownSession => buf.put_i64(UNKNOWN_SESSION),
        }
    }
}

/// Reads a single frame field by field. Returns `None` if the stream ends before the sequence
///  field is complete - a peer that stops in the middle of it is treated like a regular close.
///
/// NB: This is not cancellation safe - a frame that is partially read when the returned future
///      is dropped is lost, and the stream is out of sync afterwards.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, max_packet_len: u32) -> anyhow::Result<Option<Frame>> {
    let raw_sequence = match reader.read_i64().await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if raw_sequence == UNKNOWN_SESSION {
        return Ok(Some(Frame::UnknownSession));
    }
    if raw_sequence <= 0 {
        return Ok(Some(Frame::ReplayRequest { last_received: raw_sequence.unsigned_abs() }));
    }

    let tag = reader.read_u8().await?;
    let payload = match Command::try_from(tag) {
        Ok(Command::SendPacket) => {
            let len = reader.read_u32().await?;
            if len > max_packet_len {
                bail!("packet #{} has a payload of {} bytes, the configured maximum is {}", raw_sequence, len, max_packet_len);
            }
            let mut data = BytesMut::zeroed(len as usize);
            reader.read_exact(&mut data).await?;
            Payload::Data(data.freeze())
        }
        Ok(Command::End) => Payload::End,
        Ok(Command::Ack) => Payload::Ack(reader.read_u64().await?),
        Ok(Command::Ping) => Payload::Ping,
        Ok(Command::Pong) => Payload::Pong,
        Ok(cmd @ (Command::ReverseListen | Command::ReverseClientConnect)) => {
            bail!("packet #{}: command {:?} belongs to the reverse tunnel protocol", raw_sequence, cmd);
        }
        Err(_) => bail!("packet #{}: unknown command tag {}", raw_sequence, tag),
    };

    Ok(Some(Frame::Packet(Packet {
        sequence: raw_sequence as u64,
        payload,
    })))
}
