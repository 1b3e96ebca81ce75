use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::protocol::packet::{read_frame, Frame};

/// Upper bound for strings in the handshake (protocol id, session identity)
pub const MAX_STRING_LEN: usize = 256;

fn put_string(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    if s.len() > MAX_STRING_LEN {
        bail!("string of length {} exceeds the maximum of {}", s.len(), MAX_STRING_LEN);
    }
    buf.put_u16(u16::try_from(s.len())?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, max_len: usize) -> anyhow::Result<String> {
    let len = reader.read_u16().await? as usize;
    if len > max_len {
        bail!("string of length {} exceeds the maximum of {}", len, max_len);
    }
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;
    Ok(String::from_utf8(raw)?)
}

async fn write_string<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, s: &str) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(2 + s.len());
    put_string(&mut buf, s)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn exchange_protocol_ids<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(stream: &mut S, protocol_id: &str) -> anyhow::Result<()> {
    write_string(stream, protocol_id).await?;
    let peer_protocol_id = read_string(stream, MAX_STRING_LEN).await?;
    if peer_protocol_id != protocol_id {
        bail!("peer speaks protocol {:?}, expected {:?}", peer_protocol_id, protocol_id);
    }
    trace!("protocol id {:?} confirmed by peer", protocol_id);
    Ok(())
}

/// The initiating side's part of the handshake: protocol id round trip, then the session
///  identity. The caller is expected to follow up with a replay request right away.
pub async fn initiator_handshake<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(stream: &mut S, protocol_id: &str, identity: &str) -> anyhow::Result<()> {
    exchange_protocol_ids(stream, protocol_id).await?;
    write_string(stream, identity).await
}

/// What the initiating side presents on a fresh transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub identity: String,
    pub last_received: u64,
}

/// The responding side's part of the handshake. Reads up to and including the initiator's
///  replay request and nothing beyond, so the stream can be handed on unbuffered.
pub async fn responder_handshake<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(stream: &mut S, protocol_id: &str) -> anyhow::Result<ClientHello> {
    exchange_protocol_ids(stream, protocol_id).await?;
    let identity = read_string(stream, MAX_STRING_LEN).await?;
    if identity.is_empty() {
        bail!("initiator presented an empty session identity");
    }

    // a replay request has no payload, so the packet length limit is irrelevant here
    match read_frame(stream, 0).await? {
        Some(Frame::ReplayRequest { last_received }) => {
            debug!("initiator presented identity {} with last received #{}", identity, last_received);
            Ok(ClientHello { identity, last_received })
        }
        Some(other) => bail!("expected a replay request after the identity, got {:?}", other),
        None => bail!("transport connection closed during handshake"),
    }
}

/// Tells the initiator that its session does not exist (any more), and closes the transport
///  connection.
pub async fn reject_unknown_session<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    Frame::UnknownSession.ser(&mut buf);
    stream.write_all(&buf).await?;
    stream.shutdown().await?;
    Ok(())
}
