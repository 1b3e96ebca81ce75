use std::time::Duration;
use anyhow::bail;

/// Protocol identifier exchanged in both directions at the start of every transport connection.
pub const DEFAULT_PROTOCOL_ID: &str = "persist-proxy 0.0.1";

/// Settings shared by the initiating and the responding side. Both ends of a tunnel should use
///  the same values, though only the protocol id is actually checked.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub protocol_id: String,

    /// Interval between PING packets on an active transport connection, and between checks
    ///  of the heartbeat timeout
    pub heartbeat_interval: Duration,
    /// A transport connection on which no packet was accepted for this long is considered
    ///  dead, even if the underlying socket looks fine
    pub heartbeat_timeout: Duration,

    /// Fixed delay before the initiating side tries to connect again after losing its
    ///  transport connection or failing to establish one
    pub reconnect_delay: Duration,
    /// Upper bound for a single low-level connect attempt (to a candidate tunnel server, or to
    ///  the destination)
    pub connect_timeout: Duration,
    /// Upper bound for the protocol id / identity exchange on a fresh transport connection
    pub handshake_timeout: Duration,
    /// Once END went out in both directions, a session waits at most this long for the peer's
    ///  acknowledgement of its own END. After that it ends anyway.
    pub end_linger: Duration,

    /// The receiver sends an ACK every time the number of accepted packets reaches a multiple
    ///  of this
    pub ack_interval: u64,

    /// Maximum length of a single SEND_PACKET payload. A peer sending more than this is
    ///  treated as a broken transport connection.
    pub max_packet_len: u32,
    /// Size of the buffer used for reading from the downstream socket. Every read produces
    ///  at most one SEND_PACKET.
    pub read_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            end_linger: Duration::from_secs(30),
            ack_interval: 10,
            max_packet_len: 16*1024*1024,
            read_buffer_size: 16*1024,
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_id.is_empty() || self.protocol_id.len() > crate::protocol::MAX_STRING_LEN {
            bail!("protocol id must be between 1 and {} bytes long", crate::protocol::MAX_STRING_LEN);
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must not be zero");
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            bail!("heartbeat timeout ({:?}) must be longer than the heartbeat interval ({:?})", self.heartbeat_timeout, self.heartbeat_interval);
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            bail!("connect and handshake timeouts must not be zero");
        }
        if self.end_linger.is_zero() {
            bail!("END linger time must not be zero");
        }
        if self.ack_interval == 0 {
            bail!("ACK interval must not be zero");
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > self.max_packet_len as usize {
            bail!("read buffer size must be between 1 and the maximum packet length ({})", self.max_packet_len);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tunnel server endpoints (`host:port`). All of them are tried concurrently on every
    ///  connect, and the first one to accept the connection is used.
    pub candidates: Vec<String>,
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.candidates.is_empty() {
            bail!("at least one tunnel server endpoint is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The service (`host:port`) that sessions are forwarded to
    pub destination: String,
}
