use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

/// A duplex byte stream: a transport connection, a user connection or a destination connection.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl <T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// This is an abstraction for opening an outgoing connection, introduced to allow tunnels over
///  other carriers than TCP and to facilitate testing without real sockets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxStream>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxStream> {
        trace!("TCP: connecting to {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
