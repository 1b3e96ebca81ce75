use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::net::{BoxStream, Connector};

struct Link {
    paused: Arc<AtomicBool>,
    relays: [JoinHandle<()>; 2],
}

#[derive(Default)]
struct MemoryNetInner {
    listeners: FxHashMap<String, mpsc::UnboundedSender<BoxStream>>,
    links: Vec<Link>,
    connection_counts: FxHashMap<String, usize>,
}

/// An in-memory network: listeners are registered by address, and every connection goes through
///  a relay so tests can black-hole or cut all connections that exist at a given time.
#[derive(Default)]
pub struct MemoryNet {
    inner: RwLock<MemoryNetInner>,
}

impl MemoryNet {
    pub fn new() -> Arc<MemoryNet> {
        Default::default()
    }

    /// Registers a listener for an address, replacing any previous listener for it
    pub async fn listen(&self, addr: &str) -> mpsc::UnboundedReceiver<BoxStream> {
        let (send, receive) = mpsc::unbounded_channel();
        self.inner.write().await.listeners.insert(addr.to_string(), send);
        receive
    }

    pub async fn stop_listening(&self, addr: &str) {
        self.inner.write().await.listeners.remove(addr);
    }

    /// Existing connections silently drop everything, as if the network between the peers
    ///  went down
    pub async fn pause_all(&self) {
        for link in &self.inner.read().await.links {
            link.paused.store(true, Ordering::Release);
        }
    }

    /// Cuts all existing connections: both sides see the connection close
    pub async fn sever_all(&self) {
        for link in self.inner.write().await.links.drain(..) {
            for relay in &link.relays {
                relay.abort();
            }
        }
    }

    /// Number of connections that were opened to an address so far
    pub async fn connection_count(&self, addr: &str) -> usize {
        self.inner.read().await.connection_counts.get(addr).cloned().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryNet {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxStream> {
        let mut inner = self.inner.write().await;
        let Some(listener) = inner.listeners.get(addr).cloned() else {
            bail!("connection refused: {}", addr);
        };

        let (client_side, client_relay) = duplex(64*1024);
        let (server_relay, server_side) = duplex(64*1024);
        if listener.send(Box::new(server_side)).is_err() {
            inner.listeners.remove(addr);
            bail!("connection refused: {}", addr);
        }

        let paused = Arc::new(AtomicBool::new(false));
        let (client_read, client_write) = tokio::io::split(client_relay);
        let (server_read, server_write) = tokio::io::split(server_relay);
        inner.links.push(Link {
            relays: [
                tokio::spawn(relay(client_read, server_write, paused.clone())),
                tokio::spawn(relay(server_read, client_write, paused.clone())),
            ],
            paused,
        });
        *inner.connection_counts.entry(addr.to_string()).or_default() += 1;

        trace!("connected to {}", addr);
        Ok(Box::new(client_side))
    }
}

async fn relay(mut from: ReadHalf<DuplexStream>, mut to: WriteHalf<DuplexStream>, paused: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if paused.load(Ordering::Acquire) {
                    continue;
                }
                if to.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    if !paused.load(Ordering::Acquire) {
        let _ = to.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_transfer() {
        let net = MemoryNet::new();
        let mut listener = net.listen("a:1").await;

        let mut client = net.connect("a:1").await.unwrap();
        let mut server = listener.recv().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(net.connection_count("a:1").await, 1);
        assert!(net.connect("b:1").await.is_err());
    }

    #[tokio::test]
    async fn test_sever_all() {
        let net = MemoryNet::new();
        let mut listener = net.listen("a:1").await;
        let mut client = net.connect("a:1").await.unwrap();
        let mut server = listener.recv().await.unwrap();

        net.sever_all().await;

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_all() {
        let net = MemoryNet::new();
        let mut listener = net.listen("a:1").await;
        let mut client = net.connect("a:1").await.unwrap();
        let mut server = listener.recv().await.unwrap();

        net.pause_all().await;
        client.write_all(b"lost").await.unwrap();

        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(std::time::Duration::from_secs(1), server.read_exact(&mut buf)).await;
        assert!(read.is_err());

        // new connections are not affected
        let mut client = net.connect("a:1").await.unwrap();
        let mut server = listener.recv().await.unwrap();
        client.write_all(b"kept").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"kept");
    }
}
