use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};

use crate::net::BoxStream;

/// Uppercasing echo service. Everything that happens is recorded in the log as
///  `"<connection number> <event>"`, with the received text (lowercased) as the event for data.
#[derive(Clone, Default)]
pub struct EchoServer {
    log: Arc<RwLock<Vec<String>>>,
    received: Arc<RwLock<Vec<u8>>>,
}

impl EchoServer {
    pub fn spawn(mut listener: mpsc::UnboundedReceiver<BoxStream>) -> EchoServer {
        let server = EchoServer::default();

        let result = server.clone();
        tokio::spawn(async move {
            let mut connection_number = 0;
            while let Some(stream) = listener.recv().await {
                connection_number += 1;
                server.log(format!("{} connected", connection_number)).await;
                tokio::spawn(server.clone().echo(connection_number, stream));
            }
        });
        result
    }

    async fn log(&self, entry: String) {
        self.log.write().await.push(entry);
    }

    async fn echo(self, connection_number: usize, mut stream: BoxStream) {
        let mut buf = vec![0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    self.log(format!("{} end", connection_number)).await;
                    let _ = stream.shutdown().await;
                    return;
                }
                Ok(n) => {
                    let data = &buf[..n];
                    self.received.write().await.extend_from_slice(data);
                    self.log(format!("{} {}", connection_number, String::from_utf8_lossy(data).to_lowercase())).await;

                    if stream.write_all(&data.to_ascii_uppercase()).await.is_err() {
                        self.log(format!("{} write failed", connection_number)).await;
                        return;
                    }
                }
                Err(_) => {
                    self.log(format!("{} failed", connection_number)).await;
                    return;
                }
            }
        }
    }

    pub async fn log_entries(&self) -> Vec<String> {
        self.log.read().await.clone()
    }

    /// everything received over all connections, in order
    pub async fn received(&self) -> Vec<u8> {
        self.received.read().await.clone()
    }
}
