//! The initiating side of the tunnel: accepts user connections and opens a resumable session
//!  to one of the tunnel servers for each of them.

mod client_session;
pub mod establisher;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::{ClientConfig, TunnelConfig};
use crate::net::{BoxStream, Connector};
use client_session::ClientSession;

#[derive(Clone)]
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    client_config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig, client_config: ClientConfig, connector: Arc<dyn Connector>) -> anyhow::Result<TunnelClient> {
        config.validate()?;
        client_config.validate()?;

        Ok(TunnelClient {
            config: Arc::new(config),
            client_config: Arc::new(client_config),
            connector,
        })
    }

    /// Starts a new session for a user connection. The returned handle completes when the
    ///  session is over, either regularly or because it was aborted.
    pub fn adopt(&self, user_stream: BoxStream) -> JoinHandle<()> {
        let identity = Uuid::new_v4().to_string();
        let short_id: String = identity.chars().take(8).collect();
        let span = info_span!("session", id = %short_id);

        let (session, event_receiver) = ClientSession::new(
            identity,
            user_stream,
            self.config.clone(),
            self.client_config.clone(),
            self.connector.clone(),
        );
        tokio::spawn(session.run(event_receiver).instrument(span))
    }

    /// Accept loop for user connections
    #[instrument(name="client", skip_all, fields(listen=?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for user connection from {}: {}", peer_addr, e);
            }
            debug!("user connection from {}", peer_addr);
            self.adopt(Box::new(stream));
        }
    }
}
