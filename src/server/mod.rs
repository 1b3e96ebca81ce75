//! The responding side of the tunnel: accepts transport connections, maps them to sessions by
//!  the identity the initiator presents, and forwards each session to the destination.

mod server_session;
mod session_registry;

pub use server_session::SessionHandle;
pub use session_registry::{Admission, SessionRegistry};

use std::sync::Arc;
use anyhow::bail;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::{ServerConfig, TunnelConfig};
use crate::net::{BoxStream, Connector};
use crate::protocol::{reject_unknown_session, responder_handshake};
use server_session::spawn_server_session;

#[derive(Clone)]
pub struct TunnelServer {
    config: Arc<TunnelConfig>,
    server_config: Arc<ServerConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
}

impl TunnelServer {
    pub fn new(config: TunnelConfig, server_config: ServerConfig, connector: Arc<dyn Connector>) -> anyhow::Result<TunnelServer> {
        config.validate()?;

        Ok(TunnelServer {
            config: Arc::new(config),
            server_config: Arc::new(server_config),
            connector,
            registry: Default::default(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Performs the handshake on a freshly accepted transport connection, and hands it to the
    ///  session it belongs to. Returns once the connection is handed over or rejected.
    pub async fn adopt(&self, mut stream: BoxStream) -> anyhow::Result<()> {
        let hello = match timeout(self.config.handshake_timeout, responder_handshake(&mut stream, &self.config.protocol_id)).await {
            Ok(result) => result?,
            Err(_) => bail!("handshake did not complete within {:?}", self.config.handshake_timeout),
        };

        let admission = self.registry.admit(&hello.identity, hello.last_received, || spawn_server_session(
            hello.identity.clone(),
            self.config.clone(),
            self.server_config.clone(),
            self.connector.clone(),
            self.registry.clone(),
        )).await;

        let handle = match admission {
            Admission::Resume(handle) => {
                info!("resuming session {} after #{}", hello.identity, hello.last_received);
                handle
            }
            Admission::Create(handle) => {
                info!("new session {}", hello.identity);
                handle
            }
            Admission::Reject => {
                warn!("unknown session {} claims to have received #{} - rejecting", hello.identity, hello.last_received);
                return reject_unknown_session(&mut stream).await;
            }
        };

        handle.attach(stream, hello.last_received)
    }

    /// Accept loop for transport connections
    #[instrument(name="server", skip_all, fields(listen=?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for transport connection from {}: {}", peer_addr, e);
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.adopt_logged(Box::new(stream), peer_addr.to_string()).await {
                    info!("transport connection was not adopted: {}", e);
                }
            });
        }
    }

    #[instrument(name="transport", skip(self, stream))]
    async fn adopt_logged(&self, stream: BoxStream, peer: String) -> anyhow::Result<()> {
        debug!("accepted transport connection");
        self.adopt(stream).await
    }
}
