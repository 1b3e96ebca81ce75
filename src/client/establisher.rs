use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::net::{BoxStream, Connector};
use crate::protocol::initiator_handshake;

type Attempt = (String, anyhow::Result<BoxStream>);

/// Opens a transport connection for a session: races all candidates, and performs the
///  handshake on the winner. The caller still has to send the replay request.
pub async fn establish(connector: Arc<dyn Connector>, candidates: &[String], config: &TunnelConfig, identity: &str) -> anyhow::Result<BoxStream> {
    let mut stream = race_candidates(connector, candidates, config.connect_timeout).await?;

    match timeout(config.handshake_timeout, initiator_handshake(&mut stream, &config.protocol_id, identity)).await {
        Ok(result) => result?,
        Err(_) => bail!("handshake did not complete within {:?}", config.handshake_timeout),
    }
    Ok(stream)
}

/// Connects to all candidates concurrently and returns the first connection that is
///  established. Connections completing after that are closed in the background.
pub async fn race_candidates(connector: Arc<dyn Connector>, candidates: &[String], connect_timeout: Duration) -> anyhow::Result<BoxStream> {
    let mut attempts: JoinSet<Attempt> = JoinSet::new();
    for candidate in candidates {
        let connector = connector.clone();
        let candidate = candidate.clone();
        attempts.spawn(async move {
            let result = match timeout(connect_timeout, connector.connect(&candidate)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("no connection within {:?}", connect_timeout)),
            };
            (candidate, result)
        });
    }

    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok((candidate, Ok(stream))) => {
                debug!("connected to {}", candidate);
                if !attempts.is_empty() {
                    tokio::spawn(close_late_connections(attempts));
                }
                return Ok(stream);
            }
            Ok((candidate, Err(e))) => debug!("connecting to {} failed: {}", candidate, e),
            Err(e) => warn!("connection attempt did not complete: {}", e),
        }
    }

    bail!("none of the tunnel servers {:?} could be reached", candidates)
}

async fn close_late_connections(mut attempts: JoinSet<Attempt>) {
    while let Some(joined) = attempts.join_next().await {
        if let Ok((candidate, Ok(mut stream))) = joined {
            trace!("closing late connection to {}", candidate);
            let _ = stream.shutdown().await;
        }
    }
}
