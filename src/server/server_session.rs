use std::sync::Arc;
use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ServerConfig, TunnelConfig};
use crate::net::{BoxStream, Connector};
use crate::server::session_registry::SessionRegistry;
use crate::session::{Downstream, SessionCore, SessionEvent, Step};

/// A registry entry: the way to hand transport connections to a running session
#[derive(Clone)]
pub struct SessionHandle {
    identity: String,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHandle({})", self.identity)
    }
}

impl SessionHandle {
    pub fn new(identity: String, events: mpsc::UnboundedSender<SessionEvent>) -> SessionHandle {
        SessionHandle { identity, events }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// true if the session is over
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Hands a transport connection to the session. Fails if the session is over, dropping
    ///  the connection.
    pub fn attach(&self, stream: BoxStream, peer_last_received: u64) -> anyhow::Result<()> {
        if self.events.send(SessionEvent::Attach { stream, peer_last_received }).is_err() {
            bail!("session {} is over", self.identity);
        }
        Ok(())
    }
}

struct ServerSession {
    identity: String,
    config: Arc<TunnelConfig>,
    registry: Arc<SessionRegistry>,
    core: SessionCore,
}

enum Wakeup {
    Event(SessionEvent),
    Heartbeat,
}

/// Starts the actor for a new session and connects it to the destination. The session
///  unregisters itself when it is over.
pub fn spawn_server_session(
    identity: String,
    config: Arc<TunnelConfig>,
    server_config: Arc<ServerConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
) -> SessionHandle {
    let (events, event_receiver) = mpsc::unbounded_channel();
    let short_id: String = identity.chars().take(8).collect();
    let span = info_span!("session", id = %short_id);

    {
        let events = events.clone();
        let destination = server_config.destination.clone();
        let connect_timeout = config.connect_timeout;
        tokio::spawn(async move {
            debug!("connecting to destination {}", destination);
            let result = match timeout(connect_timeout, connector.connect(&destination)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("no connection to {} within {:?}", destination, connect_timeout)),
            };
            let _ = events.send(SessionEvent::DestinationConnected(result));
        }.instrument(span.clone()));
    }

    let session = ServerSession {
        identity: identity.clone(),
        core: SessionCore::new(config.clone(), events.clone(), Downstream::connecting()),
        config,
        registry,
    };
    tokio::spawn(session.run(event_receiver).instrument(span));

    SessionHandle::new(identity, events)
}

impl ServerSession {
    async fn run(mut self, mut event_receiver: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("session started");

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wakeup = select! {
                event = event_receiver.recv() => match event {
                    Some(event) => Wakeup::Event(event),
                    None => break,
                },
                _ = heartbeat.tick() => Wakeup::Heartbeat,
            };

            let step = match wakeup {
                Wakeup::Event(event) => self.on_event(event),
                Wakeup::Heartbeat => Ok(self.core.on_heartbeat_tick()),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::TransportLost) => debug!("waiting for the initiator to reconnect"),
                Ok(Step::UnknownSession) => {
                    warn!("initiator sent the unknown-session marker, which is reserved for the responding side - dropping the transport connection");
                    self.core.detach();
                }
                Err(e) => {
                    error!("session can not be continued: {}", e);
                    self.registry.remove(&self.identity).await;
                    self.core.abort();
                    return;
                }
            }

            if self.core.linger_expired() {
                warn!("END was not acknowledged within {:?} - ending the session", self.config.end_linger);
                self.registry.remove(&self.identity).await;
                self.core.finish();
                return;
            }
            if self.core.is_complete() {
                info!("session complete");
                self.registry.remove(&self.identity).await;
                self.core.finish();
                return;
            }
        }
    }

    fn on_event(&mut self, event: SessionEvent) -> anyhow::Result<Step> {
        match event {
            SessionEvent::Transport { generation, event } => self.core.on_transport_event(generation, event),
            SessionEvent::Downstream(event) => {
                self.core.on_downstream_event(event);
                Ok(Step::Continue)
            }
            SessionEvent::Attach { stream, peer_last_received } => {
                if self.core.is_attached() {
                    info!("initiator reconnected while the previous transport connection was still attached");
                }
                self.core.resume(stream, peer_last_received)?;
                Ok(Step::Continue)
            }
            SessionEvent::DestinationConnected(Ok(stream)) => {
                debug!("connected to destination");
                self.core.connect_downstream(stream);
                Ok(Step::Continue)
            }
            SessionEvent::DestinationConnected(Err(e)) => {
                self.core.destination_failed(e);
                Ok(Step::Continue)
            }
            other => {
                warn!("unexpected event for a server session: {:?}", other);
                Ok(Step::Continue)
            }
        }
    }
}
