use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, TunnelConfig};
use crate::net::{BoxStream, Connector};
use crate::session::{Downstream, SessionCore, SessionEvent, Step};
use crate::client::establisher::establish;

enum ConnectionState {
    Disconnected { retry_at: Instant },
    Connecting(JoinHandle<()>),
    Active,
}

enum Wakeup {
    Event(SessionEvent),
    Heartbeat,
    Retry,
}

/// The initiating side of one tunnel session: owns the user connection, and keeps a transport
///  connection to one of the tunnel servers until the session is complete.
pub struct ClientSession {
    identity: String,
    config: Arc<TunnelConfig>,
    client_config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,

    events: mpsc::UnboundedSender<SessionEvent>,
    core: SessionCore,
    state: ConnectionState,
}

impl ClientSession {
    pub fn new(identity: String, user_stream: BoxStream, config: Arc<TunnelConfig>, client_config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> (ClientSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let downstream = Downstream::connected(user_stream, config.read_buffer_size, events.clone());
        let core = SessionCore::new(config.clone(), events.clone(), downstream);

        let session = ClientSession {
            identity,
            config,
            client_config,
            connector,
            events,
            core,
            state: ConnectionState::Disconnected { retry_at: Instant::now() },
        };
        (session, event_receiver)
    }

    fn start_connecting(&mut self) {
        debug!("connecting to {:?}", self.client_config.candidates);

        let connector = self.connector.clone();
        let client_config = self.client_config.clone();
        let config = self.config.clone();
        let identity = self.identity.clone();
        let events = self.events.clone();

        self.state = ConnectionState::Connecting(tokio::spawn(async move {
            let result = establish(connector, &client_config.candidates, &config, &identity).await;
            let _ = events.send(SessionEvent::Established(result));
        }));
    }

    fn schedule_reconnect(&mut self) {
        debug!("reconnecting in {:?}", self.config.reconnect_delay);
        self.state = ConnectionState::Disconnected { retry_at: Instant::now() + self.config.reconnect_delay };
    }

    fn retry_at(&self) -> Option<Instant> {
        match &self.state {
            ConnectionState::Disconnected { retry_at } => Some(*retry_at),
            _ => None,
        }
    }

    pub async fn run(mut self, mut event_receiver: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("session started");

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start_connecting();

        loop {
            let retry_at = self.retry_at();
            let wakeup = select! {
                event = event_receiver.recv() => match event {
                    Some(event) => Wakeup::Event(event),
                    None => break,
                },
                _ = heartbeat.tick() => Wakeup::Heartbeat,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Wakeup::Retry,
            };

            let step = match wakeup {
                Wakeup::Event(event) => self.on_event(event),
                Wakeup::Heartbeat => Ok(self.core.on_heartbeat_tick()),
                Wakeup::Retry => {
                    self.start_connecting();
                    Ok(Step::Continue)
                }
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::TransportLost) => self.schedule_reconnect(),
                Ok(Step::UnknownSession) => {
                    error!("the tunnel server does not know this session (any more) - closing the user connection");
                    self.abort();
                    return;
                }
                Err(e) => {
                    error!("session can not be continued: {}", e);
                    self.abort();
                    return;
                }
            }

            if self.core.linger_expired() {
                warn!("END was not acknowledged within {:?} - ending the session", self.config.end_linger);
                self.core.finish();
                return;
            }
            if self.core.is_complete() {
                info!("session complete");
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
            SessionEvent::Established(Ok(stream)) => {
                self.core.attach_transport(stream);
                self.state = ConnectionState::Active;
                Ok(Step::Continue)
            }
            SessionEvent::Established(Err(e)) => {
                info!("could not establish a transport connection: {}", e);
                Ok(Step::TransportLost)
            }
            other => {
                warn!("unexpected event for a client session: {:?}", other);
                Ok(Step::Continue)
            }
        }
    }

    fn abort(self) {
        if let ConnectionState::Connecting(handle) = &self.state {
            handle.abort();
        }
        self.core.abort();
    }
}
