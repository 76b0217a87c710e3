//! Durable MQTT session on top of `rumqttc`.
//!
//! The rumqttc event loop is owned by a background task. Everything it sees that
//! the garden logic cares about is translated into a [`SessionEvent`] and pushed
//! through an mpsc channel, so the driver consumes reconnects, acknowledgements
//! and inbound messages from one place.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BackoffSettings, MqttConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to read TLS material {}: {source}", path.display())]
    TlsMaterial {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("No connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Event loop stopped before the broker acknowledged the connection")]
    EventLoopClosed,

    #[error("Client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("Nothing to subscribe to")]
    EmptySubscription,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// What the session reports back to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// First CONNACK of the process.
    Connected { session_present: bool },
    /// The connection dropped; the session is retrying on its own.
    Interrupted(String),
    /// A CONNACK after an interruption.
    Resumed { session_present: bool },
    Message { topic: String, payload: Vec<u8> },
    /// A SUBSCRIBE packet left with this packet id.
    SubscribeSent { pkid: u16 },
    /// SUBACK, one entry per requested filter; `None` when the broker refused it.
    SubscribeAck { pkid: u16, granted: Vec<Option<QoS>> },
    /// PUBACK for a QoS 1 publish of ours.
    PublishAck { pkid: u16 },
    Disconnected,
}

/// The narrow transport surface the garden logic depends on.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError>;

    /// Requests all `topics` in a single SUBSCRIBE packet.
    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    fn state(&self) -> ConnectionState;
}

/// Exponential reconnect delay.
#[derive(Clone, Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    current: Duration,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            current: settings.initial,
            settings,
        }
    }

    /// Returns the delay to wait now and doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.settings.max);
        self.current = (self.current * 2).min(self.settings.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.settings.initial;
    }
}

#[derive(Debug)]
pub struct MqttSession {
    client: AsyncClient,
    status: watch::Receiver<MQTTStatus>,
    shutdown: CancellationToken,
    event_loop_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Opens the connection and waits for the broker's CONNACK.
    pub async fn connect(
        config: &MqttConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        info!(
            "Connecting to {}:{} with client ID '{}'",
            config.endpoint, config.port, config.client_id
        );
        let options = config.mqtt_options().await?;
        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(MQTTStatus {
            connection_state: ConnectionState::Connecting,
            ..MQTTStatus::default()
        });
        let (connack_tx, connack_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let driver = EventLoopDriver {
            event_loop,
            events: event_tx,
            status: status_tx,
            connack: Some(connack_tx),
            backoff: Backoff::new(config.reconnect.clone()),
            shutdown: shutdown.clone(),
            disconnecting: false,
        };
        let task = tokio::spawn(driver.run());

        let session = Self {
            client,
            status: status_rx,
            shutdown,
            event_loop_task: std::sync::Mutex::new(Some(task)),
        };

        let acknowledged = match config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connack_rx).await {
                Ok(result) => result,
                Err(_) => {
                    session.shutdown.cancel();
                    return Err(SessionError::ConnectTimeout(limit));
                }
            },
            None => connack_rx.await,
        };

        match acknowledged {
            Ok(Ok(session_present)) => {
                info!("Connected! (session present: {})", session_present);
                Ok((session, event_rx))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::EventLoopClosed),
        }
    }

    pub fn status(&self) -> watch::Receiver<MQTTStatus> {
        self.status.clone()
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        // Best effort: a full request queue during an outage is reported, not waited out.
        self.client.try_publish(topic, qos, false, payload)?;
        debug!("Queued publish to {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), SessionError> {
        if topics.is_empty() {
            return Err(SessionError::EmptySubscription);
        }
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos));
        self.client.subscribe_many(filters).await?;
        debug!("Queued subscription to {:?}", topics);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        info!("Disconnecting...");
        self.client.disconnect().await?;

        let task = self
            .event_loop_task
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, task).await.is_err() {
                warn!("Event loop did not finish within {:?}, stopping it", DISCONNECT_GRACE);
                self.shutdown.cancel();
            }
        }
        info!("Disconnected!");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().connection_state.clone()
    }
}

struct EventLoopDriver {
    event_loop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    status: watch::Sender<MQTTStatus>,
    connack: Option<oneshot::Sender<Result<bool, SessionError>>>,
    backoff: Backoff,
    shutdown: CancellationToken,
    disconnecting: bool,
}

impl EventLoopDriver {
    async fn run(mut self) {
        debug!("MQTT event loop task started");
        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    if self.disconnecting {
                        debug!("Connection closed after disconnect: {}", e);
                        self.emit(SessionEvent::Disconnected).await;
                        break;
                    }
                    if let Some(connack) = self.connack.take() {
                        error!("Initial connection failed: {}", e);
                        self.update_state(ConnectionState::Disconnected, Some(e.to_string()));
                        let _ = connack.send(Err(SessionError::Connect(e.to_string())));
                        break;
                    }

                    let delay = self.backoff.next_delay();
                    warn!("Connection interrupted. error: {} (retrying in {:?})", e, delay);
                    self.update_state(ConnectionState::Reconnecting, Some(e.to_string()));
                    self.emit(SessionEvent::Interrupted(e.to_string())).await;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.update_state(ConnectionState::Disconnected, None);
        debug!("MQTT event loop task finished");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.backoff.reset();
                self.update_state(ConnectionState::Connected, None);
                match self.connack.take() {
                    Some(connack) => {
                        let _ = connack.send(Ok(ack.session_present));
                        self.emit(SessionEvent::Connected {
                            session_present: ack.session_present,
                        })
                        .await;
                    }
                    None => {
                        info!(
                            "Connection resumed. return_code: {:?} session_present: {}",
                            ack.code, ack.session_present
                        );
                        self.emit(SessionEvent::Resumed {
                            session_present: ack.session_present,
                        })
                        .await;
                    }
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                });
                self.emit(SessionEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                })
                .await;
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => Some(*qos),
                        SubscribeReasonCode::Failure => None,
                    })
                    .collect();
                self.emit(SessionEvent::SubscribeAck {
                    pkid: ack.pkid,
                    granted,
                })
                .await;
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.emit(SessionEvent::PublishAck { pkid: ack.pkid }).await;
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.emit(SessionEvent::SubscribeSent { pkid }).await;
            }
            Event::Outgoing(Outgoing::Publish(_)) => {
                self.status.send_modify(|status| {
                    status.messages_sent += 1;
                    status.last_activity = Some(Local::now());
                });
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                // Keep polling so the DISCONNECT packet is flushed before the loop ends.
                self.disconnecting = true;
            }
            _ => {}
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }

    fn update_state(&self, state: ConnectionState, error: Option<String>) {
        self.status.send_modify(|status| {
            status.connection_state = state;
            if error.is_some() {
                status.last_error = error;
            }
        });
    }
}
