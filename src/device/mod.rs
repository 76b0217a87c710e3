//! Persistent garden device.
//!
//! [`GardenDevice`] is the single owner of the arbiter, the freshness filter and
//! the subscription bookkeeping. Its run loop multiplexes the session's event
//! channel and the tick timer, so a remote command and a local rule decision are
//! never evaluated concurrently.

pub mod telemetry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actuation::{Arbiter, FreshnessFilter, Relay, Source, Transition};
use crate::mqtt::messages::{CommandMessage, Topic};
use crate::mqtt::resubscribe::{ResubscriptionManager, SubscriptionError};
use crate::mqtt::{SessionEvent, Transport};
use crate::sun::SunSchedule;
use telemetry::TelemetryPublisher;

/// The three kinds of garden process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceRole {
    /// Publishes telemetry and applies remote commands.
    Sensor,
    /// One-shot manual controller.
    Controller,
    /// A sensor device that also runs the sun and moisture rules.
    Automated,
}

impl DeviceRole {
    /// The static subscription set of the role.
    pub fn subscriptions(&self) -> Vec<String> {
        let topics: &[Topic] = match self {
            DeviceRole::Sensor | DeviceRole::Automated => &[Topic::LightStatus, Topic::WaterStatus],
            DeviceRole::Controller => &[Topic::SensorData],
        };
        topics.iter().map(|topic| topic.as_str().to_string()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("{0:?} is not a persistent device role")]
    UnsupportedRole(DeviceRole),

    #[error("Session event channel closed")]
    EventChannelClosed,
}

pub struct GardenDevice<T: Transport> {
    role: DeviceRole,
    transport: T,
    arbiter: Arbiter,
    freshness: FreshnessFilter,
    subscriptions: ResubscriptionManager,
    telemetry: TelemetryPublisher,
    schedule: Option<SunSchedule>,
    interval: Duration,
}

impl<T: Transport> GardenDevice<T> {
    /// `schedule` is required for, and only used by, the automated role.
    pub fn new(
        role: DeviceRole,
        transport: T,
        arbiter: Arbiter,
        telemetry: TelemetryPublisher,
        schedule: Option<SunSchedule>,
        interval: Duration,
    ) -> Result<Self, DeviceError> {
        if role == DeviceRole::Controller {
            return Err(DeviceError::UnsupportedRole(role));
        }
        if role == DeviceRole::Sensor && schedule.is_some() {
            debug!("Sensor role ignores the sun schedule");
        }
        Ok(Self {
            role,
            subscriptions: ResubscriptionManager::new(role.subscriptions(), QoS::AtLeastOnce),
            transport,
            arbiter,
            freshness: FreshnessFilter::new(),
            telemetry,
            schedule: if role == DeviceRole::Automated {
                schedule
            } else {
                None
            },
            interval,
        })
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn freshness(&self) -> &FreshnessFilter {
        &self.freshness
    }

    /// Installs the role's subscriptions.
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        info!("Starting {:?} device", self.role);
        self.subscriptions.subscribe_all(&self.transport).await?;
        Ok(())
    }

    /// Runs until the process is killed. Only fatal conditions return.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> Result<(), DeviceError> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Entering control loop with {:?} interval", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, Utc::now()).await?,
                    None => {
                        error!("Session event channel closed");
                        return Err(DeviceError::EventChannelClosed);
                    }
                },
            }
        }
    }

    pub async fn handle_event(
        &mut self,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<(), DeviceError> {
        match event {
            SessionEvent::Connected { session_present } => {
                debug!("Connected (session present: {})", session_present);
            }
            SessionEvent::Interrupted(e) => {
                warn!("Connection interrupted: {}", e);
                self.subscriptions.on_interrupted();
            }
            SessionEvent::Resumed { session_present } => {
                self.subscriptions
                    .on_resumed(&self.transport, session_present)
                    .await?;
            }
            SessionEvent::SubscribeSent { pkid } => self.subscriptions.on_subscribe_sent(pkid),
            SessionEvent::SubscribeAck { pkid, granted } => {
                self.subscriptions.on_subscribe_ack(pkid, &granted)?;
            }
            SessionEvent::Message { topic, payload } => self.handle_message(&topic, &payload, now),
            SessionEvent::PublishAck { pkid } => debug!("PUBACK {}", pkid),
            SessionEvent::Disconnected => warn!("Session disconnected"),
        }
        Ok(())
    }

    fn handle_message(&mut self, topic: &str, payload: &[u8], now: DateTime<Utc>) {
        let Some(relay) = Topic::from_name(topic).and_then(|topic| topic.relay()) else {
            debug!("Ignoring message on {}", topic);
            return;
        };
        debug!("New {} payload: {}", topic, String::from_utf8_lossy(payload));

        let command = match CommandMessage::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping malformed {} command: {}", relay, e);
                return;
            }
        };
        self.apply_command(relay, &command, Source::Remote, now);
    }

    /// Freshness filter, then arbiter.
    fn apply_command(
        &mut self,
        relay: Relay,
        command: &CommandMessage,
        source: Source,
        now: DateTime<Utc>,
    ) -> Transition {
        if !self.freshness.admit(relay, command.sent) {
            return Transition::Unchanged;
        }
        self.arbiter.request(relay, command.on, source, now)
    }

    /// One control cycle: telemetry, then the local rules.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        debug!("Tick at {} (connection {:?})", now, self.transport.state());
        let sample = self.telemetry.sample(now);
        if let Some(sample) = &sample {
            TelemetryPublisher::publish(&self.transport, sample, self.arbiter.status(), now).await;
        }

        if self.role != DeviceRole::Automated {
            return;
        }

        let light = self
            .schedule
            .as_mut()
            .and_then(|schedule| schedule.light_desired(now));
        if let Some(on) = light {
            self.apply_local(Relay::Light, on, now).await;
        }
        if let Some(sample) = sample {
            let on = self.arbiter.pump_desired(sample.capacitance);
            self.apply_local(Relay::Pump, on, now).await;
        }
    }

    /// Runs a local decision through the same path as a remote command and
    /// announces it on the relay's topic when it switched the relay.
    async fn apply_local(&mut self, relay: Relay, on: bool, now: DateTime<Utc>) {
        let command = CommandMessage::new(on, now);
        let transition = self.apply_command(relay, &command, Source::Local, now);
        if transition != (Transition::Switched { on }) {
            return;
        }

        let topic = Topic::for_relay(relay);
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {} command: {}", relay, e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(topic.as_str(), payload, QoS::AtLeastOnce)
            .await
        {
            warn!("Failed to announce {} decision on {}: {}", relay, topic, e);
        }
    }
}
